//! gestured - Gesture Guard daemon
//!
//! This daemon:
//! 1. Reads per-frame hand detections as JSON lines (file or stdin)
//! 2. Tracks hands across frames and stabilizes their gestures
//! 3. Writes confirmed gestures to the hash-chained event log
//! 4. Dispatches notifications through the configured channels
//! 5. Drains pending notifications on end of input or Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gesture_guard::{
    now_ms, DetectionSource, Dispatcher, EventSink, GestureGuardConfig, GesturePipeline,
    InMemoryEventLog, JsonlSource, SessionMetadata, SqliteEventLog,
};

#[derive(Parser, Debug)]
#[command(
    name = "gestured",
    version,
    about = "Track hands, confirm gestures and dispatch notifications"
)]
struct Args {
    /// JSON-lines detection stream ("-" for stdin)
    #[arg(long, default_value = "-", value_name = "PATH")]
    input: String,

    /// Session identifier (random if omitted)
    #[arg(long, env = "GESTURE_SESSION_ID")]
    session_id: Option<String>,

    /// Log events to memory only; nothing is written to disk
    #[arg(long)]
    no_persist: bool,

    /// Track and log gestures without sending notifications
    #[arg(long)]
    no_dispatch: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = GestureGuardConfig::load()?;

    let sqlite = if args.no_persist {
        None
    } else {
        let event_log = Arc::new(SqliteEventLog::open(&cfg.log.db_path)?);
        if let Some(retention) = cfg.log.retention {
            event_log.enforce_retention(retention)?;
        }
        log::info!("event log: {}", cfg.log.db_path);
        Some(event_log)
    };
    let sink: Arc<dyn EventSink> = match &sqlite {
        Some(event_log) => event_log.clone(),
        None => Arc::new(InMemoryEventLog::new()),
    };

    let dispatcher = if args.no_dispatch {
        log::info!("notification dispatch disabled");
        None
    } else {
        Some(
            Dispatcher::from_config(&cfg.dispatch)?
                .with_sink(Arc::clone(&sink))
                .spawn()?,
        )
    };

    let mut source: Box<dyn DetectionSource> = if args.input == "-" {
        Box::new(JsonlSource::stdin())
    } else {
        Box::new(JsonlSource::open(&PathBuf::from(&args.input))?)
    };

    let session_id = match args.session_id {
        Some(id) => id,
        None => random_session_id(),
    };
    let session = SessionMetadata::new(&session_id, now_ms()?, source.name())?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::SeqCst) {
                // Second signal while draining: give up immediately.
                std::process::exit(130);
            }
            log::info!("shutdown signal received, draining...");
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let mut pipeline = GesturePipeline::new(&cfg, session, sink, dispatcher);
    let run_result = pipeline.run(source.as_mut(), &stop);

    let summary = pipeline.finish(now_ms()?, cfg.dispatch.shutdown_grace);
    if let Some(report) = &summary.dispatch {
        for lane in &report.lanes {
            log::info!(
                "channel {}: submitted={} delivered={} retried={} dropped={}",
                lane.channel,
                lane.counters.submitted,
                lane.counters.delivered,
                lane.counters.retried,
                lane.counters.dropped
            );
        }
    }
    if summary.frames_out_of_order > 0 {
        log::warn!("{} out-of-order frame(s) skipped", summary.frames_out_of_order);
    }

    if let (Some(event_log), Some(retention)) = (&sqlite, cfg.log.retention) {
        event_log.enforce_retention(retention)?;
    }

    run_result
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("session-{}", hex::encode(bytes))
}
