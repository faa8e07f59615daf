//! gesture_log - Inspect and verify the Gesture Guard event log
//!
//! Subcommands:
//! - verify: recompute the hash chain and report the first broken row
//! - export: write logged gestures as CSV or JSON
//! - stats: per-session statistics and dispatch outcome counts
//! - system: recent lifecycle and alarm entries
//! - prune: apply a retention window (checkpointing the chain head)

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use gesture_guard::config::retention_from_days;
use gesture_guard::export::{write_events, ExportFormat};
use gesture_guard::storage::{LoggedEvent, SessionStats};
use gesture_guard::SqliteEventLog;

#[derive(Parser, Debug)]
#[command(name = "gesture_log", about = "Verify, export and summarise the gesture event log")]
struct Args {
    /// Path to the gesture SQLite DB
    #[arg(long, env = "GESTURE_DB_PATH", default_value = "gesture_guard.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify the event hash chain
    Verify {
        /// Print the chain head and checkpoint anchor
        #[arg(short, long)]
        verbose: bool,
    },
    /// Export logged gestures (oldest first)
    Export {
        /// Only events from this session
        #[arg(long)]
        session: Option<String>,
        /// Maximum number of (most recent) events
        #[arg(long, default_value_t = 10_000)]
        limit: usize,
        /// csv or json
        #[arg(long, default_value = "csv")]
        format: ExportFormat,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Session statistics and dispatch outcome counts
    Stats {
        /// Only this session (default: every session)
        #[arg(long)]
        session: Option<String>,
    },
    /// Recent system events (newest first) as JSON
    System {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete events older than the retention window
    Prune {
        #[arg(long, value_name = "DAYS")]
        retention_days: u64,
    },
}

#[derive(Serialize)]
struct StatsOutput {
    sessions: Vec<SessionStats>,
    dispatch: BTreeMap<String, u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if !Path::new(&args.db).exists() {
        return Err(anyhow!("event log {} does not exist", args.db));
    }
    let log = SqliteEventLog::open(&args.db)?;

    match args.command {
        Command::Verify { verbose } => {
            println!("gesture_log: checking {}", args.db);
            let report = log.verify()?;
            if verbose {
                match report.checkpoint_head {
                    Some(head) => println!("checkpoint head: {}", hex::encode(head)),
                    None => println!("checkpoint head: (none)"),
                }
                println!("chain head: {}", hex::encode(report.head));
            }
            match report.broken {
                None => {
                    println!("OK: {} event(s) verified", report.verified);
                    Ok(())
                }
                Some(broken) => Err(anyhow!(
                    "integrity check failed at id {} after {} verified event(s): {}",
                    broken.id,
                    report.verified,
                    broken.reason
                )),
            }
        }
        Command::Export {
            session,
            limit,
            format,
            output,
        } => {
            let mut events: Vec<LoggedEvent> = log.recent_events(session.as_deref(), limit)?;
            events.reverse();
            match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("create export file {}", path.display()))?;
                    write_events(&events, format, BufWriter::new(file))?;
                    eprintln!("exported {} event(s) to {}", events.len(), path.display());
                }
                None => write_events(&events, format, std::io::stdout().lock())?,
            }
            Ok(())
        }
        Command::Stats { session } => {
            let ids: Vec<String> = match session {
                Some(id) => vec![id],
                None => log
                    .sessions()?
                    .into_iter()
                    .map(|(meta, _)| meta.session_id)
                    .collect(),
            };
            let sessions = ids
                .iter()
                .map(|id| log.session_stats(id))
                .collect::<Result<Vec<_>>>()?;
            let out = StatsOutput {
                sessions,
                dispatch: log.dispatch_counts()?,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Command::System { limit } => {
            let events = log.system_events(limit)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
        Command::Prune { retention_days } => {
            let retention = retention_from_days(retention_days)?;
            match log.enforce_retention(retention)? {
                Some(id) => println!("pruned events up to id {}", id),
                None => println!("nothing older than {} day(s)", retention_days),
            }
            Ok(())
        }
    }
}
