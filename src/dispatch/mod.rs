//! Notification Dispatcher.
//!
//! `submit` hands an event to a router thread over an unbounded channel and
//! returns immediately. The router maps the event to a priority tier and
//! enqueues one job per eligible channel lane. Each lane owns a queue, a
//! token bucket, an adapter and a worker thread, so a slow or throttled
//! channel never holds up another.
//!
//! Job lifecycle:
//!
//! ```text
//! QUEUED -> IN_FLIGHT -> DELIVERED
//!                     -> FAILED_RETRYABLE -> QUEUED (after backoff)
//!                                         -> DROPPED (retry limit reached)
//! ```
//!
//! Anything still queued when the shutdown grace period ends is DROPPED.
//! Terminal outcomes are reported to the event sink; sink errors are logged
//! and ignored.

mod job;
mod lane;
mod payload;
mod rate_limit;

pub use job::{priority_for, JobState, NotificationJob, Priority};
pub use lane::{LaneCounters, LaneState};
pub use payload::render_payload;
pub use rate_limit::TokenBucket;

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{ChannelSettings, DispatchSettings, PrioritySettings};
use crate::storage::{DispatchRecord, EventSink, Severity, SystemEvent, SystemEventKind};
use crate::transport::{build_adapter, ChannelAdapter, ChannelKind};
use crate::GestureEvent;

enum Command {
    Event(Arc<GestureEvent>),
    Shutdown { deadline: Instant },
}

/// Builder for a running dispatcher.
pub struct Dispatcher {
    settings: DispatchSettings,
    channels: Vec<(ChannelSettings, Arc<dyn ChannelAdapter>)>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Dispatcher {
    /// Dispatcher with no channels; add them with `with_channel`.
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            settings,
            channels: Vec::new(),
            sink: None,
        }
    }

    /// Dispatcher with the shipped adapter for every configured channel.
    pub fn from_config(settings: &DispatchSettings) -> Result<Self> {
        let mut dispatcher = Self::new(settings.clone());
        for channel in &settings.channels {
            let adapter = build_adapter(channel, settings.call_timeout)?;
            dispatcher = dispatcher.with_channel(channel.clone(), adapter);
        }
        Ok(dispatcher)
    }

    pub fn with_channel(
        mut self,
        channel: ChannelSettings,
        adapter: Arc<dyn ChannelAdapter>,
    ) -> Self {
        self.channels.push((channel, adapter));
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start the router and one worker per lane.
    pub fn spawn(self) -> Result<DispatcherHandle> {
        let now = Instant::now();
        let mut lanes = Vec::with_capacity(self.channels.len());
        for (channel, adapter) in self.channels {
            if lanes.iter().any(|l: &Arc<Lane>| l.name == channel.name) {
                return Err(anyhow!("duplicate dispatch channel '{}'", channel.name));
            }
            lanes.push(Arc::new(Lane {
                name: channel.name.clone(),
                kind: adapter.kind(),
                min_priority: channel.min_priority,
                adapter,
                state: Mutex::new(LaneState::new(
                    TokenBucket::new(channel.capacity, channel.refill_per_sec, now),
                    self.settings.queue_warn_depth,
                )),
                wake: Condvar::new(),
            }));
        }

        let worker_cfg = Arc::new(WorkerConfig {
            retry_limit: self.settings.retry_limit,
            backoff_base: self.settings.backoff_base,
            max_backoff: self.settings.max_backoff,
            call_timeout: self.settings.call_timeout,
            tick: self.settings.tick,
        });

        let mut workers = Vec::with_capacity(lanes.len());
        for lane in &lanes {
            let lane = Arc::clone(lane);
            let cfg = Arc::clone(&worker_cfg);
            let sink = self.sink.clone();
            let handle = std::thread::Builder::new()
                .name(format!("dispatch-{}", lane.name))
                .spawn(move || run_lane(lane, cfg, sink))?;
            workers.push(handle);
        }

        let (tx, rx) = mpsc::channel();
        let router = {
            let lanes = lanes.clone();
            let priorities = self.settings.priorities.clone();
            let default_grace = self.settings.shutdown_grace;
            std::thread::Builder::new()
                .name("dispatch-router".to_string())
                .spawn(move || run_router(rx, lanes, priorities, default_grace))?
        };

        log::info!(
            "dispatcher started with {} lane(s): {}",
            lanes.len(),
            lanes
                .iter()
                .map(|l| format!("{}({})", l.name, l.kind))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(DispatcherHandle {
            tx,
            accepting: AtomicBool::new(true),
            submitted: AtomicU64::new(0),
            lanes,
            router: Some(router),
            workers,
        })
    }
}

struct WorkerConfig {
    retry_limit: u32,
    backoff_base: Duration,
    max_backoff: Duration,
    call_timeout: Duration,
    tick: Duration,
}

impl WorkerConfig {
    /// `backoff_base * 2^(attempt - 1)`, capped at `max_backoff`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

struct Lane {
    name: String,
    kind: ChannelKind,
    min_priority: Priority,
    adapter: Arc<dyn ChannelAdapter>,
    state: Mutex<LaneState>,
    wake: Condvar,
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        // Adapters never run under this lock.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn snapshot(&self) -> LaneSnapshot {
        let mut st = self.lock();
        LaneSnapshot {
            channel: self.name.clone(),
            kind: self.kind,
            queue_depth: st.depth(),
            in_flight: st.in_flight,
            tokens: st.tokens(Instant::now()),
            counters: st.counters,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaneSnapshot {
    pub channel: String,
    pub kind: ChannelKind,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub tokens: f64,
    pub counters: LaneCounters,
}

/// Point-in-time view of dispatcher counters.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSnapshot {
    /// Events accepted by `submit`.
    pub events_submitted: u64,
    pub lanes: Vec<LaneSnapshot>,
}

impl DispatchSnapshot {
    pub fn lane(&self, channel: &str) -> Option<&LaneSnapshot> {
        self.lanes.iter().find(|l| l.channel == channel)
    }

    pub fn delivered(&self) -> u64 {
        self.lanes.iter().map(|l| l.counters.delivered).sum()
    }

    pub fn retried(&self) -> u64 {
        self.lanes.iter().map(|l| l.counters.retried).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.lanes.iter().map(|l| l.counters.dropped).sum()
    }

    pub fn queue_depth(&self) -> usize {
        self.lanes.iter().map(|l| l.queue_depth).sum()
    }
}

/// Final counters returned by `DispatcherHandle::shutdown`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub events_submitted: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
    pub lanes: Vec<LaneSnapshot>,
}

impl From<DispatchSnapshot> for DispatchReport {
    fn from(snapshot: DispatchSnapshot) -> Self {
        Self {
            events_submitted: snapshot.events_submitted,
            delivered: snapshot.delivered(),
            retried: snapshot.retried(),
            dropped: snapshot.dropped(),
            lanes: snapshot.lanes,
        }
    }
}

/// Handle to a running dispatcher. Dropping it without `shutdown` lets the
/// workers drain for the configured grace period in the background.
pub struct DispatcherHandle {
    tx: Sender<Command>,
    accepting: AtomicBool,
    submitted: AtomicU64,
    lanes: Vec<Arc<Lane>>,
    router: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Queue an event for delivery. Never blocks. Returns false once
    /// shutdown has begun.
    pub fn submit(&self, event: GestureEvent) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            log::debug!("dispatcher closed; {} not submitted", event.label());
            return false;
        }
        if self.tx.send(Command::Event(Arc::new(event))).is_err() {
            log::warn!("dispatcher router is gone; event not submitted");
            return false;
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            events_submitted: self.submitted.load(Ordering::Relaxed),
            lanes: self.lanes.iter().map(|l| l.snapshot()).collect(),
        }
    }

    /// Stop accepting events, let lanes flush until `grace` elapses, drop
    /// whatever is left and join every worker.
    pub fn shutdown(mut self, grace: Duration) -> DispatchReport {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + grace;
        log::info!("dispatcher draining (grace {:?})", grace);

        if self.tx.send(Command::Shutdown { deadline }).is_err() {
            // Router already exited; close the lanes directly.
            close_lanes(&self.lanes, deadline);
        }
        if let Some(router) = self.router.take() {
            if router.join().is_err() {
                log::error!("dispatch router panicked");
                close_lanes(&self.lanes, deadline);
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("dispatch worker panicked");
            }
        }

        let report = DispatchReport::from(self.snapshot());
        log::info!(
            "dispatcher stopped: submitted={} delivered={} retried={} dropped={}",
            report.events_submitted,
            report.delivered,
            report.retried,
            report.dropped
        );
        report
    }
}

fn close_lanes(lanes: &[Arc<Lane>], deadline: Instant) {
    for lane in lanes {
        let mut st = lane.lock();
        st.deadline = Some(deadline);
        drop(st);
        lane.wake.notify_all();
    }
}

fn run_router(
    rx: Receiver<Command>,
    lanes: Vec<Arc<Lane>>,
    priorities: PrioritySettings,
    default_grace: Duration,
) {
    loop {
        match rx.recv() {
            Ok(Command::Event(event)) => route(&event, &lanes, &priorities),
            Ok(Command::Shutdown { deadline }) => {
                // Anything queued behind the shutdown command still gets a
                // lane, where it is flushed or dropped with the rest.
                while let Ok(command) = rx.try_recv() {
                    if let Command::Event(event) = command {
                        route(&event, &lanes, &priorities);
                    }
                }
                close_lanes(&lanes, deadline);
                return;
            }
            Err(_) => {
                close_lanes(&lanes, Instant::now() + default_grace);
                return;
            }
        }
    }
}

fn route(event: &Arc<GestureEvent>, lanes: &[Arc<Lane>], priorities: &PrioritySettings) {
    let priority = priority_for(event, priorities);
    let now = Instant::now();
    let mut routed = 0;
    for lane in lanes.iter().filter(|l| priority >= l.min_priority) {
        let job = NotificationJob::new(Arc::clone(event), &lane.name, priority, now);
        let mut st = lane.lock();
        let crossed = st.push(job);
        let depth = st.depth();
        drop(st);
        lane.wake.notify_one();
        if crossed {
            log::warn!("[{}] queue depth reached {}", lane.name, depth);
        }
        routed += 1;
    }
    if routed == 0 {
        log::debug!(
            "{} ({}) below every channel's minimum priority",
            event.label(),
            priority
        );
    }
}

fn run_lane(lane: Arc<Lane>, cfg: Arc<WorkerConfig>, sink: Option<Arc<dyn EventSink>>) {
    loop {
        let job = {
            let mut st = lane.lock();
            loop {
                let now = Instant::now();
                if let Some(deadline) = st.deadline {
                    if st.depth() == 0 || now >= deadline {
                        let leftovers = st.drain();
                        drop(st);
                        for job in leftovers {
                            log::error!(
                                "[{}] dropped {} for {}: shutdown grace elapsed",
                                lane.name,
                                job.event.label(),
                                job.event.track_id()
                            );
                            report(&sink, &job, Some("shutdown grace elapsed"));
                        }
                        return;
                    }
                }
                if let Some(job) = st.take_ready(now) {
                    break job;
                }
                st = match st.next_wake(now, cfg.tick) {
                    Some(wait) => {
                        lane.wake
                            .wait_timeout(st, wait)
                            .unwrap_or_else(|p| p.into_inner())
                            .0
                    }
                    None => lane.wake.wait(st).unwrap_or_else(|p| p.into_inner()),
                };
            }
        };

        let outcome = deliver(&lane, &job, cfg.call_timeout);
        finish(&lane, &cfg, &sink, job, outcome);
    }
}

fn deliver(lane: &Lane, job: &NotificationJob, timeout: Duration) -> Result<()> {
    let payload = render_payload(&job.event, job.priority)?;
    let adapter = Arc::clone(&lane.adapter);
    let event = Arc::clone(&job.event);
    invoke_with_timeout(timeout, move || adapter.send(&event, &payload))
}

/// Run `call` on its own thread and give up waiting after `timeout`. A call
/// that overruns keeps running detached; its result is discarded.
fn invoke_with_timeout<F>(timeout: Duration, call: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("dispatch-call".to_string())
        .spawn(move || {
            let _ = tx.send(call());
        })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(anyhow!("adapter call timed out after {:?}", timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("adapter call panicked")),
    }
}

fn finish(
    lane: &Lane,
    cfg: &WorkerConfig,
    sink: &Option<Arc<dyn EventSink>>,
    mut job: NotificationJob,
    outcome: Result<()>,
) {
    let mut st = lane.lock();
    st.in_flight = st.in_flight.saturating_sub(1);
    match outcome {
        Ok(()) => {
            job.state = JobState::Delivered;
            st.counters.delivered += 1;
            drop(st);
            log::debug!(
                "[{}] delivered {} for {} (attempt {})",
                lane.name,
                job.event.label(),
                job.event.track_id(),
                job.attempts
            );
            report(sink, &job, None);
        }
        Err(e) if job.attempts < cfg.retry_limit => {
            job.state = JobState::FailedRetryable;
            let backoff = cfg.backoff(job.attempts);
            log::warn!(
                "[{}] attempt {}/{} failed: {}; retrying in {:?}",
                lane.name,
                job.attempts,
                cfg.retry_limit,
                e,
                backoff
            );
            job.last_error = Some(e.to_string());
            st.requeue(job, Instant::now() + backoff);
            drop(st);
            lane.wake.notify_one();
        }
        Err(e) => {
            job.state = JobState::Dropped;
            job.last_error = Some(e.to_string());
            st.counters.dropped += 1;
            drop(st);
            log::error!(
                "[{}] dropped {} for {} after {} attempt(s): {}",
                lane.name,
                job.event.label(),
                job.event.track_id(),
                job.attempts,
                e
            );
            report(sink, &job, None);
        }
    }
}

fn report(sink: &Option<Arc<dyn EventSink>>, job: &NotificationJob, detail: Option<&str>) {
    let Some(sink) = sink else {
        return;
    };
    let detail = detail
        .map(str::to_string)
        .or_else(|| job.last_error.clone());
    let record = DispatchRecord::from_job(job, detail);
    if let Err(e) = sink.record_dispatch(&record) {
        log::warn!("failed to record dispatch outcome for {}: {}", job.channel, e);
    }
    if job.state == JobState::Dropped {
        let alarm = SystemEvent::new(
            SystemEventKind::JobDropped,
            Severity::Error,
            serde_json::json!({
                "channel": record.channel,
                "session_id": record.session_id,
                "track_id": record.track_id,
                "label": record.label,
                "priority": record.priority,
                "attempts": record.attempts,
                "detail": record.detail,
            }),
        );
        if let Err(e) = sink.record_system(&alarm) {
            log::warn!("failed to record dropped-job alarm for {}: {}", job.channel, e);
        }
    }
}
