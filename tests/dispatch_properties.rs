//! Dispatcher behaviour against scripted channel adapters.
//!
//! These tests verify that:
//! 1. Token buckets cap deliveries and leftovers are dropped at shutdown
//! 2. Higher tiers jump the queue; equal tiers stay FIFO
//! 3. `submit` never waits on a slow adapter
//! 4. Failures retry with backoff and drop after the retry limit
//! 5. Adapter timeouts count as retryable failures
//! 6. A slow channel never delays another channel
//! 7. Terminal outcomes reach the event sink

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use gesture_guard::config::{ChannelSettings, ChannelTarget, DispatchSettings};
use gesture_guard::storage::{Severity, SystemEventKind};
use gesture_guard::{
    BoundingBox, ChannelAdapter, ChannelKind, DispatchSnapshot, Dispatcher, DispatcherHandle,
    Frame, GestureEvent, GestureGuardConfig, GestureLabel, GesturePipeline, InMemoryEventLog,
    JobState, Landmark, Priority, RawDetection, RenderedPayload, SessionMetadata, TrackId,
};

/// Adapter that records every call and can be told to stall or fail.
struct ScriptedAdapter {
    name: String,
    delay: Duration,
    /// Only the first call stalls when set.
    delay_first_only: bool,
    failures_left: AtomicU32,
    calls: Mutex<Vec<TrackId>>,
}

impl ScriptedAdapter {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            delay_first_only: false,
            failures_left: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn slow_first(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.delay_first_only = true;
        self
    }

    fn failing(self, times: u32) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    fn calls(&self) -> Vec<TrackId> {
        self.calls.lock().unwrap().clone()
    }
}

impl ChannelAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Sound
    }

    fn send(&self, event: &GestureEvent, payload: &RenderedPayload) -> Result<()> {
        assert!(payload.subject.contains(event.label().as_str()));
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(event.track_id());
            calls.len() == 1
        };
        if !self.delay.is_zero() && (first || !self.delay_first_only) {
            std::thread::sleep(self.delay);
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("scripted failure"));
        }
        Ok(())
    }
}

fn settings() -> DispatchSettings {
    let mut s = GestureGuardConfig::default().dispatch;
    s.retry_limit = 3;
    s.backoff_base = Duration::from_millis(10);
    s.max_backoff = Duration::from_millis(40);
    s.call_timeout = Duration::from_secs(2);
    s.tick = Duration::from_millis(5);
    s.priorities.escalate_above = None;
    s.channels.clear();
    s
}

fn channel(name: &str, capacity: f64, refill_per_sec: f64) -> ChannelSettings {
    ChannelSettings {
        name: name.to_string(),
        capacity,
        refill_per_sec,
        min_priority: Priority::Info,
        target: ChannelTarget::Sound { volume: 0 },
    }
}

fn event(track: u64, label: GestureLabel) -> GestureEvent {
    GestureEvent::new(
        TrackId::new(track),
        label,
        0.8,
        1_000 + track,
        "dispatch-test",
        BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        5,
    )
}

fn wait_until<F>(handle: &DispatcherHandle, timeout: Duration, mut done: F) -> bool
where
    F: FnMut(&DispatchSnapshot) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if done(&handle.snapshot()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn token_bucket_caps_deliveries_and_leftovers_drop_at_shutdown() {
    let adapter = Arc::new(ScriptedAdapter::new("bell"));
    let handle = Dispatcher::new(settings())
        .with_channel(channel("bell", 3.0, 0.0), adapter.clone())
        .spawn()
        .unwrap();

    for track in 1..=5 {
        assert!(handle.submit(event(track, GestureLabel::Peace)));
    }
    assert!(wait_until(&handle, Duration::from_secs(2), |s| s.delivered() == 3));
    // No refill: the remaining two stay queued.
    std::thread::sleep(Duration::from_millis(50));
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.delivered(), 3);
    assert_eq!(snapshot.queue_depth(), 2);

    let report = handle.shutdown(Duration::from_millis(50));
    assert_eq!(report.events_submitted, 5);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.dropped, 2);
    assert_eq!(adapter.calls().len(), 3);
}

#[test]
fn critical_jumps_the_queue_and_equal_tiers_stay_fifo() {
    let mut s = settings();
    s.priorities.labels = BTreeMap::from([(GestureLabel::Fist, Priority::Critical)]);
    let adapter = Arc::new(ScriptedAdapter::new("bell").slow_first(Duration::from_millis(200)));
    let handle = Dispatcher::new(s)
        .with_channel(channel("bell", 10.0, 0.0), adapter.clone())
        .spawn()
        .unwrap();

    handle.submit(event(1, GestureLabel::Peace));
    assert!(wait_until(&handle, Duration::from_secs(1), |s| {
        s.lane("bell").map_or(false, |l| l.in_flight == 1)
    }));
    handle.submit(event(2, GestureLabel::Peace));
    handle.submit(event(3, GestureLabel::Peace));
    handle.submit(event(4, GestureLabel::Fist));

    assert!(wait_until(&handle, Duration::from_secs(2), |s| s.delivered() == 4));
    let order: Vec<u64> = adapter.calls().iter().map(|id| id.as_u64()).collect();
    assert_eq!(order, vec![1, 4, 2, 3]);
    handle.shutdown(Duration::ZERO);
}

#[test]
fn submit_does_not_wait_for_slow_adapter() {
    let adapter = Arc::new(ScriptedAdapter::new("bell").slow(Duration::from_millis(300)));
    let handle = Dispatcher::new(settings())
        .with_channel(channel("bell", 100.0, 0.0), adapter)
        .spawn()
        .unwrap();

    let started = Instant::now();
    for track in 1..=20 {
        assert!(handle.submit(event(track, GestureLabel::Ok)));
    }
    assert!(started.elapsed() < Duration::from_millis(100));

    let report = handle.shutdown(Duration::ZERO);
    assert_eq!(report.events_submitted, 20);
    assert!(report.dropped >= 19);
}

#[test]
fn idle_dispatcher_shuts_down_with_empty_report() {
    let handle = Dispatcher::new(settings())
        .with_channel(channel("bell", 1.0, 0.0), Arc::new(ScriptedAdapter::new("bell")))
        .spawn()
        .unwrap();
    let report = handle.shutdown(Duration::ZERO);
    assert_eq!(report.events_submitted, 0);
    assert_eq!(report.delivered, 0);
}

#[test]
fn failures_retry_with_backoff_then_drop() {
    let sink = Arc::new(InMemoryEventLog::new());
    let adapter = Arc::new(ScriptedAdapter::new("bell").failing(u32::MAX));
    let handle = Dispatcher::new(settings())
        .with_channel(channel("bell", 10.0, 0.0), adapter.clone())
        .with_sink(sink.clone())
        .spawn()
        .unwrap();

    let started = Instant::now();
    handle.submit(event(7, GestureLabel::Pointing));
    assert!(wait_until(&handle, Duration::from_secs(2), |s| s.dropped() == 1));
    // Two backoffs: 10 ms then 20 ms.
    assert!(started.elapsed() >= Duration::from_millis(30));

    let report = handle.shutdown(Duration::ZERO);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.retried, 2);
    assert_eq!(report.dropped, 1);
    assert_eq!(adapter.calls().len(), 3);

    let records = sink.dispatch_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, JobState::Dropped);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(records[0].channel, "bell");
    assert!(records[0]
        .detail
        .as_deref()
        .unwrap_or_default()
        .contains("scripted failure"));

    let alarms = sink.system_events();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].kind, SystemEventKind::JobDropped);
    assert_eq!(alarms[0].severity, Severity::Error);
    assert_eq!(alarms[0].data["channel"], "bell");
    assert_eq!(alarms[0].data["attempts"], 3);
}

#[test]
fn transient_failure_is_delivered_on_retry() {
    let sink = Arc::new(InMemoryEventLog::new());
    let adapter = Arc::new(ScriptedAdapter::new("bell").failing(2));
    let handle = Dispatcher::new(settings())
        .with_channel(channel("bell", 10.0, 0.0), adapter)
        .with_sink(sink.clone())
        .spawn()
        .unwrap();

    handle.submit(event(1, GestureLabel::ThumbsUp));
    assert!(wait_until(&handle, Duration::from_secs(2), |s| s.delivered() == 1));
    let report = handle.shutdown(Duration::ZERO);
    assert_eq!(report.retried, 2);
    assert_eq!(report.dropped, 0);

    let records = sink.dispatch_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, JobState::Delivered);
    assert_eq!(records[0].attempts, 3);
}

#[test]
fn adapter_timeout_is_retried() {
    let mut s = settings();
    s.call_timeout = Duration::from_millis(50);
    let adapter = Arc::new(ScriptedAdapter::new("bell").slow_first(Duration::from_millis(400)));
    let handle = Dispatcher::new(s)
        .with_channel(channel("bell", 10.0, 0.0), adapter)
        .spawn()
        .unwrap();

    handle.submit(event(1, GestureLabel::Peace));
    assert!(wait_until(&handle, Duration::from_secs(2), |s| s.delivered() == 1));
    let report = handle.shutdown(Duration::ZERO);
    assert_eq!(report.retried, 1);
    assert_eq!(report.dropped, 0);
}

#[test]
fn slow_channel_does_not_delay_fast_channel() {
    let slow = Arc::new(ScriptedAdapter::new("slow").slow(Duration::from_secs(1)));
    let fast = Arc::new(ScriptedAdapter::new("fast"));
    let handle = Dispatcher::new(settings())
        .with_channel(channel("slow", 10.0, 0.0), slow.clone())
        .with_channel(channel("fast", 10.0, 0.0), fast.clone())
        .spawn()
        .unwrap();

    for track in 1..=3 {
        handle.submit(event(track, GestureLabel::OpenHand));
    }
    assert!(wait_until(&handle, Duration::from_millis(800), |s| {
        s.lane("fast").map_or(false, |l| l.counters.delivered == 3)
    }));
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.lane("slow").unwrap().counters.delivered, 0);
    assert_eq!(fast.calls().len(), 3);

    let report = handle.shutdown(Duration::ZERO);
    let slow_lane = report.lanes.iter().find(|l| l.channel == "slow").unwrap();
    assert_eq!(slow_lane.counters.submitted, 3);
    assert_eq!(
        slow_lane.counters.delivered + slow_lane.counters.dropped,
        3
    );
}

#[test]
fn channel_minimum_priority_filters_jobs() {
    let mut s = settings();
    s.priorities.labels = BTreeMap::from([(GestureLabel::Fist, Priority::Warning)]);
    let mut email = channel("email", 10.0, 0.0);
    email.min_priority = Priority::Warning;
    let handle = Dispatcher::new(s)
        .with_channel(channel("bell", 10.0, 0.0), Arc::new(ScriptedAdapter::new("bell")))
        .with_channel(email, Arc::new(ScriptedAdapter::new("email")))
        .spawn()
        .unwrap();

    handle.submit(event(1, GestureLabel::Peace));
    handle.submit(event(2, GestureLabel::Fist));
    assert!(wait_until(&handle, Duration::from_secs(2), |s| s.delivered() == 3));
    let report = handle.shutdown(Duration::ZERO);
    let lane = |name: &str| report.lanes.iter().find(|l| l.channel == name).unwrap().counters;
    assert_eq!(lane("bell").submitted, 2);
    assert_eq!(lane("email").submitted, 1);
}

#[test]
fn duplicate_channel_names_are_rejected() {
    let result = Dispatcher::new(settings())
        .with_channel(channel("bell", 1.0, 0.0), Arc::new(ScriptedAdapter::new("bell")))
        .with_channel(channel("bell", 1.0, 0.0), Arc::new(ScriptedAdapter::new("bell")))
        .spawn();
    assert!(result.is_err());
}

#[test]
fn pipeline_events_flow_through_to_delivery() {
    let sink = Arc::new(InMemoryEventLog::new());
    let adapter = Arc::new(ScriptedAdapter::new("bell"));
    let handle = Dispatcher::new(settings())
        .with_channel(channel("bell", 5.0, 0.0), adapter.clone())
        .with_sink(sink.clone())
        .spawn()
        .unwrap();

    let cfg = GestureGuardConfig::default();
    let session = SessionMetadata::new("e2e", 0, "scripted").unwrap();
    let mut pipeline = GesturePipeline::new(&cfg, session, sink.clone(), Some(handle));
    for i in 0..20u64 {
        pipeline.process_frame(Frame {
            timestamp_ms: i * 33,
            detections: vec![RawDetection::new(
                BoundingBox::new(10.0, 10.0, 110.0, 130.0),
                vec![Landmark {
                    x: 60.0,
                    y: 70.0,
                    z: None,
                }],
                GestureLabel::ThumbsUp,
                0.92,
            )],
        });
    }
    assert!(wait_until(
        pipeline.dispatcher().unwrap(),
        Duration::from_secs(2),
        |s| s.delivered() == 1
    ));

    let summary = pipeline.finish(1_000, Duration::from_millis(100));
    assert_eq!(summary.events, 1);
    let dispatch = summary.dispatch.unwrap();
    assert_eq!(dispatch.events_submitted, 1);
    assert_eq!(dispatch.delivered, 1);

    assert_eq!(sink.events().len(), 1);
    let records = sink.dispatch_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, JobState::Delivered);
    assert_eq!(records[0].session_id, "e2e");
    assert_eq!(adapter.calls(), vec![sink.events()[0].track_id()]);

    let kinds: Vec<SystemEventKind> = sink.system_events().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SystemEventKind::SessionStarted,
            SystemEventKind::DispatcherDrained,
            SystemEventKind::SessionStopped,
        ]
    );
    assert_eq!(sink.system_events()[1].data["delivered"], 1);
}
