//! Synchronous per-frame processing: validate, track, stabilize, fan out.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::GestureGuardConfig;
use crate::detect::{DetectionSource, Frame};
use crate::dispatch::{DispatchReport, DispatcherHandle};
use crate::stabilize::GestureStabilizer;
use crate::storage::{EventSink, Severity, SystemEvent, SystemEventKind};
use crate::track::TrackManager;
use crate::{GestureEvent, SessionMetadata};

/// Outcome of one `process_frame` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub timestamp_ms: u64,
    pub events: Vec<GestureEvent>,
    /// Malformed detections discarded before tracking.
    pub dropped_detections: usize,
    pub live_tracks: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSummary {
    pub frames: u64,
    pub frames_out_of_order: u64,
    pub events: u64,
    pub dropped_detections: u64,
    pub dispatch: Option<DispatchReport>,
}

pub struct GesturePipeline {
    session: SessionMetadata,
    tracker: TrackManager,
    stabilizer: GestureStabilizer,
    sink: Arc<dyn EventSink>,
    dispatcher: Option<DispatcherHandle>,
    last_ts_ms: Option<u64>,
    summary: PipelineSummary,
}

impl GesturePipeline {
    pub fn new(
        config: &GestureGuardConfig,
        session: SessionMetadata,
        sink: Arc<dyn EventSink>,
        dispatcher: Option<DispatcherHandle>,
    ) -> Self {
        if let Err(e) = sink.open_session(&session) {
            log::warn!("failed to record session {}: {}", session.session_id, e);
        }
        log::info!(
            "session {} started (source: {})",
            session.session_id,
            session.source
        );
        record_system(
            sink.as_ref(),
            SystemEvent::new(
                SystemEventKind::SessionStarted,
                Severity::Info,
                serde_json::json!({
                    "session_id": session.session_id,
                    "source": session.source,
                }),
            ),
        );
        Self {
            session,
            tracker: TrackManager::new(config.tracker.clone()),
            stabilizer: GestureStabilizer::new(config.stabilizer.clone()),
            sink,
            dispatcher,
            last_ts_ms: None,
            summary: PipelineSummary::default(),
        }
    }

    pub fn session(&self) -> &SessionMetadata {
        &self.session
    }

    pub fn tracker(&self) -> &TrackManager {
        &self.tracker
    }

    pub fn dispatcher(&self) -> Option<&DispatcherHandle> {
        self.dispatcher.as_ref()
    }

    /// Process one frame. Events are returned in track creation order after
    /// being recorded and submitted for dispatch.
    pub fn process_frame(&mut self, frame: Frame) -> FrameReport {
        let Frame {
            timestamp_ms,
            detections,
        } = frame;

        if let Some(last) = self.last_ts_ms {
            if timestamp_ms < last {
                log::warn!(
                    "frame at {} ms precedes previous frame at {} ms; skipped",
                    timestamp_ms,
                    last
                );
                self.summary.frames_out_of_order += 1;
                return FrameReport {
                    timestamp_ms,
                    events: Vec::new(),
                    dropped_detections: detections.len(),
                    live_tracks: self.tracker.live_count(),
                };
            }
        }
        self.last_ts_ms = Some(timestamp_ms);
        self.summary.frames += 1;

        let total = detections.len();
        let valid: Vec<_> = detections
            .into_iter()
            .filter(|det| match det.validate() {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("data quality: dropped detection at {} ms: {}", timestamp_ms, e);
                    false
                }
            })
            .collect();
        let dropped = total - valid.len();
        self.summary.dropped_detections += dropped as u64;

        let mut events = Vec::new();
        for track in self.tracker.update(timestamp_ms, &valid) {
            // Only a hand seen in this frame may confirm or re-affirm.
            if track.missed_frames() > 0 {
                continue;
            }
            if let Some(event) =
                self.stabilizer
                    .evaluate(track, timestamp_ms, &self.session.session_id)
            {
                events.push(event);
            }
        }

        for event in &events {
            if let Err(e) = self.sink.record(event, &self.session) {
                log::warn!("failed to record {} for {}: {}", event.label(), event.track_id(), e);
            }
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.submit(event.clone());
            }
        }
        self.summary.events += events.len() as u64;

        FrameReport {
            timestamp_ms,
            events,
            dropped_detections: dropped,
            live_tracks: self.tracker.live_count(),
        }
    }

    /// Pull frames until the source is exhausted or `stop` is raised.
    pub fn run(&mut self, source: &mut dyn DetectionSource, stop: &AtomicBool) -> Result<()> {
        source.warm_up()?;
        while !stop.load(Ordering::SeqCst) {
            let Some(frame) = source.next_frame()? else {
                log::info!("source {} exhausted", source.name());
                break;
            };
            self.process_frame(frame);
        }
        Ok(())
    }

    /// Close the session and drain the dispatcher.
    pub fn finish(mut self, ended_at_ms: u64, grace: Duration) -> PipelineSummary {
        if let Err(e) = self.sink.close_session(&self.session.session_id, ended_at_ms) {
            log::warn!("failed to close session {}: {}", self.session.session_id, e);
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let report = dispatcher.shutdown(grace);
            let severity = if report.dropped > 0 {
                Severity::Warning
            } else {
                Severity::Info
            };
            record_system(
                self.sink.as_ref(),
                SystemEvent::new(
                    SystemEventKind::DispatcherDrained,
                    severity,
                    serde_json::json!({
                        "session_id": self.session.session_id,
                        "submitted": report.events_submitted,
                        "delivered": report.delivered,
                        "retried": report.retried,
                        "dropped": report.dropped,
                    }),
                ),
            );
            self.summary.dispatch = Some(report);
        }
        record_system(
            self.sink.as_ref(),
            SystemEvent::new(
                SystemEventKind::SessionStopped,
                Severity::Info,
                serde_json::json!({
                    "session_id": self.session.session_id,
                    "ended_at_ms": ended_at_ms,
                    "frames": self.summary.frames,
                    "events": self.summary.events,
                }),
            ),
        );
        log::info!(
            "session {} stopped: frames={} events={} dropped_detections={}",
            self.session.session_id,
            self.summary.frames,
            self.summary.events,
            self.summary.dropped_detections
        );
        self.summary
    }
}

fn record_system(sink: &dyn EventSink, event: SystemEvent) {
    if let Err(e) = sink.record_system(&event) {
        log::warn!("failed to record {} system event: {}", event.kind.as_str(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Landmark, RawDetection};
    use crate::storage::InMemoryEventLog;
    use crate::GestureLabel;

    fn pipeline(log: Arc<InMemoryEventLog>) -> GesturePipeline {
        let mut cfg = GestureGuardConfig::default();
        cfg.stabilizer.window = 6;
        cfg.stabilizer.min_consecutive = 3;
        let session = SessionMetadata::new("unit", 0, "test").unwrap();
        GesturePipeline::new(&cfg, session, log, None)
    }

    fn hand(confidence: f32) -> RawDetection {
        RawDetection::new(
            BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            vec![Landmark {
                x: 50.0,
                y: 50.0,
                z: None,
            }],
            GestureLabel::Fist,
            confidence,
        )
    }

    #[test]
    fn malformed_detections_are_counted_and_skipped() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut p = pipeline(log);
        let report = p.process_frame(Frame {
            timestamp_ms: 0,
            detections: vec![hand(0.9), hand(1.5), hand(f32::NAN)],
        });
        assert_eq!(report.dropped_detections, 2);
        assert_eq!(report.live_tracks, 1);
    }

    #[test]
    fn events_reach_the_sink() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut p = pipeline(Arc::clone(&log));
        for i in 0..5u64 {
            p.process_frame(Frame {
                timestamp_ms: i * 33,
                detections: vec![hand(0.9)],
            });
        }
        let summary = p.finish(1_000, Duration::from_millis(10));
        assert_eq!(summary.events, 1);
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.session("unit").unwrap().1, Some(1_000));

        let kinds: Vec<SystemEventKind> = log.system_events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![SystemEventKind::SessionStarted, SystemEventKind::SessionStopped]
        );
    }

    #[test]
    fn frames_going_backwards_are_skipped() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut p = pipeline(log);
        p.process_frame(Frame {
            timestamp_ms: 100,
            detections: vec![hand(0.9)],
        });
        let report = p.process_frame(Frame {
            timestamp_ms: 50,
            detections: vec![hand(0.9)],
        });
        assert!(report.events.is_empty());
        let summary = p.finish(200, Duration::ZERO);
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.frames_out_of_order, 1);
    }
}
