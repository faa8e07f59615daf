use serde::Serialize;

use super::job::Priority;
use crate::detect::BoundingBox;
use crate::transport::RenderedPayload;
use crate::{GestureEvent, GestureLabel, TrackId};

#[derive(Serialize)]
struct AlertDocument<'a> {
    gesture: GestureLabel,
    priority: Priority,
    confidence: f32,
    timestamp_ms: u64,
    session_id: &'a str,
    track_id: TrackId,
    bbox: BoundingBox,
    held_frames: usize,
}

/// Render the channel-independent forms of an alert.
pub fn render_payload(event: &GestureEvent, priority: Priority) -> anyhow::Result<RenderedPayload> {
    let subject = format!(
        "[{}] Gesture detected: {}",
        priority.as_str().to_uppercase(),
        event.label()
    );
    let body = format!(
        "Gesture '{}' confirmed on {} with {:.1}% confidence.\n\
         Held for {} frames.\n\
         Session: {}\n\
         Timestamp (ms since epoch): {}\n",
        event.label(),
        event.track_id(),
        event.confidence() * 100.0,
        event.held_frames(),
        event.session_id(),
        event.timestamp_ms(),
    );
    let json = serde_json::to_string(&AlertDocument {
        gesture: event.label(),
        priority,
        confidence: event.confidence(),
        timestamp_ms: event.timestamp_ms(),
        session_id: event.session_id(),
        track_id: event.track_id(),
        bbox: event.bbox(),
        held_frames: event.held_frames(),
    })?;
    Ok(RenderedPayload {
        subject,
        body,
        json,
    })
}
