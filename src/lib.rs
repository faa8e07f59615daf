//! Gesture Guard
//!
//! This crate turns a noisy stream of per-frame hand detections into a small
//! number of trustworthy gesture events and routes them to notification
//! channels.
//!
//! # Architecture
//!
//! Frame processing is synchronous and single-threaded:
//!
//! 1. **Detection Source** (`detect`): yields one `Frame` of raw per-hand
//!    detections per call. The classifier itself is external.
//! 2. **Track Manager** (`track`): re-identifies the same hand across frames
//!    with greedy IoU / centroid matching and evicts stale tracks.
//! 3. **Gesture Stabilizer** (`stabilize`): confidence-weighted vote over a
//!    track's sliding history, with consecutive-frame and cooldown gates.
//!
//! Emitted events fan out to:
//!
//! - **Logging Sink** (`storage`): hash-chained SQLite or in-memory log.
//! - **Notification Dispatcher** (`dispatch`): per-channel lanes with token
//!   bucket rate limiting, priority ordering and bounded retry, delivering
//!   through the adapters in `transport`.
//!
//! `pipeline` glues the synchronous half together; `config` loads the one
//! immutable configuration value every component is built from.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod export;
pub mod pipeline;
pub mod stabilize;
pub mod storage;
pub mod track;
pub mod transport;
pub mod verify;

pub use config::GestureGuardConfig;
pub use detect::{BoundingBox, DetectionSource, Frame, JsonlSource, Landmark, RawDetection};
pub use dispatch::{
    DispatchReport, DispatchSnapshot, Dispatcher, DispatcherHandle, JobState, NotificationJob,
    Priority, TokenBucket,
};
pub use pipeline::{FrameReport, GesturePipeline};
pub use stabilize::GestureStabilizer;
pub use storage::{DispatchRecord, EventSink, InMemoryEventLog, SqliteEventLog};
pub use track::{Track, TrackId, TrackManager, TrackState};
pub use transport::{ChannelAdapter, ChannelKind, RenderedPayload};
pub use verify::{hash_entry, verify_chain, ChainReport};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    u64::try_from(elapsed.as_millis()).map_err(|_| anyhow!("clock exceeds u64 milliseconds"))
}

// -------------------- Gesture Vocabulary --------------------

/// Closed gesture vocabulary produced by the classifier.
///
/// `Unknown` is a real variant: the classifier reports it for hands it could
/// not classify, and the stabilizer treats it as noise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GestureLabel {
    #[serde(rename = "Thumbs_Up")]
    ThumbsUp,
    #[serde(rename = "Peace")]
    Peace,
    #[serde(rename = "Fist")]
    Fist,
    #[serde(rename = "Open_Hand")]
    OpenHand,
    #[serde(rename = "Pointing")]
    Pointing,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Unknown", alias = "unknown")]
    Unknown,
}

impl GestureLabel {
    pub const ALL: [GestureLabel; 7] = [
        GestureLabel::ThumbsUp,
        GestureLabel::Peace,
        GestureLabel::Fist,
        GestureLabel::OpenHand,
        GestureLabel::Pointing,
        GestureLabel::Ok,
        GestureLabel::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GestureLabel::ThumbsUp => "Thumbs_Up",
            GestureLabel::Peace => "Peace",
            GestureLabel::Fist => "Fist",
            GestureLabel::OpenHand => "Open_Hand",
            GestureLabel::Pointing => "Pointing",
            GestureLabel::Ok => "OK",
            GestureLabel::Unknown => "Unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, GestureLabel::Unknown)
    }

    /// Lenient mapping for classifier output. Anything outside the
    /// vocabulary (including "No Hand") becomes `Unknown`.
    pub fn from_classifier(raw: &str) -> Self {
        raw.parse().unwrap_or(GestureLabel::Unknown)
    }
}

impl fmt::Display for GestureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GestureLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "thumbsup" => Ok(GestureLabel::ThumbsUp),
            "peace" | "victory" => Ok(GestureLabel::Peace),
            "fist" => Ok(GestureLabel::Fist),
            "openhand" | "openpalm" => Ok(GestureLabel::OpenHand),
            "pointing" | "point" => Ok(GestureLabel::Pointing),
            "ok" => Ok(GestureLabel::Ok),
            "unknown" => Ok(GestureLabel::Unknown),
            _ => Err(anyhow!("gesture label '{}' not in vocabulary", s)),
        }
    }
}

// -------------------- Sessions --------------------

/// Validate an opaque caller-supplied session identifier.
///
/// Allowed: "session:20240101_120000", "kiosk-3", "a.b_c"
/// Disallowed: whitespace, slashes, empty, longer than 64 characters.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    static SESSION_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = SESSION_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_.:-]{1,64}$").expect("static regex"));
    if !re.is_match(session_id) {
        return Err(anyhow!(
            "session_id must match ^[A-Za-z0-9_.:-]{{1,64}}$ (got '{}')",
            session_id
        ));
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub started_at_ms: u64,
    /// Free-form label for where frames come from (file name, camera id).
    pub source: String,
}

impl SessionMetadata {
    pub fn new(session_id: &str, started_at_ms: u64, source: &str) -> Result<Self> {
        validate_session_id(session_id)?;
        Ok(Self {
            session_id: session_id.to_string(),
            started_at_ms,
            source: source.to_string(),
        })
    }
}

// -------------------- Gesture Events --------------------

/// A confirmed, de-duplicated gesture on one track.
///
/// Fields are private: once the stabilizer creates an event, the sink and
/// the dispatcher only ever read it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GestureEvent {
    track_id: TrackId,
    label: GestureLabel,
    confidence: f32,
    timestamp_ms: u64,
    session_id: String,
    bbox: BoundingBox,
    held_frames: usize,
}

impl GestureEvent {
    pub fn new(
        track_id: TrackId,
        label: GestureLabel,
        confidence: f32,
        timestamp_ms: u64,
        session_id: &str,
        bbox: BoundingBox,
        held_frames: usize,
    ) -> Self {
        Self {
            track_id,
            label,
            confidence,
            timestamp_ms,
            session_id: session_id.to_string(),
            bbox,
            held_frames,
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn label(&self) -> GestureLabel {
        self.label
    }

    /// Mean confidence of the dominant label across the stabilizer window.
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Consecutive frames the label held when the event fired.
    pub fn held_frames(&self) -> usize {
        self.held_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_parsing_is_lenient_about_case_and_separators() {
        assert_eq!("Thumbs_Up".parse::<GestureLabel>().unwrap(), GestureLabel::ThumbsUp);
        assert_eq!("thumbs up".parse::<GestureLabel>().unwrap(), GestureLabel::ThumbsUp);
        assert_eq!("OPEN-HAND".parse::<GestureLabel>().unwrap(), GestureLabel::OpenHand);
        assert_eq!("OK".parse::<GestureLabel>().unwrap(), GestureLabel::Ok);
        assert!("wave".parse::<GestureLabel>().is_err());
    }

    #[test]
    fn classifier_noise_maps_to_unknown() {
        assert_eq!(GestureLabel::from_classifier("No Hand"), GestureLabel::Unknown);
        assert_eq!(GestureLabel::from_classifier(""), GestureLabel::Unknown);
        assert_eq!(GestureLabel::from_classifier("unknown"), GestureLabel::Unknown);
    }

    #[test]
    fn label_serde_uses_classifier_vocabulary() {
        let json = serde_json::to_string(&GestureLabel::ThumbsUp).unwrap();
        assert_eq!(json, "\"Thumbs_Up\"");
        let parsed: GestureLabel = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(parsed, GestureLabel::Unknown);
        for label in GestureLabel::ALL {
            assert_eq!(label.as_str().parse::<GestureLabel>().unwrap(), label);
        }
    }

    #[test]
    fn session_id_allowlist() {
        assert!(validate_session_id("session:20240101_120000").is_ok());
        assert!(validate_session_id("kiosk-3").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id(&"x".repeat(65)).is_err());
    }
}
