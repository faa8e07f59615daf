use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;
use crate::GestureLabel;

/// Opaque track identity. Allocated monotonically and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(u64);

impl TrackId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hand-{}", self.0)
    }
}

/// Track lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackState {
    /// Spawned this frame from an unmatched detection.
    #[default]
    New,
    /// Matched at least once after spawning.
    Active,
    /// Unmatched past the staleness window; evicted on the next update.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub label: GestureLabel,
    pub confidence: f32,
    pub timestamp_ms: u64,
}

/// One physical hand as the tracker currently believes it.
#[derive(Debug, Clone)]
pub struct Track {
    id: TrackId,
    bbox: BoundingBox,
    history: VecDeque<HistoryEntry>,
    history_cap: usize,
    state: TrackState,
    created_at_ms: u64,
    last_seen_ms: u64,
    missed_frames: u32,
    pub(crate) last_emitted_label: Option<GestureLabel>,
    pub(crate) cooldown_until_ms: Option<u64>,
}

impl Track {
    pub(crate) fn spawn(
        id: TrackId,
        bbox: BoundingBox,
        entry: HistoryEntry,
        history_cap: usize,
    ) -> Self {
        let mut history = VecDeque::with_capacity(history_cap);
        history.push_back(entry);
        Self {
            id,
            bbox,
            history,
            history_cap,
            state: TrackState::New,
            created_at_ms: entry.timestamp_ms,
            last_seen_ms: entry.timestamp_ms,
            missed_frames: 0,
            last_emitted_label: None,
            cooldown_until_ms: None,
        }
    }

    /// Fold a matched detection into the track.
    pub(crate) fn observe(&mut self, bbox: BoundingBox, entry: HistoryEntry) {
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(entry);
        self.bbox = bbox;
        self.last_seen_ms = entry.timestamp_ms;
        self.missed_frames = 0;
        self.state = TrackState::Active;
    }

    /// Age an unmatched track by one frame.
    pub(crate) fn miss(&mut self, now_ms: u64, staleness_ms: u64) {
        self.missed_frames = self.missed_frames.saturating_add(1);
        if now_ms.saturating_sub(self.last_seen_ms) > staleness_ms {
            self.state = TrackState::Stale;
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Oldest first.
    pub fn history(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> + ExactSizeIterator {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_matchable(&self) -> bool {
        self.state != TrackState::Stale
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms
    }

    pub fn missed_frames(&self) -> u32 {
        self.missed_frames
    }

    pub fn last_emitted_label(&self) -> Option<GestureLabel> {
        self.last_emitted_label
    }

    pub fn cooldown_until_ms(&self) -> Option<u64> {
        self.cooldown_until_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: u64) -> HistoryEntry {
        HistoryEntry {
            label: GestureLabel::Peace,
            confidence: 0.9,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn history_is_a_sliding_window() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let mut track = Track::spawn(TrackId::new(1), bbox, entry(0), 3);
        for ts in 1..=5 {
            track.observe(bbox, entry(ts));
        }
        let stamps: Vec<u64> = track.history().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![3, 4, 5]);
        assert_eq!(track.state(), TrackState::Active);
    }

    #[test]
    fn miss_goes_stale_only_after_window() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let mut track = Track::spawn(TrackId::new(1), bbox, entry(1_000), 8);
        track.miss(1_200, 500);
        assert_eq!(track.state(), TrackState::New);
        assert_eq!(track.missed_frames(), 1);
        track.miss(1_500, 500);
        assert_eq!(track.state(), TrackState::New);
        track.miss(1_501, 500);
        assert_eq!(track.state(), TrackState::Stale);
        assert!(!track.is_matchable());
    }
}
