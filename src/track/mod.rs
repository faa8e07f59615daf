//! Track Manager: keeps one track per physical hand across frames.
//!
//! Every validated detection ends up on a track. Detections that match no
//! existing track spawn a new one, so classifier noise shows up as short-lived
//! tracks that the stabilizer never confirms rather than being discarded here.

mod matching;
mod state;

pub use matching::{greedy_assign, MatchCriteria};
pub use state::{HistoryEntry, Track, TrackId, TrackState};

use crate::config::TrackerSettings;
use crate::detect::{BoundingBox, RawDetection};

pub struct TrackManager {
    settings: TrackerSettings,
    tracks: Vec<Track>,
    next_id: u64,
}

impl TrackManager {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Fold one frame of detections into track state.
    ///
    /// Returns the tracks that are live (NEW or ACTIVE) after the update, in
    /// creation order. Tracks that went stale this frame are kept until the
    /// next call so callers can still observe the transition via `tracks()`.
    pub fn update(&mut self, frame_ts_ms: u64, detections: &[RawDetection]) -> Vec<&mut Track> {
        let evicted_before = self.tracks.len();
        self.tracks.retain(|t| t.state() != TrackState::Stale);
        let evicted = evicted_before - self.tracks.len();
        if evicted > 0 {
            log::debug!("evicted {} stale track(s)", evicted);
        }

        let matchable: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| self.tracks[i].is_matchable())
            .collect();
        let track_boxes: Vec<BoundingBox> =
            matchable.iter().map(|&i| self.tracks[i].bbox()).collect();
        let det_boxes: Vec<BoundingBox> = detections.iter().map(|d| d.bbox).collect();
        let criteria = MatchCriteria {
            iou_threshold: self.settings.iou_threshold,
            max_centroid_distance: self.settings.max_centroid_distance,
        };
        let pairs = greedy_assign(&track_boxes, &det_boxes, criteria);

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        for (local_idx, det_idx) in pairs {
            let track_idx = matchable[local_idx];
            let det = &detections[det_idx];
            self.tracks[track_idx].observe(det.bbox, entry_for(det, frame_ts_ms));
            track_matched[track_idx] = true;
            det_matched[det_idx] = true;
        }

        let staleness_ms = u64::try_from(self.settings.staleness.as_millis()).unwrap_or(u64::MAX);
        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if !track_matched[idx] {
                track.miss(frame_ts_ms, staleness_ms);
                if track.state() == TrackState::Stale {
                    log::debug!(
                        "{} stale after {} missed frame(s)",
                        track.id(),
                        track.missed_frames()
                    );
                }
            }
        }

        for (det_idx, det) in detections.iter().enumerate() {
            if det_matched[det_idx] {
                continue;
            }
            let id = TrackId::new(self.next_id);
            self.next_id += 1;
            log::debug!("spawned {} ({})", id, det.label);
            self.tracks.push(Track::spawn(
                id,
                det.bbox,
                entry_for(det, frame_ts_ms),
                self.settings.history_len,
            ));
        }

        self.tracks
            .iter_mut()
            .filter(|t| t.is_matchable())
            .collect()
    }

    /// All tracks currently held, including ones awaiting eviction.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn live_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_matchable()).count()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}

fn entry_for(det: &RawDetection, ts_ms: u64) -> HistoryEntry {
    HistoryEntry {
        label: det.label,
        confidence: det.confidence,
        timestamp_ms: ts_ms,
    }
}
