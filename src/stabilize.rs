//! Gesture Stabilizer: turns a track's flickering per-frame labels into at
//! most one event per stabilization episode.
//!
//! A label is confirmed when, over the last `window` history entries:
//!
//! 1. it has the highest confidence sum (ties go to the most recently seen),
//! 2. it holds for the trailing `min_consecutive` frames,
//! 3. its mean confidence exceeds `emit_threshold`,
//! 4. it differs from the track's last emitted label, or that label's
//!    cooldown has elapsed.
//!
//! `Unknown` and sub-`min_frame_confidence` frames are noise: they never vote
//! and they break runs, but they never clear `last_emitted_label` or the
//! cooldown.

use std::collections::BTreeMap;

use crate::config::StabilizerSettings;
use crate::track::{HistoryEntry, Track};
use crate::{GestureEvent, GestureLabel};

pub struct GestureStabilizer {
    settings: StabilizerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Tally {
    sum: f32,
    count: usize,
    last_ts_ms: u64,
}

impl GestureStabilizer {
    pub fn new(settings: StabilizerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &StabilizerSettings {
        &self.settings
    }

    /// Decide whether `track` confirms a gesture at `now_ms`.
    ///
    /// On emission the track's `last_emitted_label` and cooldown are updated;
    /// otherwise the track is left untouched.
    pub fn evaluate(
        &self,
        track: &mut Track,
        now_ms: u64,
        session_id: &str,
    ) -> Option<GestureEvent> {
        let window: Vec<&HistoryEntry> = {
            let len = track.history_len();
            let skip = len.saturating_sub(self.settings.window);
            track.history().skip(skip).collect()
        };

        let (label, tally) = self.dominant(&window)?;

        let held = window
            .iter()
            .rev()
            .take_while(|e| !self.is_noise(e) && e.label == label)
            .count();
        if held < self.settings.min_consecutive {
            return None;
        }

        let aggregated = tally.sum / tally.count as f32;
        if aggregated <= self.settings.emit_threshold {
            return None;
        }

        let cooled_down = track.cooldown_until_ms.map_or(true, |until| now_ms >= until);
        if track.last_emitted_label == Some(label) && !cooled_down {
            return None;
        }

        let cooldown_ms =
            u64::try_from(self.settings.cooldown_for(label).as_millis()).unwrap_or(u64::MAX);
        track.last_emitted_label = Some(label);
        track.cooldown_until_ms = Some(now_ms.saturating_add(cooldown_ms));

        log::info!(
            "{} confirmed {} (conf={:.2}, held={} frames)",
            track.id(),
            label,
            aggregated,
            held
        );

        Some(GestureEvent::new(
            track.id(),
            label,
            aggregated,
            now_ms,
            session_id,
            track.bbox(),
            held,
        ))
    }

    fn is_noise(&self, entry: &HistoryEntry) -> bool {
        entry.label.is_unknown() || entry.confidence < self.settings.min_frame_confidence
    }

    fn dominant(&self, window: &[&HistoryEntry]) -> Option<(GestureLabel, Tally)> {
        let mut tallies: BTreeMap<GestureLabel, Tally> = BTreeMap::new();
        for entry in window.iter().filter(|e| !self.is_noise(e)) {
            let tally = tallies.entry(entry.label).or_insert(Tally {
                sum: 0.0,
                count: 0,
                last_ts_ms: 0,
            });
            tally.sum += entry.confidence;
            tally.count += 1;
            tally.last_ts_ms = tally.last_ts_ms.max(entry.timestamp_ms);
        }

        tallies.into_iter().max_by(|(_, a), (_, b)| {
            a.sum
                .partial_cmp(&b.sum)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.last_ts_ms.cmp(&b.last_ts_ms))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerSettings;
    use crate::detect::{BoundingBox, Landmark, RawDetection};
    use crate::track::TrackManager;
    use crate::GestureGuardConfig;
    use std::time::Duration;

    fn tracker_settings() -> TrackerSettings {
        let mut s = GestureGuardConfig::default().tracker;
        s.history_len = 10;
        s.staleness = Duration::from_secs(1);
        s
    }

    fn stabilizer_settings() -> StabilizerSettings {
        let mut s = GestureGuardConfig::default().stabilizer;
        s.window = 8;
        s.min_consecutive = 4;
        s.min_frame_confidence = 0.5;
        s.emit_threshold = 0.7;
        s.cooldown = Duration::from_millis(1_000);
        s
    }

    fn hand(label: GestureLabel, confidence: f32) -> RawDetection {
        RawDetection::new(
            BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            vec![Landmark {
                x: 50.0,
                y: 50.0,
                z: None,
            }],
            label,
            confidence,
        )
    }

    /// Feed `labels` one per frame and collect emitted labels.
    fn run(frames: &[(GestureLabel, f32)]) -> Vec<GestureLabel> {
        let mut mgr = TrackManager::new(tracker_settings());
        let stab = GestureStabilizer::new(stabilizer_settings());
        let mut out = Vec::new();
        for (i, (label, conf)) in frames.iter().enumerate() {
            let ts = i as u64 * 33;
            for track in mgr.update(ts, &[hand(*label, *conf)]) {
                if let Some(ev) = stab.evaluate(track, ts, "test") {
                    out.push(ev.label());
                }
            }
        }
        out
    }

    #[test]
    fn needs_min_consecutive_frames() {
        let frames = vec![(GestureLabel::Fist, 0.9); 3];
        assert!(run(&frames).is_empty());
        let frames = vec![(GestureLabel::Fist, 0.9); 4];
        assert_eq!(run(&frames), vec![GestureLabel::Fist]);
    }

    #[test]
    fn low_mean_confidence_withholds() {
        let frames = vec![(GestureLabel::Fist, 0.65); 8];
        assert!(run(&frames).is_empty());
    }

    #[test]
    fn label_change_emits_immediately_despite_cooldown() {
        let mut frames = vec![(GestureLabel::Fist, 0.9); 4];
        frames.extend(vec![(GestureLabel::Peace, 0.95); 8]);
        assert_eq!(run(&frames), vec![GestureLabel::Fist, GestureLabel::Peace]);
    }

    #[test]
    fn unknown_blip_does_not_reset_cooldown() {
        let mut frames = vec![(GestureLabel::ThumbsUp, 0.9); 5];
        frames.push((GestureLabel::Unknown, 0.3));
        frames.extend(vec![(GestureLabel::ThumbsUp, 0.9); 5]);
        assert_eq!(run(&frames), vec![GestureLabel::ThumbsUp]);
    }

    #[test]
    fn low_confidence_frames_break_runs() {
        let frames = vec![
            (GestureLabel::Ok, 0.9),
            (GestureLabel::Ok, 0.2),
            (GestureLabel::Ok, 0.9),
            (GestureLabel::Ok, 0.2),
            (GestureLabel::Ok, 0.9),
            (GestureLabel::Ok, 0.2),
        ];
        assert!(run(&frames).is_empty());
    }

    #[test]
    fn confidence_sum_decides_dominant_label() {
        let stab = GestureStabilizer::new(stabilizer_settings());
        let e = |label, confidence, ts| HistoryEntry {
            label,
            confidence,
            timestamp_ms: ts,
        };
        let entries = [
            e(GestureLabel::Peace, 0.99, 0),
            e(GestureLabel::Peace, 0.99, 1),
            e(GestureLabel::Fist, 0.7, 2),
            e(GestureLabel::Fist, 0.7, 3),
            e(GestureLabel::Fist, 0.7, 4),
            e(GestureLabel::Unknown, 1.0, 5),
        ];
        let window: Vec<&HistoryEntry> = entries.iter().collect();
        let (label, tally) = stab.dominant(&window).unwrap();
        assert_eq!(label, GestureLabel::Fist);
        assert_eq!(tally.count, 3);
    }

    #[test]
    fn tie_goes_to_most_recent_label() {
        let stab = GestureStabilizer::new(stabilizer_settings());
        let e = |label, ts| HistoryEntry {
            label,
            confidence: 0.8,
            timestamp_ms: ts,
        };
        let entries = [
            e(GestureLabel::Peace, 0),
            e(GestureLabel::Fist, 1),
            e(GestureLabel::Peace, 2),
            e(GestureLabel::Fist, 3),
        ];
        let window: Vec<&HistoryEntry> = entries.iter().collect();
        let (label, _) = stab.dominant(&window).unwrap();
        assert_eq!(label, GestureLabel::Fist);
    }

    #[test]
    fn all_noise_window_has_no_dominant_label() {
        let stab = GestureStabilizer::new(stabilizer_settings());
        let entries = [HistoryEntry {
            label: GestureLabel::Unknown,
            confidence: 0.9,
            timestamp_ms: 0,
        }];
        let window: Vec<&HistoryEntry> = entries.iter().collect();
        assert!(stab.dominant(&window).is_none());
    }
}
