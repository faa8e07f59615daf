//! Greedy one-to-one assignment of detections to tracks.
//!
//! Pairs are ranked by IoU (then centroid distance, then track age) and
//! accepted in order while both sides are free. This is not a global optimum:
//! two hands crossing can swap identities where a bipartite solver would not.
//! The per-frame cost stays O(n·m·log(n·m)) for a handful of hands.

use std::cmp::Ordering;

use crate::detect::BoundingBox;

#[derive(Debug, Clone, Copy)]
pub struct MatchCriteria {
    pub iou_threshold: f32,
    pub max_centroid_distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub track_idx: usize,
    pub det_idx: usize,
    pub iou: f32,
    pub distance: f32,
}

/// Returns `(track_idx, det_idx)` pairs. `tracks` holds only matchable tracks
/// in creation order; lower indices are older tracks.
pub fn greedy_assign(
    tracks: &[BoundingBox],
    detections: &[BoundingBox],
    criteria: MatchCriteria,
) -> Vec<(usize, usize)> {
    let mut candidates = Vec::new();
    for (track_idx, track_box) in tracks.iter().enumerate() {
        for (det_idx, det_box) in detections.iter().enumerate() {
            let iou = track_box.iou(det_box);
            let distance = track_box.centroid_distance(det_box);
            if iou >= criteria.iou_threshold || distance <= criteria.max_centroid_distance {
                candidates.push(Candidate {
                    track_idx,
                    det_idx,
                    iou,
                    distance,
                });
            }
        }
    }

    candidates.sort_by(rank);

    let mut track_taken = vec![false; tracks.len()];
    let mut det_taken = vec![false; detections.len()];
    let mut pairs = Vec::new();
    for c in candidates {
        if track_taken[c.track_idx] || det_taken[c.det_idx] {
            continue;
        }
        track_taken[c.track_idx] = true;
        det_taken[c.det_idx] = true;
        pairs.push((c.track_idx, c.det_idx));
    }
    pairs
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.iou
        .partial_cmp(&a.iou)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.track_idx.cmp(&b.track_idx))
        .then_with(|| a.det_idx.cmp(&b.det_idx))
}
