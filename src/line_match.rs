use log::debug;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::entities::WayId;
use crate::geometry::{distance, local_offset};
use crate::segments::LineSegment;

/// Identifies a segment by its way and segment index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentRef {
    pub way_id: WayId,
    pub index: usize,
}

impl SegmentRef {
    fn shift_after(&mut self, way_id: WayId, split_index: usize) {
        if self.way_id == way_id && self.index > split_index {
            self.index += 1;
        }
    }
}

/// Geometric comparison of one reference segment with one candidate segment
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentMatch {
    pub main: SegmentRef,
    pub candidate: SegmentRef,
    /// Distance in meters from the candidate midpoint to the reference line
    pub orthogonal_distance: f64,
    /// Distance in meters between both midpoints
    pub midpoint_distance: f64,
    /// Cosine of the angle between both directions, in [-1, 1]
    pub dot_product: f64,
}

impl SegmentMatch {
    /// Measures `candidate` against `main`. Returns `None` when either segment
    /// has no length, since neither a direction nor a line is defined then.
    pub fn measure(main: &LineSegment, candidate: &LineSegment) -> Option<Self> {
        if main.vector_magnitude() == 0.0 || candidate.vector_magnitude() == 0.0 {
            return None;
        }

        let cos_lat = main.midpoint().y().to_radians().cos();
        let main_vector = main.metric_vector(cos_lat);
        let candidate_vector = candidate.metric_vector(cos_lat);
        let main_norm = main_vector.x.hypot(main_vector.y);
        let candidate_norm = candidate_vector.x.hypot(candidate_vector.y);

        let offset = local_offset(main.origin(), candidate.midpoint(), cos_lat);
        let cross = main_vector.x * offset.y - main_vector.y * offset.x;
        let dot = (main_vector.x * candidate_vector.x + main_vector.y * candidate_vector.y)
            / (main_norm * candidate_norm);

        Some(Self {
            main: SegmentRef {
                way_id: main.way_id(),
                index: main.index(),
            },
            candidate: SegmentRef {
                way_id: candidate.way_id(),
                index: candidate.index(),
            },
            orthogonal_distance: cross.abs() / main_norm,
            midpoint_distance: distance(main.midpoint(), candidate.midpoint()),
            dot_product: dot.clamp(-1.0, 1.0),
        })
    }

    /// Ordering key for picking the best match of a reference segment;
    /// smaller is better.
    fn selection_key(
        &self,
    ) -> (
        OrderedFloat<f64>,
        Reverse<OrderedFloat<f64>>,
        OrderedFloat<f64>,
        SegmentRef,
    ) {
        (
            OrderedFloat(self.orthogonal_distance),
            Reverse(OrderedFloat(self.dot_product.abs())),
            OrderedFloat(self.midpoint_distance),
            self.candidate,
        )
    }

    pub(crate) fn shift_after(&mut self, way_id: WayId, split_index: usize) {
        self.main.shift_after(way_id, split_index);
        self.candidate.shift_after(way_id, split_index);
    }

    /// Points whichever side refers to `(way_id, from)` at `to` instead
    pub(crate) fn retarget(&mut self, way_id: WayId, from: usize, to: usize) {
        for side in [&mut self.main, &mut self.candidate] {
            if side.way_id == way_id && side.index == from {
                side.index = to;
            }
        }
    }
}

/// Matches found for one candidate way, and their consolidated summary
#[derive(Clone, Debug, Default)]
pub struct LineMatch {
    way_id: WayId,
    matches: Vec<SegmentMatch>,
    consolidated: Vec<SegmentMatch>,
    average_orthogonal_distance: f64,
    average_dot_product: f64,
}

impl LineMatch {
    pub fn new(way_id: WayId) -> Self {
        Self {
            way_id,
            ..Default::default()
        }
    }

    pub fn way_id(&self) -> WayId {
        self.way_id
    }

    pub fn add_match(&mut self, segment_match: SegmentMatch) {
        self.matches.push(segment_match);
    }

    /// Every raw match recorded for this way
    pub fn matches(&self) -> &[SegmentMatch] {
        &self.matches
    }

    /// At most one match per reference segment, ordered by reference segment
    pub fn consolidated_matches(&self) -> &[SegmentMatch] {
        &self.consolidated
    }

    pub fn matching_segment_count(&self) -> usize {
        self.consolidated.len()
    }

    pub fn is_matched(&self) -> bool {
        !self.consolidated.is_empty()
    }

    pub fn average_orthogonal_distance(&self) -> f64 {
        self.average_orthogonal_distance
    }

    /// Signed mean over the consolidated matches; negative means the way runs
    /// against the reference line.
    pub fn average_dot_product(&self) -> f64 {
        self.average_dot_product
    }

    /// Matched coverage weighted by alignment; higher is better
    pub fn score(&self) -> f64 {
        self.consolidated.len() as f64 * self.average_dot_product.abs()
    }

    /// Keeps the best match per reference segment: nearest orthogonal
    /// distance, then best alignment, then nearest midpoint.
    pub fn consolidate(&mut self) {
        let mut best: BTreeMap<usize, &SegmentMatch> = BTreeMap::new();
        for candidate in &self.matches {
            best.entry(candidate.main.index)
                .and_modify(|current| {
                    if candidate.selection_key() < current.selection_key() {
                        *current = candidate;
                    }
                })
                .or_insert(candidate);
        }
        self.consolidated = best.into_values().cloned().collect();

        let count = self.consolidated.len();
        if count == 0 {
            self.average_orthogonal_distance = 0.0;
            self.average_dot_product = 0.0;
        } else {
            self.average_orthogonal_distance = self
                .consolidated
                .iter()
                .map(|m| m.orthogonal_distance)
                .sum::<f64>()
                / count as f64;
            self.average_dot_product =
                self.consolidated.iter().map(|m| m.dot_product).sum::<f64>() / count as f64;
        }

        debug!(
            "Way {}: {} raw matches consolidated to {} (avg orthogonal {:.2} m, avg dot {:.3})",
            self.way_id,
            self.matches.len(),
            count,
            self.average_orthogonal_distance,
            self.average_dot_product
        );
    }

    /// Drops raw and consolidated matches ahead of a fresh matching pass
    pub(crate) fn clear(&mut self) {
        self.matches.clear();
        self.consolidated.clear();
        self.average_orthogonal_distance = 0.0;
        self.average_dot_product = 0.0;
    }

    pub(crate) fn shift_after(&mut self, way_id: WayId, split_index: usize) {
        for segment_match in self.matches.iter_mut().chain(self.consolidated.iter_mut()) {
            segment_match.shift_after(way_id, split_index);
        }
    }
}
