use anyhow::Context;
use log::{debug, info, trace};
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::entities::{NodeId, WayId};
use crate::error::{ConflationError, Result};
use crate::geometry::Region;
use crate::graph::EntityGraph;
use crate::line_match::{LineMatch, SegmentMatch};
use crate::segments::{NodeInsertion, WaySegments};

/// Matched candidate ways by id, as consumed by path search
pub type MatchedWays<'a> = BTreeMap<WayId, &'a WaySegments>;

/// Tunables of the matching engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingOptions {
    /// Maximum length of a single segment (meters)
    pub max_segment_length: f64,
    /// Maximum distance from a candidate midpoint to the reference line (meters)
    pub max_segment_orthogonal_distance: f64,
    /// Maximum distance between the midpoints of a segment pair (meters)
    pub max_segment_midpoint_distance: f64,
    /// Maximum angle between a segment pair, either direction (degrees)
    pub max_segment_angle: f64,
    /// Buffer around segment and way boxes for candidate selection (meters)
    pub bounding_box_size: f64,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            max_segment_length: 10.0,
            max_segment_orthogonal_distance: 10.0,
            max_segment_midpoint_distance: 20.0,
            max_segment_angle: 30.0,
            bounding_box_size: 20.0,
        }
    }
}

impl MatchingOptions {
    /// Loads options from a JSON file; missing fields take their default
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read matching options {:?}", path))?;
        let options: MatchingOptions = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid matching options {:?}", path))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_segment_length", self.max_segment_length),
            (
                "max_segment_orthogonal_distance",
                self.max_segment_orthogonal_distance,
            ),
            (
                "max_segment_midpoint_distance",
                self.max_segment_midpoint_distance,
            ),
        ];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(ConflationError::InvalidOption {
                    name,
                    reason: format!("must be a positive distance, got {}", value),
                });
            }
        }
        if !(0.0..=90.0).contains(&self.max_segment_angle) {
            return Err(ConflationError::InvalidOption {
                name: "max_segment_angle",
                reason: format!("must be within [0, 90] degrees, got {}", self.max_segment_angle),
            });
        }
        if !(self.bounding_box_size >= 0.0) || !self.bounding_box_size.is_finite() {
            return Err(ConflationError::InvalidOption {
                name: "bounding_box_size",
                reason: format!("must be non-negative, got {}", self.bounding_box_size),
            });
        }
        Ok(())
    }

    /// Smallest absolute dot product a segment pair may have
    pub fn min_dot_product(&self) -> f64 {
        self.max_segment_angle.to_radians().cos()
    }

    fn accepts(&self, segment_match: &SegmentMatch) -> bool {
        segment_match.orthogonal_distance <= self.max_segment_orthogonal_distance
            && segment_match.midpoint_distance <= self.max_segment_midpoint_distance
            && segment_match.dot_product.abs() >= self.min_dot_product()
    }
}

/// Buffered way box stored in the candidate R-tree
struct IndexedWay {
    way_id: WayId,
    region: Region,
}

impl RTreeObject for IndexedWay {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.region.envelope()
    }
}

/// Matches a reference way against a set of candidate ways.
///
/// Running [`Self::run`] (or the three phases in order) leaves one
/// [`LineMatch`] per candidate way with its consolidated score.
pub struct LineComparison {
    options: MatchingOptions,
    main: WaySegments,
    /// Candidate way ids per reference segment, filled by the broad phase
    candidate_ways: Vec<BTreeSet<WayId>>,
    /// Segmented candidate ways, cached by id
    candidates: BTreeMap<WayId, WaySegments>,
}

impl LineComparison {
    pub fn new(graph: &EntityGraph, main_way_id: WayId, options: MatchingOptions) -> Result<Self> {
        options.validate()?;
        let main = WaySegments::new(graph, main_way_id, options.max_segment_length)?;
        Ok(Self {
            candidate_ways: vec![BTreeSet::new(); main.len()],
            options,
            main,
            candidates: BTreeMap::new(),
        })
    }

    pub fn options(&self) -> &MatchingOptions {
        &self.options
    }

    pub fn main(&self) -> &WaySegments {
        &self.main
    }

    /// Every candidate way that reached the narrow phase, matched or not
    pub fn candidates(&self) -> &BTreeMap<WayId, WaySegments> {
        &self.candidates
    }

    pub fn candidate_ways_for_segment(&self, index: usize) -> Option<&BTreeSet<WayId>> {
        self.candidate_ways.get(index)
    }

    pub fn line_match(&self, way_id: WayId) -> Option<&LineMatch> {
        self.candidates.get(&way_id).map(WaySegments::line_match)
    }

    /// Candidate ways with at least one consolidated match
    pub fn matched_ways(&self) -> MatchedWays<'_> {
        self.candidates
            .iter()
            .filter(|(_, segments)| segments.line_match().is_matched())
            .map(|(&id, segments)| (id, segments))
            .collect()
    }

    /// Runs candidate selection, segment matching and consolidation
    pub fn run(
        &mut self,
        graph: &EntityGraph,
        candidate_way_ids: impl IntoIterator<Item = WayId>,
    ) -> Result<()> {
        info!(
            "Matching way {} ({} segments)",
            self.main.way_id(),
            self.main.len()
        );
        let start_time = std::time::Instant::now();

        let selected = self.select_candidates(graph, candidate_way_ids)?;
        let found = self.match_segments();
        self.consolidate();

        info!(
            "Way {} matched in {:.2?}: {} candidate ways, {} segment matches, {} matched ways",
            self.main.way_id(),
            start_time.elapsed(),
            selected,
            found,
            self.matched_ways().len()
        );
        Ok(())
    }

    /// Broad phase: attaches to every reference segment the candidate ways
    /// whose buffered boxes overlap its buffered box. Ethereal ways and the
    /// reference way itself are never candidates. Returns how many distinct
    /// ways were attached.
    pub fn select_candidates(
        &mut self,
        graph: &EntityGraph,
        candidate_way_ids: impl IntoIterator<Item = WayId>,
    ) -> Result<usize> {
        let buffer = self.options.bounding_box_size;
        let mut indexed = Vec::new();

        for way_id in candidate_way_ids {
            let way = graph.way(way_id).ok_or(ConflationError::UnknownWay(way_id))?;
            if way_id == self.main.way_id() {
                continue;
            }
            if way.is_ethereal() {
                trace!("Skipping ethereal way {}", way_id);
                continue;
            }
            let Some(region) = graph.way_bounding_box(way_id) else {
                continue;
            };
            indexed.push(IndexedWay {
                way_id,
                region: region.buffered(buffer),
            });
        }

        let tree = RTree::bulk_load(indexed);
        let mut attached = BTreeSet::new();

        for (segment, ways) in self.main.segments().iter().zip(self.candidate_ways.iter_mut()) {
            let search = Region::new(segment.origin(), segment.destination()).buffered(buffer);
            for hit in tree.locate_in_envelope_intersecting(&search.envelope()) {
                ways.insert(hit.way_id);
                attached.insert(hit.way_id);
            }
        }

        for &way_id in &attached {
            if !self.candidates.contains_key(&way_id) {
                let segments = WaySegments::new(graph, way_id, self.options.max_segment_length)?;
                self.candidates.insert(way_id, segments);
            }
        }

        debug!(
            "Broad phase for way {}: {} of {} ways are candidates",
            self.main.way_id(),
            attached.len(),
            tree.size()
        );
        Ok(attached.len())
    }

    /// Narrow phase: records a [`SegmentMatch`] for every reference/candidate
    /// segment pair within the distance and angle limits, replacing the
    /// matches of any earlier pass. Returns the number of matches recorded.
    pub fn match_segments(&mut self) -> usize {
        for segment in self.main.segments_mut() {
            segment.matches.clear();
        }
        for candidate in self.candidates.values_mut() {
            for segment in candidate.segments_mut() {
                segment.matches.clear();
            }
            candidate.line_match.clear();
        }

        let mut found = Vec::new();

        for (segment, ways) in self.main.segments().iter().zip(&self.candidate_ways) {
            for way_id in ways {
                let Some(candidate) = self.candidates.get(way_id) else {
                    continue;
                };
                for candidate_segment in candidate.segments() {
                    let Some(segment_match) = SegmentMatch::measure(segment, candidate_segment)
                    else {
                        continue;
                    };
                    if self.options.accepts(&segment_match) {
                        found.push(segment_match);
                    } else {
                        trace!(
                            "Rejected {:?} -> {:?}: orthogonal {:.1} m, midpoint {:.1} m, dot {:.3}",
                            segment_match.main,
                            segment_match.candidate,
                            segment_match.orthogonal_distance,
                            segment_match.midpoint_distance,
                            segment_match.dot_product
                        );
                    }
                }
            }
        }

        let count = found.len();
        for segment_match in found {
            if let Some(main_segment) = self.main.segment_mut(segment_match.main.index) {
                main_segment.matches.push(segment_match.clone());
            }
            if let Some(candidate) = self.candidates.get_mut(&segment_match.candidate.way_id) {
                if let Some(candidate_segment) =
                    candidate.segment_mut(segment_match.candidate.index)
                {
                    candidate_segment.matches.push(segment_match.clone());
                }
                candidate.line_match.add_match(segment_match);
            }
        }
        count
    }

    /// Collapses every candidate way's matches to one per reference segment
    pub fn consolidate(&mut self) {
        for candidate in self.candidates.values_mut() {
            candidate.line_match.consolidate();
        }
    }

    /// Inserts a node into the reference way or a candidate way, keeping the
    /// match records on the other side pointing at the renumbered segments.
    ///
    /// Raw match lists on both sides gain the trailing half's inherited
    /// matches. Consolidated results are left as they were until the next
    /// [`Self::consolidate`].
    pub fn insert_node(
        &mut self,
        graph: &mut EntityGraph,
        way_id: WayId,
        node_id: NodeId,
        on_segment: usize,
        tolerance: f64,
    ) -> Result<NodeInsertion> {
        let insertion = if way_id == self.main.way_id() {
            self.main
                .insert_node(graph, node_id, on_segment, tolerance)?
        } else {
            self.candidates
                .get_mut(&way_id)
                .ok_or(ConflationError::UnknownWay(way_id))?
                .insert_node(graph, node_id, on_segment, tolerance)?
        };

        let NodeInsertion::Inserted { split_index, .. } = insertion else {
            return Ok(insertion);
        };

        let main_split = way_id == self.main.way_id();
        if main_split {
            // The trailing half covers the same ground as the old segment
            let candidates = self.candidate_ways[split_index].clone();
            self.candidate_ways.insert(split_index + 1, candidates);
            for candidate in self.candidates.values_mut() {
                candidate.shift_matches_after(way_id, split_index);
            }
        } else {
            self.main.shift_matches_after(way_id, split_index);
        }

        // The trailing half inherited the split segment's matches; record the
        // copies on the other side too so both sides list the same pairs
        let split_way = if main_split {
            Some(&self.main)
        } else {
            self.candidates.get(&way_id)
        };
        let inherited = split_way
            .and_then(|segments| segments.segment(split_index + 1))
            .map(|segment| segment.matches().to_vec())
            .unwrap_or_default();
        for segment_match in inherited {
            let other_segment = if main_split {
                self.candidates
                    .get_mut(&segment_match.candidate.way_id)
                    .and_then(|candidate| candidate.segment_mut(segment_match.candidate.index))
            } else {
                self.main.segment_mut(segment_match.main.index)
            };
            if let Some(other_segment) = other_segment {
                other_segment.matches.push(segment_match.clone());
            }
            if let Some(candidate) = self.candidates.get_mut(&segment_match.candidate.way_id) {
                candidate.line_match.add_match(segment_match);
            }
        }
        Ok(insertion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Node, Way};
    use crate::geometry::meters_to_lat_degrees;
    use geo_types::Point;

    fn options() -> MatchingOptions {
        MatchingOptions {
            max_segment_length: 200.0,
            max_segment_orthogonal_distance: 10.0,
            max_segment_midpoint_distance: 20.0,
            max_segment_angle: 30.0,
            bounding_box_size: 20.0,
        }
    }

    /// Reference way 1 plus a parallel way 2 shifted north by `offset` meters
    fn parallel_graph(offset: f64) -> EntityGraph {
        let mut graph = EntityGraph::new();
        let d_lat = meters_to_lat_degrees(offset);
        for (i, lon) in [-118.000, -117.999, -117.998].into_iter().enumerate() {
            let i = i as i64;
            graph.add_node(Node::new(10 + i, Point::new(lon, 34.0))).unwrap();
            graph
                .add_node(Node::new(20 + i, Point::new(lon, 34.0 + d_lat)))
                .unwrap();
        }
        graph.add_way(Way::new(1, vec![10, 11, 12])).unwrap();
        graph.add_way(Way::new(2, vec![20, 21, 22])).unwrap();
        graph
    }

    #[test]
    fn test_options_validation() {
        assert!(MatchingOptions::default().validate().is_ok());

        let mut bad = options();
        bad.max_segment_length = 0.0;
        assert!(matches!(
            bad.validate(),
            Err(ConflationError::InvalidOption {
                name: "max_segment_length",
                ..
            })
        ));

        let mut bad = options();
        bad.max_segment_angle = 120.0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_options_from_json() {
        let path = std::env::temp_dir().join("way_conflation_options_test.json");
        std::fs::write(&path, r#"{ "max_segment_length": 25.0, "max_segment_angle": 20.0 }"#)
            .unwrap();

        let options = MatchingOptions::from_json_file(&path).unwrap();
        assert_eq!(options.max_segment_length, 25.0);
        assert_eq!(options.max_segment_angle, 20.0);
        assert_eq!(
            options.bounding_box_size,
            MatchingOptions::default().bounding_box_size
        );
        assert!((options.min_dot_product() - 20f64.to_radians().cos()).abs() < 1e-12);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_parallel_way_matches_every_segment() {
        let graph = parallel_graph(5.0);
        let mut comparison = LineComparison::new(&graph, 1, options()).unwrap();
        comparison.run(&graph, [1, 2]).unwrap();

        let line_match = comparison.line_match(2).unwrap();
        assert_eq!(line_match.matching_segment_count(), 2);
        assert!((line_match.average_orthogonal_distance() - 5.0).abs() < 0.01);
        assert!((line_match.average_dot_product() - 1.0).abs() < 1e-9);
        assert!(comparison.line_match(1).is_none());

        for segment in comparison.main().segments() {
            assert_eq!(segment.matches().len(), 1);
        }
        assert_eq!(comparison.matched_ways().keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_distant_way_is_not_a_candidate() {
        let graph = parallel_graph(100.0);
        let mut comparison = LineComparison::new(&graph, 1, options()).unwrap();
        comparison.run(&graph, [2]).unwrap();

        assert!(comparison.candidates().is_empty());
        assert!(comparison.candidate_ways_for_segment(0).unwrap().is_empty());
        assert!(comparison.matched_ways().is_empty());
    }

    #[test]
    fn test_offset_beyond_orthogonal_limit_is_rejected() {
        // Within the 20 m box buffer, beyond the 10 m orthogonal limit
        let graph = parallel_graph(15.0);
        let mut comparison = LineComparison::new(&graph, 1, options()).unwrap();
        comparison.run(&graph, [2]).unwrap();

        assert!(comparison.candidates().contains_key(&2));
        assert!(!comparison.line_match(2).unwrap().is_matched());
        assert!(comparison.matched_ways().is_empty());
    }

    #[test]
    fn test_unknown_candidate_way() {
        let graph = parallel_graph(5.0);
        let mut comparison = LineComparison::new(&graph, 1, options()).unwrap();
        assert_eq!(
            comparison.select_candidates(&graph, [7]),
            Err(ConflationError::UnknownWay(7))
        );
    }

    #[test]
    fn test_insert_node_keeps_match_references() {
        let mut graph = parallel_graph(5.0);
        let mut comparison = LineComparison::new(&graph, 1, options()).unwrap();
        comparison.run(&graph, [2]).unwrap();

        graph
            .add_node(Node::new(30, Point::new(-117.9995, 34.0)))
            .unwrap();
        let inserted = comparison.insert_node(&mut graph, 2, 30, 0, 0.0).unwrap();
        assert_eq!(inserted.node_id(), 30);

        let candidate = &comparison.candidates()[&2];
        assert_eq!(candidate.len(), 3);
        // The last reference segment now points at the renumbered candidate segment
        let last_main = &comparison.main().segments()[1];
        assert_eq!(last_main.matches()[0].candidate.index, 2);
        assert_eq!(candidate.segments()[2].matches()[0].candidate.index, 2);
        // The trailing half inherited the split segment's match
        assert_eq!(candidate.segments()[1].matches()[0].candidate.index, 1);
        assert_eq!(candidate.segments()[1].matches()[0].main.index, 0);
        // ...and the reference side lists the inherited pair as well
        let first_main = &comparison.main().segments()[0];
        assert_eq!(first_main.matches().len(), 2);
        assert_eq!(first_main.matches()[1].candidate.index, 1);
        assert_eq!(candidate.line_match().matches().len(), 3);
    }

    #[test]
    fn test_splitting_reference_way_mirrors_inherited_matches() {
        let mut graph = parallel_graph(5.0);
        let mut comparison = LineComparison::new(&graph, 1, options()).unwrap();
        comparison.run(&graph, [2]).unwrap();

        graph
            .add_node(Node::new(31, Point::new(-117.9995, 34.0)))
            .unwrap();
        comparison.insert_node(&mut graph, 1, 31, 0, 0.0).unwrap();

        assert_eq!(comparison.main().len(), 3);
        assert_eq!(comparison.candidate_ways_for_segment(1), comparison.candidate_ways_for_segment(0));
        let trailing = &comparison.main().segments()[1];
        assert_eq!(trailing.matches().len(), 1);
        assert_eq!(trailing.matches()[0].main.index, 1);

        let candidate = &comparison.candidates()[&2];
        let first = candidate.segments()[0].matches();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].main.index, 0);
        assert_eq!(first[1].main.index, 1);
        assert_eq!(candidate.segments()[1].matches()[0].main.index, 2);
        assert_eq!(candidate.line_match().matches().len(), 3);
    }

    #[test]
    fn test_rerunning_replaces_earlier_matches() {
        let graph = parallel_graph(5.0);
        let mut comparison = LineComparison::new(&graph, 1, options()).unwrap();
        comparison.run(&graph, [2]).unwrap();
        comparison.run(&graph, [2]).unwrap();

        for segment in comparison.main().segments() {
            assert_eq!(segment.matches().len(), 1);
        }
        let candidate = &comparison.candidates()[&2];
        for segment in candidate.segments() {
            assert_eq!(segment.matches().len(), 1);
        }
        assert_eq!(candidate.line_match().matches().len(), 2);
        assert_eq!(candidate.line_match().matching_segment_count(), 2);
    }
}
