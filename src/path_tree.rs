use log::{debug, info, trace, warn};
use std::collections::BTreeSet;

use crate::entities::{NodeId, Oneway, WayId};
use crate::error::{ConflationError, Result};
use crate::graph::EntityGraph;
use crate::line_comparison::MatchedWays;
use crate::segments::WaySegments;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TravelDirection {
    /// Along the way's node order
    Forward,
    /// Against the way's node order
    Reverse,
}

impl TravelDirection {
    /// Forward when the way's matches run with the reference line on average
    pub fn from_dot_product(average_dot_product: f64) -> Self {
        if average_dot_product >= 0.0 {
            TravelDirection::Forward
        } else {
            TravelDirection::Reverse
        }
    }
}

/// Result of expanding one [`PathSegment`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Travel along the way is forbidden by its one-way restriction; the
    /// segment could not be constructed
    Blocked,
    /// Constructed, but no matched way continues from here; the path ends on
    /// this segment
    DeadEnd,
    /// Continuations were searched; the segment may still have no children
    Continued,
}

impl ProcessOutcome {
    /// Whether a child with this outcome was successfully constructed and so
    /// stays in the tree. Only blocked children are pruned.
    pub fn is_retained(self) -> bool {
        self != ProcessOutcome::Blocked
    }
}

/// One step of the search tree: a matched way travelled in one direction
#[derive(Clone, Debug)]
pub struct PathSegment {
    pub way_id: WayId,
    pub direction: TravelDirection,
    pub oneway: Oneway,
    /// Node the path entered this way through; `None` for an unanchored root
    pub entry_node: Option<NodeId>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub depth: usize,
    /// Match score of the way, see [`crate::line_match::LineMatch::score`]
    pub score: f64,
    pub outcome: ProcessOutcome,
}

impl PathSegment {
    fn new(
        way_segments: &WaySegments,
        oneway: Oneway,
        entry_node: Option<NodeId>,
        parent: Option<usize>,
        depth: usize,
    ) -> Self {
        let line_match = way_segments.line_match();
        Self {
            way_id: way_segments.way_id(),
            direction: TravelDirection::from_dot_product(line_match.average_dot_product()),
            oneway,
            entry_node,
            parent,
            children: Vec::new(),
            depth,
            score: line_match.score(),
            outcome: ProcessOutcome::Continued,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Root-to-leaf sequence of path segments
#[derive(Clone, Debug)]
pub struct Path {
    pub segments: Vec<PathSegment>,
    pub score: f64,
}

impl Path {
    pub fn way_ids(&self) -> Vec<WayId> {
        self.segments.iter().map(|segment| segment.way_id).collect()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Tree of every simple path through the matched ways from a start way.
///
/// Segments live in an arena and point at their parent by index. A way never
/// appears twice on one root-to-leaf chain.
#[derive(Clone, Debug)]
pub struct PathTree {
    segments: Vec<PathSegment>,
}

impl PathTree {
    /// Builds the tree rooted at `start_way`, entered through `origin_node`
    /// when given. The start way must have consolidated matches.
    pub fn build(
        graph: &EntityGraph,
        matched: &MatchedWays<'_>,
        start_way: WayId,
        origin_node: Option<NodeId>,
    ) -> Result<Self> {
        let start = matched
            .get(&start_way)
            .filter(|segments| segments.line_match().is_matched())
            .ok_or(ConflationError::StartWayNotMatched(start_way))?;
        let way = graph
            .way(start_way)
            .ok_or(ConflationError::UnknownWay(start_way))?;

        info!(
            "Building path tree from way {} over {} matched ways",
            start_way,
            matched.len()
        );
        let start_time = std::time::Instant::now();

        let mut tree = Self {
            segments: vec![PathSegment::new(start, way.oneway(), origin_node, None, 0)],
        };
        let outcome = tree.process(0, graph, matched);
        if outcome == ProcessOutcome::Blocked {
            warn!(
                "Start way {} cannot be travelled in its matched direction",
                start_way
            );
        }

        info!(
            "Path tree from way {} built in {:.2?}: {} segments, {} leaves, max depth {}",
            start_way,
            start_time.elapsed(),
            tree.segments.len(),
            tree.leaves().count(),
            tree.max_depth()
        );
        Ok(tree)
    }

    /// Builds the tree starting at the first stop: the start way is the
    /// lowest-id matched way containing that stop's node.
    pub fn for_stops(
        graph: &EntityGraph,
        matched: &MatchedWays<'_>,
        stops: &[NodeId],
    ) -> Result<Self> {
        let &first_stop = stops.first().ok_or(ConflationError::EmptyStops)?;
        let start_way = graph
            .ways_containing(first_stop)
            .find(|way_id| {
                matched
                    .get(way_id)
                    .is_some_and(|segments| segments.line_match().is_matched())
            })
            .ok_or(ConflationError::NoStartWay(first_stop))?;

        Self::build(graph, matched, start_way, Some(first_stop))
    }

    pub fn root(&self) -> &PathSegment {
        &self.segments[0]
    }

    pub fn segment(&self, index: usize) -> Option<&PathSegment> {
        self.segments.get(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.segments.iter().map(|s| s.depth).max().unwrap_or(0)
    }

    /// Childless segments in discovery order. The root is always part of the
    /// tree, even when its own one-way restriction blocks it.
    pub fn leaves(&self) -> impl Iterator<Item = &PathSegment> {
        self.segments.iter().filter(|segment| segment.is_leaf())
    }

    /// One path per leaf, in discovery order
    pub fn find_paths(&self) -> Vec<Path> {
        let mut paths = Vec::new();

        for (index, segment) in self.segments.iter().enumerate() {
            if !segment.is_leaf() {
                continue;
            }

            let mut chain = Vec::with_capacity(segment.depth + 1);
            let mut current = Some(index);
            while let Some(i) = current {
                chain.push(self.segments[i].clone());
                current = self.segments[i].parent;
            }
            chain.reverse();

            let score = chain.iter().map(|s| s.score).sum();
            paths.push(Path {
                segments: chain,
                score,
            });
        }

        debug!("Found {} paths", paths.len());
        paths
    }

    /// Highest-scoring path; equal scores keep the first one discovered
    pub fn best_path(&self) -> Option<Path> {
        let mut best: Option<Path> = None;
        for path in self.find_paths() {
            if best.as_ref().is_none_or(|b| path.score > b.score) {
                best = Some(path);
            }
        }
        if let Some(path) = &best {
            info!(
                "Best path covers {} ways with score {:.3}: {:?}",
                path.len(),
                path.score,
                path.way_ids()
            );
        }
        best
    }

    /// Expands segment `index` depth-first and records its outcome
    fn process(
        &mut self,
        index: usize,
        graph: &EntityGraph,
        matched: &MatchedWays<'_>,
    ) -> ProcessOutcome {
        let outcome = self.expand(index, graph, matched);
        self.segments[index].outcome = outcome;
        outcome
    }

    fn expand(
        &mut self,
        index: usize,
        graph: &EntityGraph,
        matched: &MatchedWays<'_>,
    ) -> ProcessOutcome {
        let segment = &self.segments[index];
        let (way_id, direction, oneway, entry_node, depth) = (
            segment.way_id,
            segment.direction,
            segment.oneway,
            segment.entry_node,
            segment.depth,
        );
        let (Some(way), Some(way_segments)) = (graph.way(way_id), matched.get(&way_id)) else {
            return ProcessOutcome::DeadEnd;
        };

        if is_blocked(direction, oneway, entry_node, way.nodes()) {
            debug!(
                "{}Way {} blocked: travelling {:?} against {:?}",
                indent(depth),
                way_id,
                direction,
                oneway
            );
            return ProcessOutcome::Blocked;
        }

        let exits = exit_nodes(way_segments, direction);

        let mut intersections: Vec<(WayId, NodeId)> = Vec::new();
        let mut seen = BTreeSet::new();
        for &node_id in &exits {
            if Some(node_id) == entry_node {
                continue;
            }
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            if node.containing_ways().len() < 2 {
                continue;
            }
            for &other in node.containing_ways() {
                if other != way_id && matched.contains_key(&other) && seen.insert(other) {
                    intersections.push((other, node_id));
                }
            }
        }

        if intersections.is_empty() {
            trace!("{}Way {} is a dead end", indent(depth), way_id);
            return ProcessOutcome::DeadEnd;
        }

        for (next_way, via_node) in intersections {
            let Some(next_segments) = matched.get(&next_way) else {
                continue;
            };
            if next_segments.line_match().matching_segment_count() == 0 {
                continue;
            }
            if self.has_ancestor(index, next_way) {
                trace!(
                    "{}Skipping way {}: already on this path",
                    indent(depth),
                    next_way
                );
                continue;
            }
            let Some(next) = graph.way(next_way) else {
                continue;
            };

            let child = self.segments.len();
            self.segments.push(PathSegment::new(
                next_segments,
                next.oneway(),
                Some(via_node),
                Some(index),
                depth + 1,
            ));
            debug!(
                "{}Way {} -> way {} via node {}",
                indent(depth),
                way_id,
                next_way,
                via_node
            );

            if self.process(child, graph, matched).is_retained() {
                self.segments[index].children.push(child);
            } else {
                // A blocked segment never gets children, so it is the last entry
                self.segments.truncate(child);
            }
        }

        ProcessOutcome::Continued
    }

    /// Whether `way_id` is the way of `index` or of any of its ancestors
    fn has_ancestor(&self, index: usize, way_id: WayId) -> bool {
        let mut current = Some(index);
        while let Some(i) = current {
            if self.segments[i].way_id == way_id {
                return true;
            }
            current = self.segments[i].parent;
        }
        false
    }
}

/// Whether the one-way restriction forbids travelling the way in `direction`,
/// or forbids leaving `entry_node` at all because it is the way's final node
/// in the only permitted direction.
fn is_blocked(
    direction: TravelDirection,
    oneway: Oneway,
    entry_node: Option<NodeId>,
    nodes: &[NodeId],
) -> bool {
    match (direction, oneway) {
        (TravelDirection::Forward, Oneway::Reverse) | (TravelDirection::Reverse, Oneway::Forward) => {
            return true;
        }
        _ => {}
    }

    let Some(entry) = entry_node else {
        return false;
    };
    match oneway {
        Oneway::Forward => nodes.last() == Some(&entry),
        Oneway::Reverse => nodes.first() == Some(&entry),
        Oneway::No => false,
    }
}

/// Real nodes ending a matched segment, in travel order
fn exit_nodes(way_segments: &WaySegments, direction: TravelDirection) -> Vec<NodeId> {
    let ends: Vec<Option<NodeId>> = match direction {
        TravelDirection::Forward => way_segments
            .matched_segments()
            .map(|segment| segment.destination_node())
            .collect(),
        TravelDirection::Reverse => way_segments
            .matched_segments()
            .rev()
            .map(|segment| segment.origin_node())
            .collect(),
    };

    let mut nodes: Vec<NodeId> = Vec::with_capacity(ends.len());
    for node_id in ends.into_iter().flatten() {
        if !nodes.contains(&node_id) {
            nodes.push(node_id);
        }
    }
    nodes
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}
