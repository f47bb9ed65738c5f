use geo_types::{Coord, Point};
use log::{debug, trace};

use crate::entities::{NodeId, WayId};
use crate::error::{ConflationError, Result};
use crate::geometry::{METERS_PER_DEGREE, distance, interpolate};
use crate::graph::EntityGraph;
use crate::line_match::{LineMatch, SegmentMatch};

/// Directed edge between two points of a way.
///
/// `index` is the position in the owning [`WaySegments`]; `node_index` is the
/// position of the way node the segment starts from (or, for interpolated
/// pieces, of the real node the piece was cut after). Interpolated endpoints
/// have no node anchor.
#[derive(Clone, Debug)]
pub struct LineSegment {
    way_id: WayId,
    pub(crate) index: usize,
    pub(crate) node_index: usize,
    origin: Point<f64>,
    destination: Point<f64>,
    origin_node: Option<NodeId>,
    destination_node: Option<NodeId>,
    vector: Coord<f64>,
    orthogonal_vector: Coord<f64>,
    midpoint: Point<f64>,
    vector_magnitude: f64,
    length: f64,
    pub(crate) matches: Vec<SegmentMatch>,
}

impl LineSegment {
    pub fn new(
        way_id: WayId,
        index: usize,
        node_index: usize,
        (origin, origin_node): (Point<f64>, Option<NodeId>),
        (destination, destination_node): (Point<f64>, Option<NodeId>),
    ) -> Self {
        let vector = Coord {
            x: destination.x() - origin.x(),
            y: destination.y() - origin.y(),
        };
        Self {
            way_id,
            index,
            node_index,
            origin,
            destination,
            origin_node,
            destination_node,
            vector,
            orthogonal_vector: Coord {
                x: -vector.y,
                y: vector.x,
            },
            midpoint: interpolate(origin, destination, 0.5),
            vector_magnitude: vector.x.hypot(vector.y),
            length: distance(origin, destination),
            matches: Vec::new(),
        }
    }

    pub fn way_id(&self) -> WayId {
        self.way_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn origin(&self) -> Point<f64> {
        self.origin
    }

    pub fn destination(&self) -> Point<f64> {
        self.destination
    }

    pub fn origin_node(&self) -> Option<NodeId> {
        self.origin_node
    }

    pub fn destination_node(&self) -> Option<NodeId> {
        self.destination_node
    }

    /// (lon, lat) delta from origin to destination, in degrees
    pub fn vector(&self) -> Coord<f64> {
        self.vector
    }

    /// Left normal of [`Self::vector`]
    pub fn orthogonal_vector(&self) -> Coord<f64> {
        self.orthogonal_vector
    }

    pub fn midpoint(&self) -> Point<f64> {
        self.midpoint
    }

    pub fn vector_magnitude(&self) -> f64 {
        self.vector_magnitude
    }

    /// Length in meters
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Direction vector in local meters, scaled with `cos_lat`
    pub(crate) fn metric_vector(&self, cos_lat: f64) -> Coord<f64> {
        Coord {
            x: self.vector.x * cos_lat * METERS_PER_DEGREE,
            y: self.vector.y * METERS_PER_DEGREE,
        }
    }

    pub fn matches(&self) -> &[SegmentMatch] {
        &self.matches
    }

    pub fn is_matched(&self) -> bool {
        !self.matches.is_empty()
    }

    /// Rebuilds the segment with a new end, keeping identity and matches
    fn truncated(&self, destination: Point<f64>, destination_node: Option<NodeId>) -> Self {
        let mut truncated = LineSegment::new(
            self.way_id,
            self.index,
            self.node_index,
            (self.origin, self.origin_node),
            (destination, destination_node),
        );
        truncated.matches = self.matches.clone();
        truncated
    }
}

/// Outcome of [`WaySegments::insert_node`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeInsertion {
    /// An existing way node was within tolerance and nothing changed
    Snapped(NodeId),
    /// The node was spliced in, splitting the segment at `split_index`
    Inserted { node_id: NodeId, split_index: usize },
}

impl NodeInsertion {
    pub fn node_id(&self) -> NodeId {
        match *self {
            NodeInsertion::Snapped(id) => id,
            NodeInsertion::Inserted { node_id, .. } => node_id,
        }
    }
}

/// A way cut into contiguous segments no longer than `max_segment_length`,
/// with the match aggregation for that way.
#[derive(Clone, Debug)]
pub struct WaySegments {
    way_id: WayId,
    max_segment_length: f64,
    segments: Vec<LineSegment>,
    pub(crate) line_match: LineMatch,
}

impl WaySegments {
    pub fn new(graph: &EntityGraph, way_id: WayId, max_segment_length: f64) -> Result<Self> {
        let way = graph.way(way_id).ok_or(ConflationError::UnknownWay(way_id))?;
        let mut segments = Vec::with_capacity(way.nodes().len());

        for (node_index, pair) in way.nodes().windows(2).enumerate() {
            let (origin_id, destination_id) = (pair[0], pair[1]);
            let origin = graph.coordinate(origin_id)?;
            let destination = graph.coordinate(destination_id)?;
            let length = distance(origin, destination);

            if length < max_segment_length {
                segments.push(LineSegment::new(
                    way_id,
                    segments.len(),
                    node_index,
                    (origin, Some(origin_id)),
                    (destination, Some(destination_id)),
                ));
                continue;
            }

            let pieces = (length / max_segment_length).ceil() as usize;
            for piece in 0..pieces {
                let start = interpolate(origin, destination, piece as f64 / pieces as f64);
                let end = interpolate(origin, destination, (piece + 1) as f64 / pieces as f64);
                let start_node = (piece == 0).then_some(origin_id);
                let end_node = (piece + 1 == pieces).then_some(destination_id);
                // Exact endpoints keep the chain contiguous despite rounding
                let start = if piece == 0 { origin } else { start };
                let end = if piece + 1 == pieces { destination } else { end };

                segments.push(LineSegment::new(
                    way_id,
                    segments.len(),
                    node_index,
                    (start, start_node),
                    (end, end_node),
                ));
            }
            trace!(
                "Way {} nodes {}->{} split into {} pieces ({:.1} m)",
                way_id, origin_id, destination_id, pieces, length
            );
        }

        debug!(
            "Way {} segmented into {} segments (max {} m)",
            way_id,
            segments.len(),
            max_segment_length
        );

        Ok(Self {
            way_id,
            max_segment_length,
            segments,
            line_match: LineMatch::new(way_id),
        })
    }

    pub fn way_id(&self) -> WayId {
        self.way_id
    }

    pub fn max_segment_length(&self) -> f64 {
        self.max_segment_length
    }

    pub fn segments(&self) -> &[LineSegment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&LineSegment> {
        self.segments.get(index)
    }

    pub(crate) fn segments_mut(&mut self) -> impl Iterator<Item = &mut LineSegment> {
        self.segments.iter_mut()
    }

    pub(crate) fn segment_mut(&mut self, index: usize) -> Option<&mut LineSegment> {
        self.segments.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn line_match(&self) -> &LineMatch {
        &self.line_match
    }

    pub fn matched_segments(&self) -> impl DoubleEndedIterator<Item = &LineSegment> {
        self.segments.iter().filter(|segment| segment.is_matched())
    }

    /// Total length in meters
    pub fn length(&self) -> f64 {
        self.segments.iter().map(LineSegment::length).sum()
    }

    /// Segment endpoints in order, including interpolated vertices
    pub fn points(&self) -> Vec<Point<f64>> {
        let mut points = Vec::with_capacity(self.segments.len() + 1);
        if let Some(first) = self.segments.first() {
            points.push(first.origin);
        }
        points.extend(self.segments.iter().map(|segment| segment.destination));
        points
    }

    /// Splits segment `on_segment` at `node_id` and splices the node into the
    /// way. With a positive `tolerance`, an existing way node within that many
    /// meters is returned instead and nothing is modified.
    ///
    /// The trailing half of the split inherits the matches of the original
    /// segment.
    pub fn insert_node(
        &mut self,
        graph: &mut EntityGraph,
        node_id: NodeId,
        on_segment: usize,
        tolerance: f64,
    ) -> Result<NodeInsertion> {
        let point = graph.coordinate(node_id)?;
        let len = self.segments.len();
        let segment = self
            .segments
            .get(on_segment)
            .ok_or(ConflationError::SegmentOutOfRange {
                way_id: self.way_id,
                index: on_segment,
                len,
            })?;

        if tolerance > 0.0 {
            if let Some(existing) = graph.nearest_node_within(self.way_id, point, tolerance) {
                debug!(
                    "Node {} snapped to existing node {} of way {}",
                    node_id, existing, self.way_id
                );
                return Ok(NodeInsertion::Snapped(existing));
            }
        }

        // The graph is the only fallible step, so it goes first
        graph.way_insert_node(self.way_id, node_id, segment.node_index + 1)?;

        let split_index = segment.index;
        let mut trailing = LineSegment::new(
            self.way_id,
            split_index + 1,
            segment.node_index + 1,
            (point, Some(node_id)),
            (segment.destination, segment.destination_node),
        );
        trailing.matches = segment.matches.clone();
        for segment_match in trailing.matches.iter_mut() {
            segment_match.retarget(self.way_id, split_index, split_index + 1);
        }
        let truncated = segment.truncated(point, Some(node_id));

        self.shift_after(split_index);
        self.segments[on_segment] = truncated;
        self.segments.insert(on_segment + 1, trailing);

        debug!(
            "Inserted node {} into way {} after segment {}",
            node_id, self.way_id, split_index
        );

        Ok(NodeInsertion::Inserted {
            node_id,
            split_index,
        })
    }

    /// Extends the way with one segment ending at `node_id`
    pub fn append_node(&mut self, graph: &mut EntityGraph, node_id: NodeId) -> Result<()> {
        let last = self
            .segments
            .last()
            .ok_or(ConflationError::NoSegments(self.way_id))?;
        let point = graph.coordinate(node_id)?;

        graph.way_append_node(self.way_id, node_id)?;

        let segment = LineSegment::new(
            self.way_id,
            last.index + 1,
            last.node_index + 1,
            (last.destination, last.destination_node),
            (point, Some(node_id)),
        );
        self.segments.push(segment);
        Ok(())
    }

    /// Renumbers every segment after `split_index`, along with all match
    /// records that point at them.
    fn shift_after(&mut self, split_index: usize) {
        for segment in self.segments.iter_mut() {
            if segment.index > split_index {
                segment.index += 1;
                segment.node_index += 1;
            }
        }
        self.shift_matches_after(self.way_id, split_index);
    }

    /// Renumbers match records referring to segments of `way_id` after
    /// `split_index`; used when that way was split elsewhere.
    pub(crate) fn shift_matches_after(&mut self, way_id: WayId, split_index: usize) {
        for segment in self.segments.iter_mut() {
            for segment_match in segment.matches.iter_mut() {
                segment_match.shift_after(way_id, split_index);
            }
        }
        self.line_match.shift_after(way_id, split_index);
    }
}
