use thiserror::Error;

use crate::entities::{NodeId, RelationId, WayId};

/// Errors raised by graph mutations, segmentation and path-search setup.
///
/// Dead ends, one-way blocks and cycle rejections during path search are not
/// errors; see [`crate::path_tree::ProcessOutcome`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConflationError {
    #[error("node {0} does not exist in the graph")]
    UnknownNode(NodeId),

    #[error("way {0} does not exist in the graph")]
    UnknownWay(WayId),

    #[error("relation {0} does not exist in the graph")]
    UnknownRelation(RelationId),

    #[error("an entity with id {0} already exists")]
    DuplicateEntity(i64),

    #[error("tag key {0:?} is already set")]
    DuplicateTag(String),

    #[error("way {0} has no segments to extend")]
    NoSegments(WayId),

    #[error("segment index {index} out of range for way {way_id} ({len} segments)")]
    SegmentOutOfRange {
        way_id: WayId,
        index: usize,
        len: usize,
    },

    #[error("node {node_id} is not part of way {way_id}")]
    NodeNotInWay { way_id: WayId, node_id: NodeId },

    #[error("insert position {index} out of range for way {way_id} ({len} nodes)")]
    PositionOutOfRange {
        way_id: WayId,
        index: usize,
        len: usize,
    },

    #[error("path search needs at least one stop")]
    EmptyStops,

    #[error("start way {0} has no consolidated matches")]
    StartWayNotMatched(WayId),

    #[error("no matched way contains stop node {0}")]
    NoStartWay(NodeId),

    #[error("invalid matching option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConflationError>;
