//! Way conflation: matches the ways of a reference line (for example a
//! transit route shape) against the ways of a street or rail network, then
//! searches the matched ways for the best connected path.
//!
//! The pipeline is
//! [`EntityGraph`] -> [`WaySegments`] -> [`LineComparison`] -> [`PathTree`].

pub mod debug;
pub mod entities;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod graph_cache;
pub mod line_comparison;
pub mod line_match;
pub mod osm_import;
pub mod path_tree;
pub mod segments;

pub use debug::DebugVisualizer;
pub use entities::{EntityRef, Member, Node, NodeId, Oneway, Relation, RelationId, Tags, Way, WayId};
pub use error::{ConflationError, Result};
pub use geometry::Region;
pub use graph::EntityGraph;
pub use line_comparison::{LineComparison, MatchedWays, MatchingOptions};
pub use line_match::{LineMatch, SegmentMatch, SegmentRef};
pub use path_tree::{Path, PathSegment, PathTree, ProcessOutcome, TravelDirection};
pub use segments::{LineSegment, NodeInsertion, WaySegments};
