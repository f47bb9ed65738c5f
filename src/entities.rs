use geo_types::Point;
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ConflationError, Result};
use crate::geometry::Region;

pub type NodeId = i64;
pub type WayId = i64;
pub type RelationId = i64;

/// Ordered key/value tags, as carried by OSM entities
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Adds a new tag, refusing to overwrite an existing key
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        if self.0.contains_key(&key) {
            return Err(ConflationError::DuplicateTag(key));
        }
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Sets a tag, returning the previous value if there was one
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Tags(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One-way restriction of a way, relative to its node order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Oneway {
    /// Travel allowed in both directions
    No,
    /// `oneway=yes`: only front-to-back travel
    Forward,
    /// `oneway=-1`: only back-to-front travel
    Reverse,
}

impl Oneway {
    pub fn from_tags(tags: &Tags) -> Self {
        match tags.get("oneway") {
            Some("yes") | Some("true") | Some("1") => Oneway::Forward,
            Some("-1") | Some("reverse") => Oneway::Reverse,
            _ => Oneway::No,
        }
    }
}

/// Highway values for ways that have no physical street to follow
const ETHEREAL_HIGHWAY_VALUES: [&str; 5] =
    ["proposed", "construction", "abandoned", "razed", "platform"];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub(crate) coordinate: Point<f64>,
    pub tags: Tags,
    /// Ways currently containing this node. Maintained by [`crate::graph::EntityGraph`].
    #[serde(skip)]
    pub(crate) containing_ways: BTreeSet<WayId>,
}

impl Node {
    pub fn new(id: NodeId, coordinate: Point<f64>) -> Self {
        Self {
            id,
            coordinate,
            tags: Tags::new(),
            containing_ways: BTreeSet::new(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn coordinate(&self) -> Point<f64> {
        self.coordinate
    }

    pub fn containing_ways(&self) -> &BTreeSet<WayId> {
        &self.containing_ways
    }

    /// Zero-area box at the node's position
    pub fn bounding_box(&self) -> Region {
        Region::from_point(self.coordinate)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Way {
    pub id: WayId,
    pub(crate) nodes: Vec<NodeId>,
    pub tags: Tags,
    #[serde(skip)]
    pub(crate) bbox: OnceCell<Region>,
}

impl Way {
    pub fn new(id: WayId, nodes: Vec<NodeId>) -> Self {
        Self {
            id,
            nodes,
            tags: Tags::new(),
            bbox: OnceCell::new(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn first_node(&self) -> Option<NodeId> {
        self.nodes.first().copied()
    }

    pub fn last_node(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
    }

    pub fn index_of_node(&self, node_id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|&id| id == node_id)
    }

    pub fn oneway(&self) -> Oneway {
        Oneway::from_tags(&self.tags)
    }

    /// Whether this way is a non-physical feature that must never be matched
    pub fn is_ethereal(&self) -> bool {
        if self.tags.get("ethereal") == Some("yes") {
            return true;
        }
        self.tags
            .get("highway")
            .is_some_and(|highway| ETHEREAL_HIGHWAY_VALUES.contains(&highway))
    }

    pub(crate) fn invalidate_bbox(&mut self) {
        self.bbox.take();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRef {
    Node(NodeId),
    Way(WayId),
    Relation(RelationId),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub entity: EntityRef,
    pub role: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub members: Vec<Member>,
    pub tags: Tags,
}

impl Relation {
    pub fn new(id: RelationId) -> Self {
        Self {
            id,
            members: Vec::new(),
            tags: Tags::new(),
        }
    }

    pub fn add_member(&mut self, entity: EntityRef, role: impl Into<String>) {
        self.members.push(Member {
            entity,
            role: role.into(),
        });
    }
}
