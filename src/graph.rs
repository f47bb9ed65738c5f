use geo_types::Point;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::entities::{EntityRef, Node, NodeId, Relation, RelationId, Tags, Way, WayId};
use crate::error::{ConflationError, Result};
use crate::geometry::{Region, distance};

/// Arena of nodes, ways and relations keyed by id.
///
/// Ways hold node ids, never nodes. Every node keeps the set of ways that
/// contain it; that index is only ever changed by the way mutation methods on
/// this type, so it can be used as the adjacency structure for path search.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EntityGraph {
    nodes: BTreeMap<NodeId, Node>,
    ways: BTreeMap<WayId, Way>,
    relations: BTreeMap<RelationId, Relation>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, mut node: Node) -> Result<NodeId> {
        if self.nodes.contains_key(&node.id) {
            return Err(ConflationError::DuplicateEntity(node.id));
        }
        let id = node.id;
        node.containing_ways.clear();
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Adds a way and registers it with every node it references.
    /// All nodes must already be in the graph.
    pub fn add_way(&mut self, mut way: Way) -> Result<WayId> {
        if self.ways.contains_key(&way.id) {
            return Err(ConflationError::DuplicateEntity(way.id));
        }
        if let Some(&missing) = way.nodes.iter().find(|id| !self.nodes.contains_key(id)) {
            return Err(ConflationError::UnknownNode(missing));
        }

        let id = way.id;
        way.invalidate_bbox();
        for node_id in &way.nodes {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.containing_ways.insert(id);
            }
        }
        self.ways.insert(id, way);
        Ok(id)
    }

    pub fn add_relation(&mut self, relation: Relation) -> Result<RelationId> {
        if self.relations.contains_key(&relation.id) {
            return Err(ConflationError::DuplicateEntity(relation.id));
        }
        let id = relation.id;
        self.relations.insert(id, relation);
        Ok(id)
    }

    /// Removes a way and detaches it from its nodes. The nodes stay in the graph.
    pub fn remove_way(&mut self, way_id: WayId) -> Result<Way> {
        let way = self
            .ways
            .remove(&way_id)
            .ok_or(ConflationError::UnknownWay(way_id))?;
        for node_id in &way.nodes {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.containing_ways.remove(&way_id);
            }
        }
        Ok(way)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn way(&self, id: WayId) -> Option<&Way> {
        self.ways.get(&id)
    }

    pub fn relation(&self, id: RelationId) -> Option<&Relation> {
        self.relations.get(&id)
    }

    pub fn node_tags_mut(&mut self, id: NodeId) -> Option<&mut Tags> {
        self.nodes.get_mut(&id).map(|node| &mut node.tags)
    }

    pub fn way_tags_mut(&mut self, id: WayId) -> Option<&mut Tags> {
        self.ways.get_mut(&id).map(|way| &mut way.tags)
    }

    pub fn relation_mut(&mut self, id: RelationId) -> Option<&mut Relation> {
        self.relations.get_mut(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn ways(&self) -> impl Iterator<Item = &Way> {
        self.ways.values()
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    pub fn coordinate(&self, node_id: NodeId) -> Result<Point<f64>> {
        self.nodes
            .get(&node_id)
            .map(|node| node.coordinate)
            .ok_or(ConflationError::UnknownNode(node_id))
    }

    /// Moves a node. Every way containing it loses its cached bounding box.
    pub fn set_node_coordinate(&mut self, node_id: NodeId, coordinate: Point<f64>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(ConflationError::UnknownNode(node_id))?;
        node.coordinate = coordinate;
        for way_id in &node.containing_ways {
            if let Some(way) = self.ways.get_mut(way_id) {
                way.invalidate_bbox();
            }
        }
        Ok(())
    }

    pub fn ways_containing(&self, node_id: NodeId) -> impl Iterator<Item = WayId> + '_ {
        self.nodes
            .get(&node_id)
            .into_iter()
            .flat_map(|node| node.containing_ways.iter().copied())
    }

    pub fn way_append_node(&mut self, way_id: WayId, node_id: NodeId) -> Result<()> {
        let len = self.way_len(way_id)?;
        self.way_insert_node(way_id, node_id, len)
    }

    /// Inserts `node_id` before position `index` (or at the end when `index`
    /// equals the way's length)
    pub fn way_insert_node(&mut self, way_id: WayId, node_id: NodeId, index: usize) -> Result<()> {
        if !self.nodes.contains_key(&node_id) {
            return Err(ConflationError::UnknownNode(node_id));
        }
        let way = self
            .ways
            .get_mut(&way_id)
            .ok_or(ConflationError::UnknownWay(way_id))?;
        if index > way.nodes.len() {
            return Err(ConflationError::PositionOutOfRange {
                way_id,
                index,
                len: way.nodes.len(),
            });
        }

        way.nodes.insert(index, node_id);
        way.invalidate_bbox();
        self.attach(way_id, node_id);
        Ok(())
    }

    /// Replaces every occurrence of `old` in the way with `new`, or removes
    /// them when `new` is `None`.
    pub fn way_replace_node(
        &mut self,
        way_id: WayId,
        old: NodeId,
        new: Option<NodeId>,
    ) -> Result<()> {
        if let Some(new_id) = new {
            if !self.nodes.contains_key(&new_id) {
                return Err(ConflationError::UnknownNode(new_id));
            }
        }
        let way = self
            .ways
            .get_mut(&way_id)
            .ok_or(ConflationError::UnknownWay(way_id))?;
        if !way.nodes.contains(&old) {
            return Err(ConflationError::NodeNotInWay {
                way_id,
                node_id: old,
            });
        }

        match new {
            Some(new_id) => {
                for id in way.nodes.iter_mut().filter(|id| **id == old) {
                    *id = new_id;
                }
            }
            None => way.nodes.retain(|&id| id != old),
        }
        way.invalidate_bbox();

        if let Some(new_id) = new {
            self.attach(way_id, new_id);
        }
        self.detach(way_id, old);
        Ok(())
    }

    /// Rebuilds every node's containing-way set from the ways' node lists.
    /// Needed after deserializing a graph, since the index is not stored.
    pub fn recompute_back_references(&mut self) {
        for node in self.nodes.values_mut() {
            node.containing_ways.clear();
        }
        for way in self.ways.values_mut() {
            way.invalidate_bbox();
            for node_id in &way.nodes {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.containing_ways.insert(way.id);
                }
            }
        }
        debug!(
            "Recomputed back-references for {} nodes and {} ways",
            self.nodes.len(),
            self.ways.len()
        );
    }

    /// Union of the way's node boxes, memoized until the way or one of its
    /// nodes changes. `None` for an unknown or empty way.
    pub fn way_bounding_box(&self, way_id: WayId) -> Option<Region> {
        let way = self.ways.get(&way_id)?;
        if let Some(region) = way.bbox.get() {
            return Some(*region);
        }

        let region = Region::from_points(
            way.nodes
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(|node| node.coordinate),
        )?;
        Some(*way.bbox.get_or_init(|| region))
    }

    /// Union of the member boxes. Members missing from the graph, including
    /// nested relations, are skipped; `Ok(None)` when no member has a box.
    pub fn relation_bounding_box(&self, relation_id: RelationId) -> Result<Option<Region>> {
        if !self.relations.contains_key(&relation_id) {
            return Err(ConflationError::UnknownRelation(relation_id));
        }
        let mut visited = HashSet::new();
        Ok(self.relation_bounding_box_inner(relation_id, &mut visited))
    }

    fn relation_bounding_box_inner(
        &self,
        relation_id: RelationId,
        visited: &mut HashSet<RelationId>,
    ) -> Option<Region> {
        if !visited.insert(relation_id) {
            return None;
        }
        let relation = self.relations.get(&relation_id)?;

        let mut result: Option<Region> = None;
        for member in &relation.members {
            let member_box = match member.entity {
                EntityRef::Node(id) => self.nodes.get(&id).map(Node::bounding_box),
                EntityRef::Way(id) => self.way_bounding_box(id),
                EntityRef::Relation(id) => self.relation_bounding_box_inner(id, visited),
            };
            if let Some(member_box) = member_box {
                match result.as_mut() {
                    Some(region) => region.union_in_place(&member_box),
                    None => result = Some(member_box),
                }
            }
        }
        result
    }

    pub fn index_of_node(&self, way_id: WayId, node_id: NodeId) -> Option<usize> {
        self.ways.get(&way_id)?.index_of_node(node_id)
    }

    /// Closest node of the way at or under `tolerance` meters from `point`.
    /// On equal distances the node seen first in way order wins.
    pub fn nearest_node_within(
        &self,
        way_id: WayId,
        point: Point<f64>,
        tolerance: f64,
    ) -> Option<NodeId> {
        let way = self.ways.get(&way_id)?;
        let mut best: Option<(NodeId, f64)> = None;

        for node_id in &way.nodes {
            let Some(node) = self.nodes.get(node_id) else {
                continue;
            };
            let d = distance(point, node.coordinate);
            if d > tolerance {
                continue;
            }
            if best.is_none_or(|(_, best_d)| d < best_d) {
                best = Some((*node_id, d));
            }
        }

        best.map(|(id, _)| id)
    }

    /// Coordinates of the way's nodes in order
    pub fn way_points(&self, way_id: WayId) -> Result<Vec<Point<f64>>> {
        let way = self
            .ways
            .get(&way_id)
            .ok_or(ConflationError::UnknownWay(way_id))?;
        way.nodes.iter().map(|&id| self.coordinate(id)).collect()
    }

    /// Length of the way in meters
    pub fn way_length(&self, way_id: WayId) -> Result<f64> {
        let points = self.way_points(way_id)?;
        Ok(points.windows(2).map(|w| distance(w[0], w[1])).sum())
    }

    fn way_len(&self, way_id: WayId) -> Result<usize> {
        self.ways
            .get(&way_id)
            .map(|way| way.nodes.len())
            .ok_or(ConflationError::UnknownWay(way_id))
    }

    fn attach(&mut self, way_id: WayId, node_id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.containing_ways.insert(way_id);
        }
    }

    /// Drops `way_id` from the node's set unless the way still references it
    fn detach(&mut self, way_id: WayId, node_id: NodeId) {
        let still_contained = self
            .ways
            .get(&way_id)
            .is_some_and(|way| way.nodes.contains(&node_id));
        if still_contained {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.containing_ways.remove(&way_id);
        }
    }
}
