use anyhow::{Context, Result};
use geo_types::Point;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use osmpbf::{Element, ElementReader, RelMemberType};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use crate::entities::{EntityRef, Node, NodeId, Relation, Tags, Way, WayId};
use crate::graph::EntityGraph;

/// Keys marking a way as part of the street, rail or transit network
const NETWORK_KEYS: [&str; 3] = ["highway", "railway", "public_transport"];

/// Default way filter for [`import_pbf`]
pub fn is_network_way(tags: &Tags) -> bool {
    NETWORK_KEYS.iter().any(|key| tags.contains_key(key))
}

/// Raw elements read from an extract, before they are filtered into a graph
pub struct OsmCollector<F> {
    keep_way: F,
    nodes: HashMap<NodeId, Node>,
    ways: Vec<Way>,
    relations: Vec<Relation>,
}

impl<F: Fn(&Tags) -> bool> OsmCollector<F> {
    pub fn new(keep_way: F) -> Self {
        Self {
            keep_way,
            nodes: HashMap::new(),
            ways: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Records a node; plain and dense nodes both end up here
    pub fn add_node(&mut self, id: NodeId, lon: f64, lat: f64, tags: Tags) {
        self.nodes
            .insert(id, Node::new(id, Point::new(lon, lat)).with_tags(tags));
    }

    /// Records a way if the filter accepts its tags
    pub fn add_way(&mut self, id: WayId, refs: Vec<NodeId>, tags: Tags) {
        if (self.keep_way)(&tags) {
            self.ways.push(Way::new(id, refs).with_tags(tags));
        }
    }

    pub fn add_relation(&mut self, relation: Relation) {
        self.relations.push(relation);
    }

    fn add_element(&mut self, element: Element<'_>) {
        match element {
            Element::Node(node) => {
                self.add_node(node.id(), node.lon(), node.lat(), node.tags().collect());
            }
            Element::DenseNode(node) => {
                self.add_node(node.id(), node.lon(), node.lat(), node.tags().collect());
            }
            Element::Way(way) => {
                self.add_way(way.id(), way.refs().collect(), way.tags().collect());
            }
            Element::Relation(relation) => {
                let mut imported = Relation::new(relation.id());
                imported.tags = relation.tags().collect();
                for member in relation.members() {
                    let entity = match member.member_type {
                        RelMemberType::Node => EntityRef::Node(member.member_id),
                        RelMemberType::Way => EntityRef::Way(member.member_id),
                        RelMemberType::Relation => EntityRef::Relation(member.member_id),
                    };
                    imported.add_member(entity, member.role().unwrap_or_default());
                }
                self.add_relation(imported);
            }
        }
    }

    /// Builds the graph. Nodes are kept when a kept way references them or
    /// when they carry tags. Ways with fewer than two nodes or with node refs
    /// missing from the extract are skipped, as are relation members that did
    /// not survive filtering. Relations left without members are dropped.
    pub fn into_graph(self) -> Result<EntityGraph> {
        let Self {
            mut nodes,
            ways,
            relations,
            ..
        } = self;

        let mut graph = EntityGraph::new();
        let referenced: HashSet<NodeId> = ways
            .iter()
            .flat_map(|way| way.nodes().iter().copied())
            .collect();
        let mut node_ids: Vec<NodeId> = nodes
            .iter()
            .filter(|(id, node)| referenced.contains(id) || !node.tags.is_empty())
            .map(|(&id, _)| id)
            .collect();
        node_ids.sort_unstable();
        for id in node_ids {
            if let Some(node) = nodes.remove(&id) {
                graph.add_node(node)?;
            }
        }

        let mut skipped_ways = 0;
        for way in ways {
            if way.nodes().len() < 2 {
                skipped_ways += 1;
                continue;
            }
            let way_id = way.id;
            if let Err(e) = graph.add_way(way) {
                warn!("Skipping way {}: {}", way_id, e);
                skipped_ways += 1;
            }
        }

        let mut dropped_members = 0;
        for mut relation in relations {
            let before = relation.members.len();
            relation.members.retain(|member| match member.entity {
                EntityRef::Node(id) => graph.node(id).is_some(),
                EntityRef::Way(id) => graph.way(id).is_some(),
                // Relations may reference ones later in the file
                EntityRef::Relation(_) => true,
            });
            dropped_members += before - relation.members.len();
            if relation.members.is_empty() {
                continue;
            }
            graph.add_relation(relation)?;
        }

        if skipped_ways > 0 || dropped_members > 0 {
            debug!(
                "{} ways skipped, {} relation members dropped",
                skipped_ways, dropped_members
            );
        }
        Ok(graph)
    }
}

/// Loads an OSM PBF extract into an [`EntityGraph`], keeping the ways whose
/// tags `keep_way` accepts. See [`OsmCollector::into_graph`] for what else
/// survives.
pub fn import_pbf(path: impl AsRef<Path>, keep_way: impl Fn(&Tags) -> bool) -> Result<EntityGraph> {
    let path = path.as_ref();
    let start_time = Instant::now();
    info!("Importing OSM data from {:?}", path);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {spinner} {pos} elements - {msg}")?,
    );
    pb.set_message("Reading elements");

    let mut collector = OsmCollector::new(keep_way);
    let reader = ElementReader::from_path(path)
        .with_context(|| format!("Failed to open OSM extract {:?}", path))?;
    reader
        .for_each(|element| {
            pb.inc(1);
            collector.add_element(element);
        })
        .with_context(|| format!("Failed to read OSM extract {:?}", path))?;

    pb.set_message("Building graph");
    let graph = collector.into_graph()?;
    pb.finish_with_message("Import finished");

    info!(
        "Imported {} nodes, {} ways, {} relations in {:.2?}",
        graph.node_count(),
        graph.way_count(),
        graph.relations().count(),
        start_time.elapsed()
    );
    Ok(graph)
}
