use anyhow::{Context, Result, anyhow};
use log::info;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;

use crate::graph::EntityGraph;

// Node back-references are not serialized; they are rebuilt from way
// membership after decoding.

pub fn encode_graph(graph: &EntityGraph) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::serde::encode_to_vec(graph, config)
        .map_err(|e| anyhow!("Failed to encode graph: {}", e))
}

pub fn decode_graph(bytes: &[u8]) -> Result<EntityGraph> {
    let config = bincode::config::standard();
    let (mut graph, _): (EntityGraph, _) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| anyhow!("Invalid graph data: {}", e))?;
    graph.recompute_back_references();
    Ok(graph)
}

/// Writes the graph to `path` in the binary cache format
pub fn save_graph(graph: &EntityGraph, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let start_time = Instant::now();

    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    let config = bincode::config::standard();
    let written = bincode::serde::encode_into_std_write(graph, &mut writer, config)
        .map_err(|e| anyhow!("Failed to write graph to {:?}: {}", path, e))?;
    writer.flush()?;

    info!(
        "Saved graph with {} nodes and {} ways to {:?} ({} bytes) in {:.2?}",
        graph.node_count(),
        graph.way_count(),
        path,
        written,
        start_time.elapsed()
    );
    Ok(())
}

pub fn load_graph(path: impl AsRef<Path>) -> Result<EntityGraph> {
    let path = path.as_ref();
    let start_time = Instant::now();

    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut bytes = Vec::new();
    BufReader::new(file)
        .read_to_end(&mut bytes)
        .with_context(|| format!("Failed to read {:?}", path))?;
    let graph = decode_graph(&bytes).with_context(|| format!("Failed to load {:?}", path))?;

    info!(
        "Loaded graph with {} nodes and {} ways from {:?} in {:.2?}",
        graph.node_count(),
        graph.way_count(),
        path,
        start_time.elapsed()
    );
    Ok(graph)
}
