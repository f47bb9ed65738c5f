use anyhow::Result;
use geo_types::Point;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::graph::EntityGraph;
use crate::line_comparison::LineComparison;
use crate::path_tree::{Path, TravelDirection};
use crate::segments::WaySegments;

/// GeoJSON renderings of segmentation, matching and path search results
pub struct DebugVisualizer;

impl DebugVisualizer {
    /// One LineString feature per segment of a way
    pub fn generate_segments_geojson(
        segments: &WaySegments,
        properties: Option<HashMap<&str, Value>>,
    ) -> Value {
        let default_props = properties.unwrap_or_else(|| {
            let mut props = HashMap::new();
            props.insert("color", json!("#3388ff"));
            props.insert("weight", json!(4));
            props.insert("opacity", json!(0.8));
            props
        });

        let mut features = Vec::new();
        for segment in segments.segments() {
            let mut segment_props = serde_json::Map::new();
            segment_props.insert("way_id".to_string(), json!(segments.way_id()));
            segment_props.insert("index".to_string(), json!(segment.index()));
            segment_props.insert("node_index".to_string(), json!(segment.node_index()));
            segment_props.insert("length_m".to_string(), json!(segment.length()));
            segment_props.insert("match_count".to_string(), json!(segment.matches().len()));
            if let Some(origin) = segment.origin_node() {
                segment_props.insert("origin_node".to_string(), json!(origin));
            }
            if let Some(destination) = segment.destination_node() {
                segment_props.insert("destination_node".to_string(), json!(destination));
            }
            for (key, value) in &default_props {
                segment_props.insert(key.to_string(), value.clone());
            }

            features.push(json!({
                "type": "Feature",
                "properties": segment_props,
                "geometry": {
                    "type": "LineString",
                    "coordinates": [
                        coordinate(segment.origin()),
                        coordinate(segment.destination())
                    ]
                }
            }));
        }

        json!({
            "type": "FeatureCollection",
            "features": features
        })
    }

    /// A line from each reference segment midpoint to the midpoint of its
    /// consolidated candidate segment
    pub fn generate_matches_geojson(comparison: &LineComparison) -> Value {
        let mut features = Vec::new();

        for (way_id, candidate) in comparison.candidates() {
            for segment_match in candidate.line_match().consolidated_matches() {
                let (Some(main_segment), Some(candidate_segment)) = (
                    comparison.main().segment(segment_match.main.index),
                    candidate.segment(segment_match.candidate.index),
                ) else {
                    continue;
                };

                features.push(json!({
                    "type": "Feature",
                    "properties": {
                        "type": "segment_match",
                        "main_way_id": segment_match.main.way_id,
                        "main_index": segment_match.main.index,
                        "candidate_way_id": way_id,
                        "candidate_index": segment_match.candidate.index,
                        "orthogonal_distance": segment_match.orthogonal_distance,
                        "midpoint_distance": segment_match.midpoint_distance,
                        "dot_product": segment_match.dot_product,
                        "color": if segment_match.dot_product >= 0.0 { "#33aa33" } else { "#aa3333" },
                    },
                    "geometry": {
                        "type": "LineString",
                        "coordinates": [
                            coordinate(main_segment.midpoint()),
                            coordinate(candidate_segment.midpoint())
                        ]
                    }
                }));
            }
        }

        json!({
            "type": "FeatureCollection",
            "features": features
        })
    }

    /// The ways of a path, each drawn in its direction of travel
    pub fn generate_path_geojson(path: &Path, graph: &EntityGraph) -> Result<Value> {
        let mut features = Vec::new();

        for (i, segment) in path.segments.iter().enumerate() {
            let mut points = graph.way_points(segment.way_id)?;
            if segment.direction == TravelDirection::Reverse {
                points.reverse();
            }
            let coords: Vec<Vec<f64>> = points.into_iter().map(coordinate).collect();

            features.push(json!({
                "type": "Feature",
                "properties": {
                    "type": "path_segment",
                    "step": i,
                    "way_id": segment.way_id,
                    "direction": format!("{:?}", segment.direction),
                    "entry_node": segment.entry_node,
                    "score": segment.score,
                    "path_score": path.score,
                    "color": if i % 2 == 1 { "#cc3300" } else { "#ff0000" },
                },
                "geometry": {
                    "type": "LineString",
                    "coordinates": coords
                }
            }));
        }

        Ok(json!({
            "type": "FeatureCollection",
            "features": features
        }))
    }
}

fn coordinate(point: Point<f64>) -> Vec<f64> {
    vec![point.x(), point.y()]
}
