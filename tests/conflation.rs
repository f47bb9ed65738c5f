use geo_types::Point;
use way_conflation::{
    ConflationError, EntityGraph, LineComparison, MatchingOptions, Node, NodeId, NodeInsertion,
    PathTree, ProcessOutcome, Tags, TravelDirection, Way, WayId,
};

const EPSILON: f64 = 1e-6;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options() -> MatchingOptions {
    MatchingOptions {
        max_segment_length: 200.0,
        ..MatchingOptions::default()
    }
}

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs.iter().copied().collect()
}

/// Reference way 100 (nodes 101-103) and candidate way 1 (nodes 1-3) over
/// the same three diagonal coordinates
fn collinear_graph(candidate_tags: Tags, reversed: bool) -> EntityGraph {
    let coords = [(34.000, -118.000), (34.001, -118.001), (34.002, -118.002)];
    let mut graph = EntityGraph::new();
    for (i, (lat, lon)) in coords.iter().enumerate() {
        let i = i as i64;
        graph.add_node(Node::new(101 + i, Point::new(*lon, *lat))).unwrap();
        graph.add_node(Node::new(1 + i, Point::new(*lon, *lat))).unwrap();
    }
    graph.add_way(Way::new(100, vec![101, 102, 103])).unwrap();
    let mut candidate_nodes = vec![1, 2, 3];
    if reversed {
        candidate_nodes.reverse();
    }
    graph
        .add_way(Way::new(1, candidate_nodes).with_tags(candidate_tags))
        .unwrap();
    graph
}

/// Reference way 100 runs north then east. Candidate way 1 covers the north
/// leg and candidate way 2 the east leg; they share node 2.
fn corner_graph(second_leg_tags: Tags) -> EntityGraph {
    let coords = [(34.000, -118.000), (34.001, -118.000), (34.001, -117.999)];
    let mut graph = EntityGraph::new();
    for (i, (lat, lon)) in coords.iter().enumerate() {
        let i = i as i64;
        graph.add_node(Node::new(101 + i, Point::new(*lon, *lat))).unwrap();
        graph.add_node(Node::new(1 + i, Point::new(*lon, *lat))).unwrap();
    }
    graph.add_way(Way::new(100, vec![101, 102, 103])).unwrap();
    graph.add_way(Way::new(1, vec![1, 2])).unwrap();
    graph
        .add_way(Way::new(2, vec![2, 3]).with_tags(second_leg_tags))
        .unwrap();
    graph
}

/// Graph holding the reference way 100 over `reference` and one candidate
/// way per entry of `ways`. Candidate node ids index into `points`; the
/// reference gets its own nodes from 1001 on.
fn network(points: &[(f64, f64)], reference: &[usize], ways: &[(WayId, &[NodeId])]) -> EntityGraph {
    let mut graph = EntityGraph::new();
    for (i, (lat, lon)) in points.iter().enumerate() {
        graph.add_node(Node::new(i as i64, Point::new(*lon, *lat))).unwrap();
    }
    let mut reference_nodes = Vec::new();
    for (i, &point) in reference.iter().enumerate() {
        let (lat, lon) = points[point];
        let id = 1001 + i as i64;
        graph.add_node(Node::new(id, Point::new(lon, lat))).unwrap();
        reference_nodes.push(id);
    }
    graph.add_way(Way::new(100, reference_nodes)).unwrap();
    for (way_id, nodes) in ways {
        graph.add_way(Way::new(*way_id, nodes.to_vec())).unwrap();
    }
    graph
}

#[test]
fn test_identical_way_is_matched_and_forms_one_path() {
    init_logger();
    let graph = collinear_graph(Tags::new(), false);

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    assert_eq!(comparison.main().len(), 2);
    for segment in comparison.main().segments() {
        assert!((segment.length() - 144.6).abs() < 0.5, "length {}", segment.length());
    }

    comparison.run(&graph, [1]).unwrap();

    let line_match = comparison.line_match(1).unwrap();
    assert_eq!(line_match.matches().len(), 2);
    for segment_match in line_match.consolidated_matches() {
        assert_eq!(segment_match.main.index, segment_match.candidate.index);
        assert!(segment_match.orthogonal_distance.abs() < EPSILON);
        assert!((segment_match.dot_product - 1.0).abs() < EPSILON);
    }
    assert_eq!(line_match.matching_segment_count(), 2);

    let matched = comparison.matched_ways();
    let tree = PathTree::build(&graph, &matched, 1, None).unwrap();
    let paths = tree.find_paths();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].len(), 1);
    assert_eq!(paths[0].way_ids(), vec![1]);
    assert_eq!(paths[0].segments[0].direction, TravelDirection::Forward);
    assert!((paths[0].score - line_match.score()).abs() < EPSILON);

    let best = tree.best_path().unwrap();
    assert_eq!(best.way_ids(), vec![1]);
}

#[test]
fn test_ethereal_way_is_never_a_candidate() {
    init_logger();
    let graph = collinear_graph(tags(&[("highway", "proposed")]), false);

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1]).unwrap();

    for index in 0..comparison.main().len() {
        assert!(comparison.candidate_ways_for_segment(index).unwrap().is_empty());
    }
    let count = comparison
        .line_match(1)
        .map_or(0, |line_match| line_match.matching_segment_count());
    assert_eq!(count, 0);

    let matched = comparison.matched_ways();
    assert!(matched.is_empty());
    assert_eq!(
        PathTree::build(&graph, &matched, 1, None).unwrap_err(),
        ConflationError::StartWayNotMatched(1)
    );
}

#[test]
fn test_reversed_way_is_travelled_backwards() {
    init_logger();
    let graph = collinear_graph(Tags::new(), true);

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1]).unwrap();

    let line_match = comparison.line_match(1).unwrap();
    assert_eq!(line_match.matching_segment_count(), 2);
    assert!((line_match.average_dot_product() + 1.0).abs() < EPSILON);
    assert!((line_match.score() - 2.0).abs() < EPSILON);

    let matched = comparison.matched_ways();
    let tree = PathTree::build(&graph, &matched, 1, None).unwrap();
    assert_eq!(tree.root().direction, TravelDirection::Reverse);
    assert_eq!(tree.find_paths().len(), 1);
}

#[test]
fn test_blocked_start_way_still_forms_one_path() {
    init_logger();
    let graph = collinear_graph(tags(&[("oneway", "yes")]), true);

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1]).unwrap();
    assert_eq!(comparison.line_match(1).unwrap().matching_segment_count(), 2);

    let matched = comparison.matched_ways();
    let tree = PathTree::build(&graph, &matched, 1, None).unwrap();
    assert_eq!(tree.root().outcome, ProcessOutcome::Blocked);
    assert!(tree.root().children.is_empty());

    let paths = tree.find_paths();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].way_ids(), vec![1]);
    assert_eq!(tree.best_path().unwrap().way_ids(), vec![1]);
}

#[test]
fn test_reverse_oneway_blocks_the_continuation() {
    init_logger();
    let graph = corner_graph(tags(&[("oneway", "-1")]));

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1, 2]).unwrap();

    let matched = comparison.matched_ways();
    assert_eq!(matched.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

    let tree = PathTree::build(&graph, &matched, 1, None).unwrap();
    assert_eq!(tree.len(), 1);
    assert!(tree.root().children.is_empty());

    let paths = tree.find_paths();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].way_ids(), vec![1]);
}

#[test]
fn test_forward_oneway_continues_through_shared_node() {
    init_logger();
    let graph = corner_graph(tags(&[("oneway", "yes")]));

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1, 2]).unwrap();

    let matched = comparison.matched_ways();
    let tree = PathTree::for_stops(&graph, &matched, &[1]).unwrap();
    assert_eq!(tree.root().way_id, 1);
    assert_eq!(tree.root().entry_node, Some(1));

    // The continuation ends at node 3 yet stays in the tree as the path's end
    let continuation = tree.segment(tree.root().children[0]).unwrap();
    assert_eq!(continuation.way_id, 2);
    assert_eq!(continuation.outcome, ProcessOutcome::DeadEnd);

    let best = tree.best_path().unwrap();
    assert_eq!(best.way_ids(), vec![1, 2]);
    assert_eq!(best.segments[1].entry_node, Some(2));
    assert!((best.score - 2.0).abs() < EPSILON);
}

#[test]
fn test_stop_lookup_errors() {
    init_logger();
    let graph = corner_graph(Tags::new());

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1, 2]).unwrap();
    let matched = comparison.matched_ways();

    assert_eq!(
        PathTree::for_stops(&graph, &matched, &[]).unwrap_err(),
        ConflationError::EmptyStops
    );
    // Only the reference way contains node 101
    assert_eq!(
        PathTree::for_stops(&graph, &matched, &[101]).unwrap_err(),
        ConflationError::NoStartWay(101)
    );
}

#[test]
fn test_splitting_a_candidate_keeps_reference_matches_aligned() {
    init_logger();
    let mut graph = collinear_graph(Tags::new(), false);

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1]).unwrap();

    graph
        .add_node(Node::new(50, Point::new(-118.0005, 34.0005)))
        .unwrap();
    let insertion = comparison.insert_node(&mut graph, 1, 50, 0, 0.0).unwrap();
    assert_eq!(
        insertion,
        NodeInsertion::Inserted {
            node_id: 50,
            split_index: 0
        }
    );

    assert_eq!(graph.way(1).unwrap().nodes(), &[1, 50, 2, 3]);
    assert_eq!(comparison.candidates()[&1].len(), 3);

    let main_matches = comparison.main().segment(1).unwrap().matches();
    assert_eq!(main_matches.len(), 1);
    assert_eq!(main_matches[0].candidate.index, 2);

    let consolidated = comparison.line_match(1).unwrap().consolidated_matches();
    assert_eq!(consolidated[1].candidate.index, 2);
}

#[test]
fn test_options_from_json_file() {
    let path = std::env::temp_dir().join(format!("matching_options_{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "max_segment_length": 50.0 }"#).unwrap();
    let options = MatchingOptions::from_json_file(&path).unwrap();
    assert_eq!(options.max_segment_length, 50.0);
    assert_eq!(
        options.max_segment_angle,
        MatchingOptions::default().max_segment_angle
    );

    std::fs::write(&path, r#"{ "max_segment_angle": 120.0 }"#).unwrap();
    assert!(MatchingOptions::from_json_file(&path).is_err());
    std::fs::remove_file(&path).unwrap();
}

/// Reference runs north over two legs. Way 1 covers the first leg; ways 2
/// and 3 both leave node 1 along the second leg.
fn fork_points() -> Vec<(f64, f64)> {
    vec![
        (34.000, -118.000),
        (34.001, -118.000),
        (34.002, -118.000),
        // Slightly east of node 2, so a way ending here is a few degrees off
        (34.002, -117.99997),
        // Same position as node 2
        (34.002, -118.000),
    ]
}

#[test]
fn test_best_path_prefers_higher_score_over_discovery_order() {
    init_logger();
    let graph = network(&fork_points(), &[0, 1, 2], &[(1, &[0, 1]), (2, &[1, 3]), (3, &[1, 2])]);

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1, 2, 3]).unwrap();
    let matched = comparison.matched_ways();
    assert_eq!(matched.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

    let skewed = comparison.line_match(2).unwrap().score();
    let aligned = comparison.line_match(3).unwrap().score();
    assert!(skewed < aligned);

    let tree = PathTree::build(&graph, &matched, 1, None).unwrap();
    let paths = tree.find_paths();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0].way_ids(), vec![1, 2]);
    assert_eq!(paths[1].way_ids(), vec![1, 3]);

    let best = tree.best_path().unwrap();
    assert_eq!(best.way_ids(), vec![1, 3]);
    assert!((best.score - paths[1].score).abs() < EPSILON);
}

#[test]
fn test_equal_scores_keep_first_discovered_path() {
    init_logger();
    let graph = network(&fork_points(), &[0, 1, 2], &[(1, &[0, 1]), (2, &[1, 2]), (3, &[1, 4])]);

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1, 2, 3]).unwrap();
    let matched = comparison.matched_ways();

    let tree = PathTree::build(&graph, &matched, 1, None).unwrap();
    let paths = tree.find_paths();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0].score, paths[1].score);

    assert_eq!(tree.best_path().unwrap().way_ids(), vec![1, 2]);
}

#[test]
fn test_loop_back_to_start_way_is_cut() {
    init_logger();
    // Triangle: north, east, then back south-west to the start
    let points = [(34.000, -118.000), (34.001, -118.000), (34.001, -117.999)];
    let graph = network(
        &points,
        &[0, 1, 2, 0],
        &[(1, &[0, 1]), (2, &[1, 2]), (3, &[2, 0])],
    );

    let mut comparison = LineComparison::new(&graph, 100, options()).unwrap();
    comparison.run(&graph, [1, 2, 3]).unwrap();
    let matched = comparison.matched_ways();
    for way_id in [1, 2, 3] {
        let line_match = comparison.line_match(way_id).unwrap();
        assert_eq!(line_match.matching_segment_count(), 1, "way {}", way_id);
    }

    let tree = PathTree::build(&graph, &matched, 1, None).unwrap();
    // Way 3 reaches node 0 where way 1 starts, but way 1 is already on the path
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.max_depth(), 2);
    let last = tree.segment(2).unwrap();
    assert_eq!(last.way_id, 3);
    assert_eq!(last.outcome, ProcessOutcome::Continued);
    assert!(last.children.is_empty());

    let paths = tree.find_paths();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].way_ids(), vec![1, 2, 3]);
    assert!((paths[0].score - 3.0).abs() < EPSILON);
}
