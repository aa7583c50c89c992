//! Canonical XML round-trip over whole trees.

use std::io::Write;

use veld::graph::ModelGraph;
use veld::xml::{from_xml, to_xml};

/// A tree exercising every node kind, port direction and coupling kind.
fn full_tree() -> ModelGraph {
    let mut g = ModelGraph::new("root");
    let stage = g.add_coupled(g.root(), "stage").unwrap();
    let source = g.add_atomic(stage, "source").unwrap();
    let filter = g.add_atomic(stage, "filter").unwrap();
    let drain = g.add_atomic(g.root(), "drain").unwrap();
    let foreign = g.add_opaque(g.root(), "foreign").unwrap();

    g.add_output_port(source, "out").unwrap();
    g.add_input_port(filter, "in").unwrap();
    g.add_output_port(filter, "out").unwrap();
    g.add_input_port(stage, "feed").unwrap();
    g.add_output_port(stage, "out").unwrap();
    g.add_input_port(drain, "in").unwrap();
    g.add_input_port(foreign, "in").unwrap();

    g.add_internal_connection(stage, source, "out", filter, "in")
        .unwrap();
    g.add_input_connection(stage, "feed", filter, "in").unwrap();
    g.add_output_connection(stage, filter, "out", "out").unwrap();
    let root = g.root();
    g.add_internal_connection(root, stage, "out", drain, "in")
        .unwrap();
    g.add_internal_connection(root, stage, "out", foreign, "in")
        .unwrap();
    g
}

#[test]
fn write_parse_write_is_byte_identical() {
    let first = to_xml(&full_tree());
    let reparsed = from_xml(&first).unwrap();
    let second = to_xml(&reparsed);
    assert_eq!(first, second);

    // And once more, for good measure.
    let third = to_xml(&from_xml(&second).unwrap());
    assert_eq!(second, third);
}

#[test]
fn roundtrip_preserves_names_ports_and_connections() {
    let g = from_xml(&to_xml(&full_tree())).unwrap();
    assert_eq!(g.audit(), None);

    let stage = g.find_path("root.stage").unwrap();
    let source = g.find_path("root.stage.source").unwrap();
    let filter = g.find_path("root.stage.filter").unwrap();
    let drain = g.find_path("root.drain").unwrap();

    assert!(g.is_coupled(stage));
    assert!(g.is_atomic(source));
    assert!(g.is_opaque(g.find_path("root.foreign").unwrap()));

    assert!(g.exist_internal_connection(source, "out", filter, "in"));
    assert!(g.exist_input_connection(stage, "feed", filter, "in"));
    assert!(g.exist_output_connection(stage, filter, "out", "out"));
    assert!(g.exist_internal_connection(stage, "out", drain, "in"));

    // Port declaration order survives.
    let names: Vec<&str> = g.input_ports(filter).iter().map(|p| p.name()).collect();
    assert_eq!(names, vec!["in"]);
}

#[test]
fn roundtrip_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.xml");

    let original = to_xml(&full_tree());
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(original.as_bytes()).unwrap();
    drop(file);

    let loaded = std::fs::read_to_string(&path).unwrap();
    let parsed = from_xml(&loaded).unwrap();
    assert_eq!(to_xml(&parsed), original);
}

#[test]
fn empty_root_serializes_and_returns() {
    let g = ModelGraph::new("solo");
    let text = to_xml(&g);
    let parsed = from_xml(&text).unwrap();
    assert_eq!(parsed.name(parsed.root()), Some("solo"));
    assert_eq!(to_xml(&parsed), text);
}
