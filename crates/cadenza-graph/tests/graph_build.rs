mod common;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use cadenza_graph::{
    ConnectionSet, GraphBuilder, GraphConfig, GraphError, NodeKey, PortConnection, PortDirection,
    PortId, PortKind, RebuildTicket,
};
use common::{trace, Gain, Source};
use proptest::prelude::*;

fn out(node: u64) -> PortId {
    PortId::new(NodeKey(node), 1)
}

fn input(node: u64) -> PortId {
    PortId::new(NodeKey(node), 0)
}

fn gain_lookup(port: PortId) -> Option<(PortKind, PortDirection)> {
    match port.index {
        0 => Some((PortKind::Audio, PortDirection::Input)),
        1 => Some((PortKind::Audio, PortDirection::Output)),
        _ => None,
    }
}

#[test]
fn order_respects_dependencies() {
    let trace = trace();
    let mut builder = GraphBuilder::new();
    for (key, name) in [(3, "c"), (1, "a"), (2, "b")] {
        builder
            .add_node(NodeKey(key), Box::new(Gain::new(name, 1.0, &trace)))
            .unwrap();
    }
    builder.connect(PortConnection::new(out(1), input(2))).unwrap();
    builder.connect(PortConnection::new(out(2), input(3))).unwrap();
    builder.set_terminal(NodeKey(3));
    let graph = builder
        .build(GraphConfig::new(48_000, 64), &RebuildTicket::detached())
        .unwrap();
    assert_eq!(
        graph.execution_order(),
        vec![NodeKey(1), NodeKey(2), NodeKey(3)]
    );
}

#[test]
fn residual_cycle_is_rejected_at_build() {
    let trace = trace();
    let mut builder = GraphBuilder::new();
    builder
        .add_node(NodeKey(1), Box::new(Gain::new("a", 1.0, &trace)))
        .unwrap();
    builder
        .add_node(NodeKey(2), Box::new(Gain::new("b", 1.0, &trace)))
        .unwrap();
    builder.connect(PortConnection::new(out(1), input(2))).unwrap();
    builder.connect(PortConnection::new(out(2), input(1))).unwrap();
    builder.set_terminal(NodeKey(2));
    let result = builder.build(GraphConfig::default(), &RebuildTicket::detached());
    assert!(matches!(result, Err(GraphError::Cycle(2))));
}

#[test]
fn missing_terminal_is_an_error() {
    let trace = trace();
    let mut builder = GraphBuilder::new();
    builder
        .add_node(
            NodeKey(1),
            Box::new(Source {
                name: "s",
                value: 1.0,
                trace,
            }),
        )
        .unwrap();
    assert!(matches!(
        builder.build(GraphConfig::default(), &RebuildTicket::detached()),
        Err(GraphError::NoTerminal)
    ));
}

#[test]
fn superseded_rebuild_is_abandoned() {
    let latest = Arc::new(AtomicU64::new(0));
    let stale = RebuildTicket::issue(&latest);
    let fresh = RebuildTicket::issue(&latest);
    assert!(stale.is_superseded());
    assert!(!fresh.is_superseded());

    let trace = trace();
    let mut builder = GraphBuilder::new();
    builder
        .add_node(NodeKey(1), Box::new(Gain::new("a", 1.0, &trace)))
        .unwrap();
    builder.set_terminal(NodeKey(1));
    assert!(matches!(
        builder.build(GraphConfig::default(), &stale),
        Err(GraphError::Superseded)
    ));
}

#[test]
fn duplicate_node_keys_are_rejected() {
    let trace = trace();
    let mut builder = GraphBuilder::new();
    builder
        .add_node(NodeKey(7), Box::new(Gain::new("a", 1.0, &trace)))
        .unwrap();
    assert_eq!(
        builder.add_node(NodeKey(7), Box::new(Gain::new("b", 1.0, &trace))),
        Err(GraphError::DuplicateNode(NodeKey(7)))
    );
}

proptest! {
    #[test]
    fn accepted_connections_always_compile(edges in proptest::collection::vec((0u64..8, 0u64..8), 0..40)) {
        let mut set = ConnectionSet::new();
        for (from, to) in edges {
            let _ = set.connect(&gain_lookup, PortConnection::new(out(from), input(to)));
        }

        let trace = trace();
        let mut builder = GraphBuilder::new();
        for key in 0..8 {
            builder.add_node(NodeKey(key), Box::new(Gain::new("n", 1.0, &trace))).unwrap();
        }
        prop_assert_eq!(builder.connect_all(&set), 0);
        builder.set_terminal(NodeKey(0));
        let graph = builder.build(GraphConfig::new(48_000, 16), &RebuildTicket::detached());
        prop_assert!(graph.is_ok());
        let order = graph.unwrap().execution_order();
        let rank = |key: NodeKey| order.iter().position(|k| *k == key).unwrap();
        for connection in set.iter() {
            prop_assert!(rank(connection.source.node) < rank(connection.dest.node));
        }
    }
}
