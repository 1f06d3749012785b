//! The ordered flush protocol: buffered state drains in dependency
//! order, re-encountered nodes flush after their feeders, and bundles
//! survive the collapse.

use super::modules::{node, pipeline, registry_with, var, BufferedPass, Collect};
use crate::runtime::{Runtime, RuntimeOptions};
use std::sync::Arc;

#[test]
fn flush_replays_buffered_chain() {
    let (values, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(BufferedPass), Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    // Both stages hold everything until flush; delivery happens
    // entirely through the flush walk, upstream first.
    let ast = vec![pipeline(
        vec![],
        vec![
            node(&["seq", "-n", "10"]),
            node(&["buffered_pass"]),
            node(&["buffered_pass"]),
            node(&["collect_sink"]),
        ],
        vec![],
    )];
    runtime.execute(&ast).unwrap();

    assert_eq!(values.lock().clone(), (0..10).collect::<Vec<u64>>());
}

#[test]
fn reencountered_node_flushes_after_its_feeders() {
    let (values, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(BufferedPass), Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    // a feeds d directly and through b; BFS discovers d before b, so
    // the flush order must move d behind b.
    let ast = vec![
        pipeline(
            vec![],
            vec![node(&["seq", "-n", "5"]), node(&["buffered_pass"])],
            vec![var("vd"), var("vb")],
        ),
        pipeline(vec![var("vb")], vec![node(&["buffered_pass"])], vec![var("vd")]),
        pipeline(vec![var("vd")], vec![node(&["buffered_pass"])], vec![var("out")]),
        pipeline(vec![var("out")], vec![node(&["collect_sink"])], vec![]),
    ];
    let graph = runtime.compile(&ast).unwrap();

    // The flush order over the buffered nodes is a, b, d.
    let order: Vec<String> = graph
        .flush_order
        .iter()
        .map(|sid| {
            let n = graph.subs[sid.index()].node;
            graph.nodes[n.index()].handle.to_string()
        })
        .collect();
    assert_eq!(
        order,
        vec!["buffered_pass.0", "buffered_pass.1", "buffered_pass.2"]
    );

    runtime.run(graph).unwrap();

    // d saw every record twice: once direct, once through b.
    let mut seen = values.lock().clone();
    seen.sort_unstable();
    let expected: Vec<u64> = (0..5).flat_map(|v| [v, v]).collect();
    assert_eq!(seen, expected);
}

#[test]
fn bundle_state_survives_exit_flush() {
    let (values, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    // Ten records never fill a sixteen-slot bundle; only the exit
    // flush pushes the partial carrier out.
    let ast = vec![pipeline(
        vec![],
        vec![
            node(&["seq", "-n", "10"]),
            node(&["bundle", "-n", "16"]),
            node(&["unbundle"]),
            node(&["collect_sink"]),
        ],
        vec![],
    )];
    runtime.execute(&ast).unwrap();

    assert_eq!(values.lock().clone(), (0..10).collect::<Vec<u64>>());
}

#[test]
fn skipping_exit_flush_drops_buffered_state() {
    let (values, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(BufferedPass), Arc::new(collect)]);
    let opts = RuntimeOptions {
        no_exit_flush: true,
        ..RuntimeOptions::default()
    };
    let mut runtime = Runtime::new(registry, opts);
    let ast = vec![pipeline(
        vec![],
        vec![
            node(&["seq", "-n", "10"]),
            node(&["buffered_pass"]),
            node(&["collect_sink"]),
        ],
        vec![],
    )];
    runtime.execute(&ast).unwrap();

    assert!(values.lock().is_empty());
}
