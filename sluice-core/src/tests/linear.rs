//! Single-source linear pipeline: delivery, ordering, and drain
//! accounting on one thread.

use super::modules::{node, pipeline, registry_with, Collect, Passthrough};
use crate::runtime::{Runtime, RuntimeOptions};
use std::sync::Arc;

#[test]
fn linear_pipeline_delivers_in_order() {
    let (values, observers, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(Passthrough), Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    let ast = vec![pipeline(
        vec![],
        vec![
            node(&["seq", "-n", "1000"]),
            node(&["passthrough"]),
            node(&["collect_sink"]),
        ],
        vec![],
    )];
    let report = runtime.execute(&ast).unwrap();

    assert_eq!(report.work_size, 1);
    assert_eq!(report.detected_cycles, 0);
    assert_eq!(report.recovery_entries, 0);
    let collected = values.lock().clone();
    assert_eq!(collected, (0..1000).collect::<Vec<u64>>());

    // After the full drain every record reference has been released.
    for observer in observers.lock().iter() {
        assert!(!observer.is_live(), "record survived the drain");
    }
}

#[test]
fn graph_without_thread_directives_uses_one_thread() {
    let (_, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(Passthrough), Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());
    let ast = vec![pipeline(
        vec![],
        vec![node(&["seq", "-n", "5"]), node(&["collect_sink"])],
        vec![],
    )];
    let graph = runtime.compile(&ast).unwrap();
    assert_eq!(graph.work_size, 1);
    assert!(graph.nodes.iter().all(|n| n.thread.0 == 0));
}

#[test]
fn loop_count_rearms_sources() {
    // A looped run re-polls exhausted sources; seq stays exhausted, so
    // delivery is unchanged but the run still completes.
    let (values, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(collect)]);
    let opts = RuntimeOptions {
        loop_count: 3,
        ..RuntimeOptions::default()
    };
    let mut runtime = Runtime::new(registry, opts);
    let ast = vec![pipeline(
        vec![],
        vec![node(&["seq", "-n", "10"]), node(&["collect_sink"])],
        vec![],
    )];
    runtime.execute(&ast).unwrap();
    assert_eq!(values.lock().len(), 10);
}
