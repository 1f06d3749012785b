//! Source-label gating: an edge with a filter label delivers only
//! records bearing that label.

use super::modules::{node, pipeline, registry_with, var, var_filtered, Collect, EvenOdd};
use crate::runtime::{Runtime, RuntimeOptions};
use std::sync::Arc;

#[test]
fn filter_label_gates_delivery() {
    let (values, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(EvenOdd), Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    let ast = vec![
        pipeline(
            vec![],
            vec![node(&["seq", "-n", "10"]), node(&["even_odd"])],
            vec![var("tagged")],
        ),
        pipeline(
            vec![var_filtered("tagged", "EVEN")],
            vec![node(&["collect_sink"])],
            vec![],
        ),
    ];
    runtime.execute(&ast).unwrap();

    assert_eq!(values.lock().clone(), vec![0, 2, 4, 6, 8]);
}

#[test]
fn unfiltered_consumer_sees_everything() {
    let (evens, _, even_sink) = Collect::new();
    let registry = registry_with(vec![Arc::new(EvenOdd), Arc::new(even_sink)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    let ast = vec![
        pipeline(
            vec![],
            vec![node(&["seq", "-n", "6"]), node(&["even_odd"])],
            vec![var("tagged")],
        ),
        pipeline(vec![var("tagged")], vec![node(&["collect_sink"])], vec![]),
    ];
    runtime.execute(&ast).unwrap();

    assert_eq!(evens.lock().clone(), vec![0, 1, 2, 3, 4, 5]);
}
