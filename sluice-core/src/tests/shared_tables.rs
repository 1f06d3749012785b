//! Share-by-label coalescing and post-compile demotion, end to end
//! through the `count` module.

use super::modules::{node, pipeline, registry_with, thread_block, var, Collect};
use crate::runtime::{Runtime, RuntimeOptions};
use std::sync::Arc;

#[test]
fn two_nodes_coalesce_on_one_shared_table() {
    let (values, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    let ast = vec![
        thread_block(
            0,
            vec![pipeline(
                vec![],
                vec![node(&["seq", "-n", "50"]), node(&["count", "-J", "tallies"])],
                vec![var("c")],
            )],
        ),
        thread_block(
            1,
            vec![pipeline(
                vec![],
                vec![node(&["seq", "-n", "50"]), node(&["count", "-J", "tallies"])],
                vec![var("c")],
            )],
        ),
        thread_block(
            0,
            vec![pipeline(vec![var("c")], vec![node(&["collect_sink"])], vec![])],
        ),
    ];

    let graph = runtime.compile(&ast).unwrap();
    // Sharing survived verification: one descriptor, two users, sync
    // primitives still engaged.
    let shares = runtime.env.tables.shared_info();
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].label, "tallies");
    assert_eq!(shares[0].refs, 2);
    assert!(shares[0].thread_safe);

    runtime.run(graph).unwrap();

    // Both kids fed one table: every key 0..49 was counted twice, and
    // the exit flush emitted each key exactly once.
    let counts = values.lock().clone();
    assert_eq!(counts.len(), 50);
    assert!(counts.iter().all(|c| *c == 2));
}

#[test]
fn share_of_one_is_demoted_to_local() {
    let (_, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    let ast = vec![pipeline(
        vec![],
        vec![
            node(&["seq", "-n", "10"]),
            node(&["count", "-J", "solo"]),
            node(&["collect_sink"]),
        ],
        vec![],
    )];
    runtime.compile(&ast).unwrap();

    // verify_sharing ran between init phases: the share label is gone
    // and the table's synchronization has been released.
    assert_eq!(runtime.env.tables.shared_count(), 0);
    assert_eq!(runtime.env.tables.local_count(), 1);
}

#[test]
fn unshared_counts_stay_local() {
    let (values, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    let ast = vec![pipeline(
        vec![],
        vec![node(&["seq", "-n", "20"]), node(&["count"])],
        vec![var("c")],
    ), pipeline(vec![var("c")], vec![node(&["collect_sink"])], vec![])];
    runtime.execute(&ast).unwrap();

    assert_eq!(runtime.env.tables.shared_count(), 0);
    assert_eq!(runtime.env.tables.local_count(), 1);
    let counts = values.lock().clone();
    assert_eq!(counts.len(), 20);
    assert!(counts.iter().all(|c| *c == 1));
}
