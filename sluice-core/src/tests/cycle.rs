//! Cross-thread cycle under a tiny bounded queue: SCC detection,
//! failover allocation, recovery-mode entry, and loss-free delivery.

use super::modules::{node, pipeline, registry_with, thread_block, var, var_filtered, Collect, Hop};
use crate::runtime::{Runtime, RuntimeOptions};
use std::sync::Arc;

fn cycle_ast(records: u64) -> Vec<sluice_types::ast::Stmt> {
    // seq floods hop-a; records ping-pong a -> b -> a until their hop
    // budget runs out, then exit to the sink via the DONE label.
    vec![
        thread_block(
            0,
            vec![
                pipeline(
                    vec![],
                    vec![node(&["seq", "-n", &records.to_string(), "-b"])],
                    vec![var("seed")],
                ),
                pipeline(
                    vec![var("seed"), var_filtered("ba", "LIVE")],
                    vec![node(&["hop"])],
                    vec![var_filtered("ab", "LIVE"), var_filtered("fin", "DONE")],
                ),
                pipeline(vec![var("fin")], vec![node(&["collect_sink"])], vec![]),
            ],
        ),
        thread_block(
            1,
            vec![pipeline(
                vec![var("ab")],
                vec![node(&["hop"])],
                vec![var_filtered("ba", "LIVE"), var_filtered("fin", "DONE")],
            )],
        ),
    ]
}

#[test]
fn compile_detects_thread_cycle() {
    let (_, _, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(Hop { budget: 3 }), Arc::new(collect)]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());
    let graph = runtime.compile(&cycle_ast(10)).unwrap();

    let cycles = graph.cycles.as_ref().expect("SCC detected");
    assert_eq!(cycles.sccs.len(), 1);
    let mut members = cycles.sccs[0].clone();
    members.sort_unstable();
    assert_eq!(members, vec![0, 1]);
    assert!(cycles.thread_in_cycle[0] && cycles.thread_in_cycle[1]);
}

#[test]
fn cycle_recovers_from_deadlock_without_loss() {
    let (values, observers, collect) = Collect::new();
    let registry = registry_with(vec![Arc::new(Hop { budget: 3 }), Arc::new(collect)]);
    let opts = RuntimeOptions {
        // A small queue plus a burst source forces the full-everywhere
        // condition quickly.
        shared_queue_len: 4,
        ..RuntimeOptions::default()
    };
    let mut runtime = Runtime::new(registry, opts);

    const RECORDS: u64 = 10_000;
    let report = runtime.execute(&cycle_ast(RECORDS)).unwrap();

    assert_eq!(report.detected_cycles, 1);
    assert!(
        report.recovery_entries >= 1,
        "deadlock recovery never engaged"
    );

    let mut exited = values.lock().clone();
    exited.sort_unstable();
    assert_eq!(exited.len() as u64, RECORDS, "records were dropped");
    assert_eq!(exited, (0..RECORDS).collect::<Vec<u64>>());
    for observer in observers.lock().iter() {
        assert!(!observer.is_live());
    }
}
