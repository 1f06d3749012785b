//! The buffer adapter end to end: byte buffers in, transformed byte
//! buffers out, pass-through when the module declines.

use super::modules::{node, pipeline, registry_with, BytesCollect, BytesSource};
use crate::runtime::{Runtime, RuntimeOptions};
use std::sync::Arc;

#[test]
fn append_suffixes_every_buffer() {
    let (bufs, sink) = BytesCollect::new();
    let registry = registry_with(vec![
        Arc::new(BytesSource {
            bufs: vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()],
        }),
        Arc::new(sink),
    ]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    let ast = vec![pipeline(
        vec![],
        vec![
            node(&["bytes_source"]),
            node(&["append", "!"]),
            node(&["bytes_sink"]),
        ],
        vec![],
    )];
    runtime.execute(&ast).unwrap();

    assert_eq!(
        bufs.lock().clone(),
        vec![b"alpha!".to_vec(), b"beta!".to_vec(), b"gamma!".to_vec()]
    );
}

#[test]
fn declined_buffers_pass_through() {
    // An empty suffix makes `append` decline every buffer; its
    // pass-not-found flag forwards them untouched.
    let (bufs, sink) = BytesCollect::new();
    let registry = registry_with(vec![
        Arc::new(BytesSource {
            bufs: vec![b"asis".to_vec()],
        }),
        Arc::new(sink),
    ]);
    let mut runtime = Runtime::new(registry, RuntimeOptions::default());

    let ast = vec![pipeline(
        vec![],
        vec![
            node(&["bytes_source"]),
            node(&["append"]),
            node(&["bytes_sink"]),
        ],
        vec![],
    )];
    runtime.execute(&ast).unwrap();

    assert_eq!(bufs.lock().clone(), vec![b"asis".to_vec()]);
}
