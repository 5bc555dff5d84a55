//! Integration tests for the method bind table
//!
//! Tests cover:
//! - Lazy resolution and caching
//! - Concurrent first resolution converging on one host lookup
//! - Misses being fatal and never cached

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tether_core::{AbiViolation, MethodSpec, Runtime, RuntimeConfig};
use tether_testhost::TestHost;

const GET_POSITION: MethodSpec = MethodSpec::new("Node2D", "get_position", 0x2a);
const SET_POSITION: MethodSpec = MethodSpec::new("Node2D", "set_position", 0x2b);

fn runtime(host: &TestHost) -> Arc<Runtime> {
    Runtime::new(&host.interface(), host.library(), RuntimeConfig::default()).unwrap()
}

#[test]
fn test_resolution_is_lazy_and_cached() {
    let host = TestHost::new();
    host.define_method("Node2D", "get_position", 0x2a, |_| {});
    host.define_method("Node2D", "set_position", 0x2b, |_| {});
    let rt = runtime(&host);

    assert!(rt.binds().is_empty());
    assert_eq!(host.bind_lookups("Node2D", "get_position"), 0);

    let first = rt.binds().resolve_spec(&GET_POSITION);
    let again = rt.binds().resolve_spec(&GET_POSITION);
    assert_eq!(first, again);
    assert_eq!(first.hash(), 0x2a);
    assert_eq!(host.bind_lookups("Node2D", "get_position"), 1);

    let other = rt.binds().resolve_spec(&SET_POSITION);
    assert_ne!(other.raw(), first.raw());
    assert_eq!(rt.binds().len(), 2);
    assert!(rt.binds().contains("Node2D", "set_position"));
    assert!(!rt.binds().contains("Node2D", "rotate"));
    assert_eq!(rt.stats().snapshot().binds_resolved, 2);
}

#[test]
fn test_concurrent_resolution_converges() {
    let host = TestHost::new();
    host.define_method("Node2D", "get_position", 0x2a, |_| {});
    let rt = runtime(&host);

    let entries: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    (0..100)
                        .map(|_| rt.binds().resolve_spec(&GET_POSITION))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(entries.len(), 800);
    assert!(entries.iter().all(|e| *e == entries[0]));
    assert_eq!(host.bind_lookups("Node2D", "get_position"), 1);
    assert_eq!(rt.stats().snapshot().binds_resolved, 1);
    assert_eq!(rt.binds().len(), 1);
}

#[test]
fn test_interned_keys_match_by_identity() {
    let host = TestHost::new();
    host.define_method("Node2D", "get_position", 0x2a, |_| {});
    let rt = runtime(&host);

    let class = rt.names().intern("Node2D");
    let method = rt.names().intern(&format!("get_{}", "position"));
    let by_name = rt.binds().resolve(&class, &method, 0x2a);
    let by_spec = rt.binds().resolve_spec(&GET_POSITION);
    assert_eq!(by_name, by_spec);
    assert_eq!(host.bind_lookups("Node2D", "get_position"), 1);
}

#[test]
fn test_hash_mismatch_is_fatal() {
    let host = TestHost::new();
    host.define_method("Node2D", "get_position", 0x2a, |_| {});
    let rt = runtime(&host);
    let stale = MethodSpec::new("Node2D", "get_position", 0x99);

    let payload = catch_unwind(AssertUnwindSafe(|| rt.binds().resolve_spec(&stale))).unwrap_err();
    assert_eq!(
        payload.downcast_ref::<AbiViolation>(),
        Some(&AbiViolation::MethodBindMissing {
            class: "Node2D".into(),
            method: "get_position".into(),
            hash: 0x99,
        })
    );
    assert!(rt.binds().is_empty());
    assert_eq!(rt.stats().snapshot().binds_resolved, 0);
}

#[test]
fn test_unknown_method_is_fatal() {
    let host = TestHost::new();
    let rt = runtime(&host);
    let missing = MethodSpec::new("Node", "does_not_exist", 1);

    let node = host.construct("Node");
    let payload = catch_unwind(AssertUnwindSafe(|| unsafe {
        rt.call::<(), _>(&missing, &node, &[])
    }))
    .unwrap_err();
    assert!(matches!(
        payload.downcast_ref::<AbiViolation>(),
        Some(AbiViolation::MethodBindMissing { .. })
    ));
    assert_eq!(host.ptrcalls(), 0);
    assert_eq!(rt.stats().snapshot().frames_allocated, 0);
}
