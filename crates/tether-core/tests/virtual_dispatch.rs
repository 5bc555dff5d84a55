//! Integration tests for virtual dispatch into extension classes
//!
//! Tests cover:
//! - An override invoked once by the host, with the host frame released
//! - Fallback to the engine default for methods not overridden
//! - Argument decoding and return encoding, up to wide argument lists
//! - Failures (panics, bad arguments, re-entrancy) returning defaults
//! - Concurrent calls from several host threads
//! - Instance teardown when the engine frees the object
//! - Calls arriving after the runtime is gone

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tether_core::variant::Vector2;
use tether_core::{
    ClassDescriptor, DispatchError, ObjectRef, PackedCodec, Runtime, RuntimeConfig, VirtualTable,
};
use tether_sys::RawPackedArray;
use tether_testhost::{TestHost, VirtualOutcome};

struct Widget {
    base: ObjectRef,
    ready_calls: u32,
    score: i64,
    dropped: Arc<AtomicUsize>,
}

impl Drop for Widget {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

fn runtime(host: &TestHost) -> Arc<Runtime> {
    Runtime::new(&host.interface(), host.library(), RuntimeConfig::default()).unwrap()
}

fn widget_class(rt: &Arc<Runtime>, dropped: Arc<AtomicUsize>) -> ClassDescriptor<Widget> {
    let weak: Weak<Runtime> = Arc::downgrade(rt);
    let table = VirtualTable::<Widget>::new()
        .add0("ready", |w: &mut Widget| w.ready_calls += 1)
        .add("add_points", |w: &mut Widget, (n,): (i64,)| {
            w.score += n;
            w.score
        })
        .add("greet", |_: &mut Widget, (name,): (String,)| format!("hello {name}"))
        .add("sum", |_: &mut Widget, (values,): (Vec<i32>,)| {
            values.iter().map(|v| *v as i64).sum::<i64>()
        })
        .add(
            "configure",
            |_: &mut Widget, (id, visible, scale, label, layer, offset): (i64, bool, f64, String, i32, Vector2)| {
                format!("{id}|{visible}|{scale}|{label}|{layer}|{}|{}", offset.x, offset.y)
            },
        )
        .add0("explode", |_: &mut Widget| -> i64 { panic!("override failed") })
        .add0("reenter", move |w: &mut Widget| {
            let rt = weak.upgrade().expect("runtime alive");
            matches!(
                rt.with_instance::<Widget, _>(w.base.raw, |_| ()),
                Err(DispatchError::Reentrant)
            )
        });

    ClassDescriptor::new("Widget", "Node", move |base| Widget {
        base,
        ready_calls: 0,
        score: 0,
        dropped: Arc::clone(&dropped),
    })
    .virtuals(table)
}

fn setup() -> (TestHost, Arc<Runtime>, Arc<AtomicUsize>) {
    let host = TestHost::new();
    let rt = runtime(&host);
    let dropped = Arc::new(AtomicUsize::new(0));
    rt.register_class(widget_class(&rt, Arc::clone(&dropped))).unwrap();
    (host, rt, dropped)
}

#[test]
fn test_ready_override_runs_once() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();
    assert_eq!(host.class_of(widget).as_deref(), Some("Widget"));
    assert!(host.is_instance_of(widget, "Node"));

    let result = host.call_virtual(widget, "ready").invoke();
    assert_eq!(result.outcome, VirtualOutcome::Overridden);

    let calls = rt.with_instance::<Widget, _>(widget, |w| w.ready_calls).unwrap();
    assert_eq!(calls, 1);
    assert_eq!(host.frames_allocated(), 1);
    assert_eq!(host.frames_freed(), 1);

    let stats = rt.stats().snapshot();
    assert_eq!(stats.virtual_calls, 1);
    assert_eq!(stats.virtual_failures, 0);
    host.destroy(widget);
}

#[test]
fn test_missing_override_uses_engine_default() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();

    assert!(rt.lookup_override("Widget", "ready").is_some());
    assert!(rt.lookup_override("Widget", "process").is_none());
    assert!(rt.lookup_override("Gadget", "ready").is_none());

    let result = host.call_virtual(widget, "process").arg(0.016f64).invoke();
    assert_eq!(result.outcome, VirtualOutcome::Default);
    assert_eq!(rt.stats().snapshot().virtual_calls, 0);
    host.destroy(widget);
}

#[test]
fn test_arguments_and_results() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();

    let first = host.call_virtual(widget, "add_points").arg(5i64).invoke();
    assert_eq!(first.ret::<i64>(), 5);
    let second = host.call_virtual(widget, "add_points").arg(-12i64).invoke();
    assert_eq!(second.ret::<i64>(), -7);

    let greeting = host.call_virtual(widget, "greet").arg_string("Ada").invoke();
    assert_eq!(greeting.ret_string(&host).as_deref(), Some("hello Ada"));

    let packed = i32::pack(rt.bridge(), &[1, 2, 3, 4]);
    let sum = host.call_virtual(widget, "sum").arg(packed).invoke();
    assert_eq!(sum.ret::<i64>(), 10);
    rt.host().packed_destroy(packed);

    assert_eq!(host.live_strings(), 0);
    assert_eq!(host.live_containers(), 0);
    host.destroy(widget);
}

#[test]
fn test_six_argument_override_decodes_every_argument() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();

    let result = host
        .call_virtual(widget, "configure")
        .arg(42i64)
        .arg(true)
        .arg(1.5f64)
        .arg_string("hud")
        .arg(-3i32)
        .arg(Vector2 { x: 0.25, y: -8.0 })
        .invoke();
    assert_eq!(result.outcome, VirtualOutcome::Overridden);
    assert_eq!(result.ret_string(&host).as_deref(), Some("42|true|1.5|hud|-3|0.25|-8"));
    assert_eq!(rt.stats().snapshot().virtual_failures, 0);
    assert_eq!(host.live_strings(), 0);
    host.destroy(widget);
}

#[test]
fn test_panicking_override_returns_default() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();
    host.call_virtual(widget, "add_points").arg(3i64).invoke();

    let result = host.call_virtual(widget, "explode").invoke();
    assert_eq!(result.outcome, VirtualOutcome::Overridden);
    assert_eq!(result.ret::<i64>(), 0);
    assert_eq!(rt.stats().snapshot().virtual_failures, 1);

    // The instance stays usable after a failed call
    let after = host.call_virtual(widget, "add_points").arg(1i64).invoke();
    assert_eq!(after.ret::<i64>(), 4);
    host.destroy(widget);
}

#[test]
fn test_bad_argument_returns_default() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();

    let floats = f32::pack(rt.bridge(), &[1.0, 2.0]);
    let result = host.call_virtual(widget, "sum").arg(floats).invoke();
    assert_eq!(result.ret::<i64>(), 0);
    assert_eq!(rt.stats().snapshot().virtual_failures, 1);
    rt.host().packed_destroy(floats);

    let null = host
        .call_virtual(widget, "sum")
        .arg(RawPackedArray::NULL)
        .invoke();
    assert_eq!(null.outcome, VirtualOutcome::Overridden);
    host.destroy(widget);
}

#[test]
fn test_reentrant_call_is_refused() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();

    let result = host.call_virtual(widget, "reenter").invoke();
    assert!(result.ret::<bool>());
    assert_eq!(rt.stats().snapshot().virtual_failures, 0);

    // Outside any call the instance is free again
    assert!(rt.with_instance::<Widget, _>(widget, |_| ()).is_ok());
    host.destroy(widget);
}

#[test]
fn test_with_instance_checks_type() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();
    let plain = host.construct("Node");

    assert!(matches!(
        rt.with_instance::<String, _>(widget, |_| ()),
        Err(DispatchError::NotAnInstance)
    ));
    assert!(matches!(
        rt.with_instance::<Widget, _>(plain, |_| ()),
        Err(DispatchError::NotAnInstance)
    ));
    host.destroy(widget);
    host.destroy(plain);
}

#[test]
fn test_concurrent_virtual_calls() {
    let (host, rt, _) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    let result = host.call_virtual(widget, "add_points").arg(1i64).invoke();
                    assert_eq!(result.outcome, VirtualOutcome::Overridden);
                }
            });
        }
    });

    let score = rt.with_instance::<Widget, _>(widget, |w| w.score).unwrap();
    assert_eq!(score, 200);
    assert_eq!(rt.stats().snapshot().virtual_calls, 200);
    host.destroy(widget);
}

#[test]
fn test_engine_free_drops_instance() {
    let (host, rt, dropped) = setup();
    let a = rt.classes().instantiate("Widget").unwrap();
    let b = host.construct("Widget");
    assert!(!b.is_null());
    assert_eq!(rt.classes().live_instances(), 2);

    host.destroy(a);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert_eq!(rt.classes().live_instances(), 1);
    assert!(matches!(
        rt.with_instance::<Widget, _>(a, |_| ()),
        Err(DispatchError::NotAnInstance)
    ));
    assert_eq!(host.call_virtual(a, "ready").invoke().outcome, VirtualOutcome::NotAnInstance);

    host.destroy(b);
    assert_eq!(dropped.load(Ordering::SeqCst), 2);
    assert_eq!(rt.classes().live_instances(), 0);
}

#[test]
fn test_call_after_runtime_dropped_zeroes_return() {
    let (host, rt, dropped) = setup();
    let widget = rt.classes().instantiate("Widget").unwrap();

    // The host caches the call data while the runtime is alive
    let warm = host.call_virtual(widget, "add_points").arg(2i64).invoke();
    assert_eq!(warm.ret::<i64>(), 2);

    drop(rt);
    let late = host
        .call_virtual(widget, "add_points")
        .arg(5i64)
        .ret_filled(0xAB)
        .invoke();
    assert_eq!(late.outcome, VirtualOutcome::Overridden);
    assert_eq!(late.ret::<i64>(), 0);
    // Only the declared return width is touched
    assert_eq!(late.ret::<[u8; 9]>()[8], 0xAB);

    host.destroy(widget);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}
