//! Integration tests for call frames
//!
//! Tests cover:
//! - Scalar boundary values through echo methods (width and sign kept)
//! - Strings, names and variants, including nested containers
//! - Frame lifecycle violations (overflow, missing argument, double read)
//! - Frame release on every path and host temporaries cleaned up

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tether_core::frame::pooled_buffers;
use tether_core::variant::{Color, Vector2, Vector3};
use tether_core::{
    AbiViolation, ConversionErrorKind, Dictionary, FromVariant, MethodSpec, PtrCall, Runtime,
    RuntimeConfig, StringName, Variant, VariantKind, MAX_FRAME_ARGS,
};
use tether_sys::{RawObject, RawStringName};
use tether_testhost::TestHost;

fn runtime(host: &TestHost) -> Arc<Runtime> {
    Runtime::new(&host.interface(), host.library(), RuntimeConfig::default()).unwrap()
}

/// Define `Echo::<method>` returning its first argument bit for bit
fn define_echo<T: Copy + 'static>(host: &TestHost, method: &str, hash: i64) {
    host.define_method("Echo", method, hash, |call| {
        let value: T = call.arg(0);
        call.ret(value);
    });
}

fn echo<T: PtrCall>(rt: &Runtime, receiver: RawObject, method: &'static str, hash: i64, value: T) -> T {
    let spec = MethodSpec::new("Echo", method, hash);
    unsafe { rt.call::<T, _>(&spec, &receiver, &[&value]) }.unwrap()
}

fn echo_host() -> (TestHost, RawObject) {
    let host = TestHost::new();
    host.define_class("Echo", "Object");
    define_echo::<i8>(&host, "i8", 1);
    define_echo::<u8>(&host, "u8", 2);
    define_echo::<i16>(&host, "i16", 3);
    define_echo::<u16>(&host, "u16", 4);
    define_echo::<i32>(&host, "i32", 5);
    define_echo::<u32>(&host, "u32", 6);
    define_echo::<i64>(&host, "i64", 7);
    define_echo::<u64>(&host, "u64", 8);
    define_echo::<f32>(&host, "f32", 9);
    define_echo::<f64>(&host, "f64", 10);
    define_echo::<Vector3>(&host, "vector3", 11);
    define_echo::<Color>(&host, "color", 12);
    define_echo::<RawStringName>(&host, "name", 13);
    host.define_method("Echo", "bool", 14, |call| {
        let value: u8 = call.arg(0);
        call.ret(value != 0);
    });
    host.define_method("Echo", "string", 15, |call| {
        let text = call.arg_string(0);
        call.ret_string(&text);
    });
    host.define_method("Echo", "variant", 16, |call| {
        let value = call.arg_variant(0);
        call.ret_variant_copy(&value);
    });
    let receiver = host.construct("Echo");
    (host, receiver)
}

#[test]
fn test_integer_boundaries() {
    let (host, echo_obj) = echo_host();
    let rt = runtime(&host);

    for v in [0i8, -1, i8::MIN, i8::MAX] {
        assert_eq!(echo(&rt, echo_obj, "i8", 1, v), v);
    }
    for v in [0u8, 1, u8::MAX] {
        assert_eq!(echo(&rt, echo_obj, "u8", 2, v), v);
    }
    for v in [0i16, -1, i16::MIN, i16::MAX] {
        assert_eq!(echo(&rt, echo_obj, "i16", 3, v), v);
    }
    for v in [0u16, u16::MAX] {
        assert_eq!(echo(&rt, echo_obj, "u16", 4, v), v);
    }
    for v in [0i32, -1, i32::MIN, i32::MAX] {
        assert_eq!(echo(&rt, echo_obj, "i32", 5, v), v);
    }
    for v in [0u32, u32::MAX] {
        assert_eq!(echo(&rt, echo_obj, "u32", 6, v), v);
    }
    for v in [0i64, -1, i64::MIN, i64::MAX, 1 << 40] {
        assert_eq!(echo(&rt, echo_obj, "i64", 7, v), v);
    }
    for v in [0u64, u64::MAX, 1 << 63] {
        assert_eq!(echo(&rt, echo_obj, "u64", 8, v), v);
    }
    assert_eq!(rt.stats().snapshot().frames_outstanding(), 0);
}

#[test]
fn test_float_and_bool() {
    let (host, echo_obj) = echo_host();
    let rt = runtime(&host);

    for v in [0.0f32, -0.5, f32::MAX, f32::MIN_POSITIVE] {
        assert_eq!(echo(&rt, echo_obj, "f32", 9, v), v);
    }
    for v in [0.0f64, -1.25, f64::MAX, f64::MIN] {
        assert_eq!(echo(&rt, echo_obj, "f64", 10, v), v);
    }
    assert!(echo(&rt, echo_obj, "f64", 10, f64::NAN).is_nan());
    assert!(echo(&rt, echo_obj, "bool", 14, true));
    assert!(!echo(&rt, echo_obj, "bool", 14, false));
}

#[test]
fn test_math_values_by_value() {
    let (host, echo_obj) = echo_host();
    let rt = runtime(&host);

    let v = Vector3 { x: 1.0, y: -2.0, z: 3.5 };
    assert_eq!(echo(&rt, echo_obj, "vector3", 11, v), v);
    let c = Color::rgb(0.25, 0.5, 1.0);
    assert_eq!(echo(&rt, echo_obj, "color", 12, c), c);
}

#[test]
fn test_strings_and_names() {
    let (host, echo_obj) = echo_host();
    let rt = runtime(&host);

    for text in ["", "hello", "héllo wörld", "日本語のテキスト", "emoji 🚀🦀"] {
        assert_eq!(echo(&rt, echo_obj, "string", 15, text.to_string()), text);
    }
    assert_eq!(host.live_strings(), 0);

    let name = rt.names().intern("ready");
    let back: StringName = echo(&rt, echo_obj, "name", 13, name.clone());
    assert_eq!(back, name);
    assert_eq!(back.as_str(), "ready");
}

#[test]
fn test_variants_and_containers() {
    let (host, echo_obj) = echo_host();
    let rt = runtime(&host);

    let mut inner = Dictionary::new();
    inner.insert("b", 2i64);
    inner.insert("a", Variant::Array(vec![]));
    let mut outer = Dictionary::new();
    outer.insert("zeta", Variant::Nil);
    outer.insert("alpha", inner);
    outer.insert(3i64, "three");

    let samples = vec![
        Variant::Nil,
        Variant::Int(i64::MIN),
        Variant::from(""),
        Variant::from("naïve"),
        Variant::Array(vec![]),
        Variant::Array(vec![
            Variant::Int(1),
            Variant::Array(vec![Variant::Bool(true), Variant::from("deep")]),
            Variant::Vector2(Vector2 { x: 1.0, y: 2.0 }),
        ]),
        Variant::Dictionary(outer.clone()),
        Variant::PackedInt32Array(vec![i32::MIN, 0, i32::MAX]),
        Variant::PackedStringArray(vec!["x".into(), "".into(), "ü".into()]),
    ];
    for sample in samples {
        let back = echo(&rt, echo_obj, "variant", 16, sample.clone());
        assert_eq!(back, sample);
    }

    let back = echo(&rt, echo_obj, "variant", 16, Variant::Dictionary(outer.clone()));
    let keys: Vec<_> = Dictionary::from_variant(&back)
        .unwrap()
        .iter()
        .map(|(k, _)| k.clone())
        .collect();
    assert_eq!(keys, vec![Variant::from("zeta"), Variant::from("alpha"), Variant::Int(3)]);

    assert_eq!(host.live_strings(), 0);
    assert_eq!(host.live_containers(), 0);
    assert_eq!(host.live_allocations(), 0);
}

#[test]
fn test_variant_mismatch_is_recoverable() {
    let (host, echo_obj) = echo_host();
    let rt = runtime(&host);

    let back = echo(&rt, echo_obj, "variant", 16, Variant::Int(5));
    let err = String::from_variant(&back).unwrap_err();
    assert_eq!(
        err.kind(),
        &ConversionErrorKind::TypeMismatch {
            expected: VariantKind::String,
            actual: VariantKind::Int,
        }
    );

    let nested = Variant::Array(vec![Variant::Int(1), Variant::from("two")]);
    let back = echo(&rt, echo_obj, "variant", 16, nested);
    let err = back.try_to_vec::<i64>().unwrap_err();
    assert_eq!(err.path_string(), "[1]");
}

#[test]
fn test_method_call_with_mixed_arguments() {
    let host = TestHost::new();
    host.define_method("Node", "describe", 0x44, |call| {
        let target: RawObject = call.arg(0);
        let text = call.arg_string(1);
        let flag: u8 = call.arg(2);
        let count: i64 = call.arg(3);
        let alive = call.host.is_alive(target);
        call.ret_string(&format!("{text}:{}:{count}:{alive}", flag != 0));
    });
    let rt = runtime(&host);
    let node = host.construct("Node");
    let spec = MethodSpec::new("Node", "describe", 0x44);

    let out = unsafe { rt.call::<String, _>(&spec, &node, &[&node, &"hi", &true, &-9i64]) }.unwrap();
    assert_eq!(out, "hi:true:-9:true");
    assert_eq!(host.live_strings(), 0);
    assert_eq!(rt.stats().snapshot().frames_outstanding(), 0);
}

#[test]
fn test_frame_overflow_is_fatal() {
    let host = TestHost::new();
    let rt = runtime(&host);

    let payload = catch_unwind(AssertUnwindSafe(|| {
        rt.new_frame(MAX_FRAME_ARGS + 1);
    }))
    .unwrap_err();
    assert_eq!(
        payload.downcast_ref::<AbiViolation>(),
        Some(&AbiViolation::FrameOverflow {
            requested: MAX_FRAME_ARGS + 1,
            capacity: MAX_FRAME_ARGS,
        })
    );
    assert_eq!(rt.stats().snapshot().frames_allocated, 0);
}

#[test]
fn test_missing_argument_is_fatal() {
    let host = TestHost::new();
    host.define_method("Node", "set_pair", 0x12, |_| {});
    let rt = runtime(&host);
    let node = host.construct("Node");
    let bind = rt.binds().resolve_spec(&MethodSpec::new("Node", "set_pair", 0x12));

    let payload = catch_unwind(AssertUnwindSafe(|| {
        let mut frame = rt.new_frame(2);
        frame.write_arg(0, &1i64);
        unsafe { frame.invoke(bind, &node) };
    }))
    .unwrap_err();
    assert_eq!(
        payload.downcast_ref::<AbiViolation>(),
        Some(&AbiViolation::MissingArgument { index: 1, arity: 2 })
    );
    assert_eq!(host.ptrcalls(), 0);
    assert_eq!(rt.stats().snapshot().frames_outstanding(), 0);
}

#[test]
fn test_argument_index_out_of_range_is_fatal() {
    let host = TestHost::new();
    let rt = runtime(&host);

    let payload = catch_unwind(AssertUnwindSafe(|| {
        let mut frame = rt.new_frame(1);
        frame.write_arg(1, &0i32);
    }))
    .unwrap_err();
    assert_eq!(
        payload.downcast_ref::<AbiViolation>(),
        Some(&AbiViolation::ArgumentIndex { index: 1, arity: 1 })
    );
}

#[test]
fn test_result_state_is_enforced() {
    let host = TestHost::new();
    host.define_method("Node", "get_count", 0x20, |call| call.ret(4i64));
    let rt = runtime(&host);
    let node = host.construct("Node");
    let bind = rt.binds().resolve_spec(&MethodSpec::new("Node", "get_count", 0x20));

    let payload = catch_unwind(AssertUnwindSafe(|| {
        let frame = rt.new_frame(0);
        let _ = frame.read_result::<i64>();
    }))
    .unwrap_err();
    assert!(matches!(
        payload.downcast_ref::<AbiViolation>(),
        Some(AbiViolation::ResultState(_))
    ));

    let payload = catch_unwind(AssertUnwindSafe(|| {
        let mut frame = rt.new_frame(0);
        unsafe { frame.invoke(bind, &node) };
        assert_eq!(frame.read_result::<i64>(), Ok(4));
        let _ = frame.read_result::<i64>();
    }))
    .unwrap_err();
    assert!(matches!(
        payload.downcast_ref::<AbiViolation>(),
        Some(AbiViolation::ResultState(_))
    ));
    assert_eq!(rt.stats().snapshot().frames_outstanding(), 0);
}

#[test]
fn test_frame_buffers_are_pooled() {
    let host = TestHost::new();
    host.define_method("Node", "get_count", 0x20, |call| call.ret(4i64));
    let rt = runtime(&host);
    let node = host.construct("Node");
    let spec = MethodSpec::new("Node", "get_count", 0x20);

    std::thread::spawn(move || {
        for _ in 0..10 {
            let count = unsafe { rt.call::<i64, _>(&spec, &node, &[]) }.unwrap();
            assert_eq!(count, 4);
        }
        assert_eq!(pooled_buffers(), 1);
        let snapshot = rt.stats().snapshot();
        assert_eq!(snapshot.frames_allocated, 10);
        assert_eq!(snapshot.frames_freed, 10);
    })
    .join()
    .unwrap();
}
