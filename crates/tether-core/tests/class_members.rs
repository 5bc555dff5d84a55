//! Integration tests for class members, variant calls and custom callables
//!
//! Tests cover:
//! - Method signatures, properties, signals and constants reaching the host
//! - Registered methods called through ptrcall and variant call
//! - Argument count and type errors reported through `CallError`
//! - Panicking methods failing the call instead of unwinding
//! - Property access through getters and setters
//! - Rejected members taking the class back out
//! - Variant calls into the engine and `emit_signal`
//! - Custom callables freed once the last engine copy is gone

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tether_core::sys::{
    CallErrorKind, MethodFlags, RawString, RawVariant, VariantType,
};
use tether_core::{
    ClassDescriptor, ExtensionClass, MethodSpec, ObjectRef, RegistrationError, Runtime,
    RuntimeConfig, Variant, VariantKind, VarcallError,
};
use tether_testhost::{
    EmittedSignal, ExtensionConstant, ExtensionProperty, TestHost, VirtualOutcome,
};

struct Counter {
    count: i64,
    label: String,
}

impl ExtensionClass for Counter {
    const CLASS: &'static str = "Counter";
    const PARENT: &'static str = "Node";

    fn create(_base: ObjectRef) -> Self {
        Counter {
            count: 0,
            label: String::new(),
        }
    }

    fn members(desc: ClassDescriptor<Self>) -> ClassDescriptor<Self> {
        desc.method("add", &["amount"], |c: &mut Counter, (amount,): (i64,)| {
            c.count += amount;
            c.count
        })
        .const_method("get_count", &[], |c: &Counter, (): ()| c.count)
        .method("set_count", &["value"], |c: &mut Counter, (value,): (i64,)| {
            c.count = value
        })
        .method("set_label", &["label"], |c: &mut Counter, (label,): (String,)| {
            c.label = label
        })
        .const_method("get_label", &[], |c: &Counter, (): ()| c.label.clone())
        .method("explode", &[], |_: &mut Counter, (): ()| -> i64 {
            panic!("counter exploded")
        })
        .property("count", "get_count", Some("set_count"))
        .property("label", "get_label", None)
        .signal("changed", &[("count", VariantKind::Int)])
        .constant("MAX", 99)
        .enum_constant("Direction", "UP", 0)
        .enum_constant("Direction", "DOWN", 1)
        .bitfield_flag("Flags", "LOUD", 4)
    }
}

fn runtime(host: &TestHost) -> Arc<Runtime> {
    Runtime::new(&host.interface(), host.library(), RuntimeConfig::default()).unwrap()
}

fn setup() -> (TestHost, Arc<Runtime>) {
    let host = TestHost::new();
    let rt = runtime(&host);
    rt.register_class(ClassDescriptor::<Counter>::of()).unwrap();
    (host, rt)
}

fn int(value: i64) -> RawVariant {
    RawVariant::new(VariantType::Int, [value as u64, 0])
}

#[test]
fn test_members_reach_the_host() {
    let (host, _rt) = setup();

    let add = host.extension_method("Counter", "add").unwrap();
    assert_eq!(add.args, vec![("amount".to_string(), VariantType::Int)]);
    assert_eq!(add.ret, Some(VariantType::Int));
    assert!(!add.flags.contains(MethodFlags::CONST));

    let get = host.extension_method("Counter", "get_count").unwrap();
    assert!(get.args.is_empty());
    assert!(get.flags.contains(MethodFlags::NORMAL | MethodFlags::CONST));
    assert_eq!(host.extension_method("Counter", "set_count").unwrap().ret, None);

    assert_eq!(
        host.extension_property("Counter", "count"),
        Some(ExtensionProperty {
            kind: Some(VariantType::Int),
            getter: "get_count".to_string(),
            setter: "set_count".to_string(),
        })
    );
    let label = host.extension_property("Counter", "label").unwrap();
    assert_eq!(label.kind, Some(VariantType::String));
    assert!(label.setter.is_empty());

    let signals = host.extension_signals("Counter");
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].name, "changed");
    assert_eq!(
        signals[0].args,
        vec![("count".to_string(), Some(VariantType::Int))]
    );

    assert_eq!(
        host.extension_constant("Counter", "MAX"),
        Some(ExtensionConstant {
            enum_name: None,
            value: 99,
            is_bitfield: false,
        })
    );
    let down = host.extension_constant("Counter", "DOWN").unwrap();
    assert_eq!(down.enum_name.as_deref(), Some("Direction"));
    assert_eq!(down.value, 1);
    assert!(host.extension_constant("Counter", "LOUD").unwrap().is_bitfield);
}

#[test]
fn test_method_ptrcall() {
    let (host, rt) = setup();
    let obj = rt.classes().instantiate("Counter").unwrap();

    let result = host.call_method_ptr(obj, "add").arg(5i64).invoke();
    assert_eq!(result.outcome, VirtualOutcome::Overridden);
    assert_eq!(result.ret::<i64>(), 5);
    let result = host.call_method_ptr(obj, "add").arg(2i64).invoke();
    assert_eq!(result.ret::<i64>(), 7);

    let missing = host.call_method_ptr(obj, "subtract").arg(1i64).invoke();
    assert_eq!(missing.outcome, VirtualOutcome::Default);

    assert_eq!(rt.stats().snapshot().method_calls, 2);
    assert_eq!(host.frames_allocated(), host.frames_freed());
}

#[test]
fn test_method_varcall() {
    let (host, rt) = setup();
    let obj = rt.classes().instantiate("Counter").unwrap();

    let (ret, err) = host.call_method(obj, "add", &[int(7)]);
    assert!(err.is_ok());
    assert_eq!(ret.variant_type(), Some(VariantType::Int));
    assert_eq!(ret.payload[0] as i64, 7);

    let text = host.new_string("hits");
    let arg = RawVariant::new(VariantType::String, [text.addr() as u64, 0]);
    let (mut nil, err) = host.call_method(obj, "set_label", &[arg]);
    assert!(err.is_ok());
    assert_eq!(nil.variant_type(), Some(VariantType::Nil));
    host.destroy_variant(&mut nil);
    host.destroy_string(text);

    let (mut label, err) = host.call_method(obj, "get_label", &[]);
    assert!(err.is_ok());
    let raw = RawString::from_addr(label.payload[0] as usize);
    assert_eq!(host.string_content(raw).as_deref(), Some("hits"));
    host.destroy_variant(&mut label);
    assert_eq!(host.live_strings(), 0);
}

#[test]
fn test_varcall_argument_errors() {
    let (host, rt) = setup();
    let obj = rt.classes().instantiate("Counter").unwrap();

    let (_, err) = host.call_method(obj, "add", &[]);
    assert_eq!(err.kind(), Some(CallErrorKind::TooFewArguments));
    assert_eq!(err.expected, 1);

    let (_, err) = host.call_method(obj, "add", &[int(1), int(2)]);
    assert_eq!(err.kind(), Some(CallErrorKind::TooManyArguments));
    assert_eq!(err.expected, 1);

    let text = host.new_string("five");
    let arg = RawVariant::new(VariantType::String, [text.addr() as u64, 0]);
    let (ret, err) = host.call_method(obj, "add", &[arg]);
    host.destroy_string(text);
    assert_eq!(err.kind(), Some(CallErrorKind::InvalidArgument));
    assert_eq!(err.argument, 0);
    assert_eq!(err.expected, VariantType::Int as i32);
    assert_eq!(ret.variant_type(), Some(VariantType::Nil));

    let (_, err) = host.call_method(obj, "subtract", &[int(1)]);
    assert_eq!(err.kind(), Some(CallErrorKind::InvalidMethod));

    // Nothing ran, the counter is untouched
    let (count, _) = host.call_method(obj, "get_count", &[]);
    assert_eq!(count.payload[0], 0);
}

#[test]
fn test_panicking_method_fails_the_call() {
    let (host, rt) = setup();
    let obj = rt.classes().instantiate("Counter").unwrap();

    let (ret, err) = host.call_method(obj, "explode", &[]);
    assert_eq!(err.kind(), Some(CallErrorKind::InvalidMethod));
    assert_eq!(ret.variant_type(), Some(VariantType::Nil));

    let result = host.call_method_ptr(obj, "explode").ret_filled(0xab).invoke();
    assert_eq!(result.outcome, VirtualOutcome::Overridden);
    assert_eq!(result.ret::<i64>(), 0);

    let stats = rt.stats().snapshot();
    assert_eq!(stats.method_calls, 2);
    assert_eq!(stats.method_failures, 2);

    // The instance is still usable afterwards
    let (ret, err) = host.call_method(obj, "add", &[int(3)]);
    assert!(err.is_ok());
    assert_eq!(ret.payload[0], 3);
}

#[test]
fn test_property_access() {
    let (host, rt) = setup();
    let obj = rt.classes().instantiate("Counter").unwrap();

    assert!(host.set_property(obj, "count", int(42)).is_ok());
    let (value, err) = host.get_property(obj, "count");
    assert!(err.is_ok());
    assert_eq!(value.payload[0] as i64, 42);

    let err = host.set_property(obj, "label", int(1));
    assert_eq!(err.kind(), Some(CallErrorKind::InvalidMethod));
    let (_, err) = host.get_property(obj, "missing");
    assert_eq!(err.kind(), Some(CallErrorKind::InvalidMethod));
}

#[test]
fn test_property_with_undeclared_accessor_is_rejected() {
    let host = TestHost::new();
    let rt = runtime(&host);

    let desc = ClassDescriptor::new("Gauge", "Node", |_| 0i64)
        .const_method("get_level", &[], |v: &i64, (): ()| *v)
        .property("level", "get_level", Some("set_level"));
    let err = rt.register_class(desc).unwrap_err();
    assert_eq!(
        err,
        RegistrationError::UnknownAccessor {
            class: "Gauge".to_string(),
            property: "level".to_string(),
            method: "set_level".to_string(),
        }
    );
    assert_eq!(host.registration_calls(), 0);
}

#[test]
fn test_rejected_member_unregisters_the_class() {
    let (host, rt) = setup();

    // The host refuses a signal an ancestor already declares
    let desc = ClassDescriptor::new("LoudCounter", "Counter", |_| ())
        .signal("changed", &[]);
    let err = rt.register_class(desc).unwrap_err();
    assert_eq!(
        err,
        RegistrationError::MemberRejected {
            class: "LoudCounter".to_string(),
            member: "changed".to_string(),
        }
    );
    assert!(!rt.classes().is_registered("LoudCounter"));
    assert_eq!(host.unregistered_classes(), vec!["LoudCounter".to_string()]);

    // The name is free again
    rt.register_class(ClassDescriptor::new("LoudCounter", "Counter", |_| ()))
        .unwrap();
}

#[test]
fn test_emit_signal() {
    let (host, rt) = setup();
    let obj = rt.classes().instantiate("Counter").unwrap();

    rt.emit_signal(&obj, "changed", &[Variant::Int(3)]).unwrap();
    assert_eq!(
        host.emitted_signals(),
        vec![EmittedSignal {
            source: host.instance_id(obj),
            signal: "changed".to_string(),
            args: vec!["3".to_string()],
        }]
    );

    let err = rt.emit_signal(&obj, "exploded", &[]).unwrap_err();
    assert_eq!(err.call_error(), Some(CallErrorKind::InvalidMethod));
    assert_eq!(host.emitted_signals().len(), 1);
    assert_eq!(rt.stats().snapshot().varcalls, 2);
    assert_eq!(host.varcalls(), 2);
}

const JOIN: MethodSpec = MethodSpec::new("Node", "join", 0x51);

#[test]
fn test_varcall_into_the_engine() {
    let host = TestHost::new();
    host.define_vararg_method("Node", "join", 0x51, |host, _receiver, args| {
        if args.is_empty() {
            return Err(tether_core::sys::CallError::new(
                CallErrorKind::TooFewArguments,
                0,
                1,
            ));
        }
        let mut parts = Vec::new();
        for arg in args {
            let raw = RawString::from_addr(arg.payload[0] as usize);
            parts.push(host.string_content(raw).unwrap_or_default());
        }
        let joined = host.new_string(&parts.join("+"));
        Ok(RawVariant::new(VariantType::String, [joined.addr() as u64, 0]))
    });
    let rt = runtime(&host);
    let node = host.construct("Node");

    let value = rt
        .varcall(
            &JOIN,
            &node,
            &[Variant::String("a".into()), Variant::String("b".into())],
        )
        .unwrap();
    assert_eq!(value, Variant::String("a+b".into()));

    let err = rt.varcall(&JOIN, &node, &[]).unwrap_err();
    assert!(matches!(err, VarcallError::Rejected(e) if e.expected == 1));
    assert_eq!(err.call_error(), Some(CallErrorKind::TooFewArguments));

    // Argument temporaries and the result are released
    assert_eq!(host.live_strings(), 0);
    assert_eq!(rt.stats().snapshot().varcalls, 2);
}

#[test]
fn test_callable_outlives_its_handle_while_the_engine_holds_a_copy() {
    let host = TestHost::new();
    let rt = runtime(&host);
    let total = Arc::new(AtomicI64::new(0));
    let seen = Arc::clone(&total);

    let handle = rt
        .create_callable("on_hit", move |args: &[Variant]| {
            let amount = match args.first() {
                Some(Variant::Int(n)) => *n,
                _ => 0,
            };
            Variant::Int(seen.fetch_add(amount, Ordering::SeqCst) + amount)
        })
        .unwrap();
    assert_eq!(host.live_callables(), 1);
    assert_eq!(host.callable_name(handle.as_raw()).as_deref(), Some("on_hit"));

    let (ret, err) = host.call_callable(handle.as_raw(), &[int(4)]);
    assert!(err.is_ok());
    assert_eq!(ret.payload[0] as i64, 4);

    let mut kept = host.copy_variant(handle.as_raw());
    drop(handle);
    assert_eq!(host.live_callables(), 1);
    assert_eq!(Arc::strong_count(&total), 2);
    assert!(host.callable_is_valid(&kept));

    let (ret, _) = host.call_callable(&kept, &[int(1)]);
    assert_eq!(ret.payload[0] as i64, 5);

    host.destroy_variant(&mut kept);
    assert_eq!(host.live_callables(), 0);
    assert_eq!(Arc::strong_count(&total), 1);
}

#[test]
fn test_callable_passed_to_the_engine_keeps_references_balanced() {
    let host = TestHost::new();
    host.define_vararg_method("Node", "call_back", 0x52, |host, _receiver, args| {
        let (ret, err) = host.call_callable(&args[0], &[]);
        if err.is_ok() {
            Ok(ret)
        } else {
            Err(err)
        }
    });
    let rt = runtime(&host);
    let node = host.construct("Node");
    let handle = rt
        .create_callable("answer", |_: &[Variant]| Variant::Int(42))
        .unwrap();

    let spec = MethodSpec::new("Node", "call_back", 0x52);
    let value = rt.varcall(&spec, &node, &[handle.to_variant()]).unwrap();
    assert_eq!(value, Variant::Int(42));
    assert_eq!(host.live_callables(), 1);

    drop(handle);
    assert_eq!(host.live_callables(), 0);
}

#[test]
fn test_callable_is_invalid_after_runtime_shutdown() {
    let host = TestHost::new();
    let rt = runtime(&host);
    let handle = rt
        .create_callable("late", |_: &[Variant]| Variant::Nil)
        .unwrap();
    let mut kept = host.copy_variant(handle.as_raw());
    drop(handle);
    drop(rt);

    assert!(!host.callable_is_valid(&kept));
    let (ret, err) = host.call_callable(&kept, &[]);
    assert_eq!(err.kind(), Some(CallErrorKind::InvalidMethod));
    assert_eq!(ret.variant_type(), Some(VariantType::Nil));

    host.destroy_variant(&mut kept);
    assert_eq!(host.live_callables(), 0);
}
