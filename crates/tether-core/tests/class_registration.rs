//! Integration tests for the class registrar
//!
//! Tests cover:
//! - Duplicate registration rejected without reaching the host
//! - Host refusals (unknown parent, name clash with a native class)
//! - Queued registration by initialization level
//! - Unregistration in reverse order
//! - Failed construction cleaning up the engine object
//! - Host callbacks into the registrar while a class is being registered

use std::sync::{Arc, Mutex};

use tether_core::sys::InitializationLevel;
use tether_core::{
    ClassDescriptor, ExtensionClass, ObjectRef, RegistrationError, Runtime, RuntimeConfig,
    VirtualTable,
};
use tether_testhost::{TestHost, VirtualOutcome};

struct Player {
    health: i64,
}

impl ExtensionClass for Player {
    const CLASS: &'static str = "Player";
    const PARENT: &'static str = "Node2D";
    const LEVEL: InitializationLevel = InitializationLevel::Servers;

    fn create(_base: ObjectRef) -> Self {
        Player { health: 100 }
    }

    fn virtuals(table: VirtualTable<Self>) -> VirtualTable<Self> {
        table.add("take_damage", |p: &mut Player, (amount,): (i64,)| {
            p.health -= amount;
            p.health
        })
    }
}

struct Marker;

fn marker(name: &str, parent: &str) -> ClassDescriptor<Marker> {
    ClassDescriptor::new(name, parent, |_| Marker)
}

fn runtime(host: &TestHost) -> Arc<Runtime> {
    Runtime::new(&host.interface(), host.library(), RuntimeConfig::default()).unwrap()
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let host = TestHost::new();
    let rt = runtime(&host);

    rt.register_class(marker("Widget", "Node")).unwrap();
    let err = rt.register_class(marker("Widget", "Node2D")).unwrap_err();
    assert!(matches!(err, RegistrationError::AlreadyRegistered(ref name) if name == "Widget"));

    assert_eq!(host.registration_calls(), 1);
    assert_eq!(host.registered_classes(), vec!["Widget".to_string()]);
    assert_eq!(rt.classes().registered(), vec!["Widget".to_string()]);
}

#[test]
fn test_host_refusals() {
    let host = TestHost::new();
    let rt = runtime(&host);

    let err = rt.register_class(marker("Orphan", "Missing")).unwrap_err();
    assert!(matches!(err, RegistrationError::HostRejected { .. }));
    assert!(!rt.classes().is_registered("Orphan"));

    let err = rt.register_class(marker("Node", "Object")).unwrap_err();
    assert!(matches!(err, RegistrationError::HostRejected { ref class, .. } if class == "Node"));

    rt.register_class(marker("Orphan", "Node")).unwrap();
    assert!(rt.classes().is_registered("Orphan"));
    assert_eq!(host.registration_calls(), 3);
}

#[test]
fn test_extension_class_descriptor() {
    let host = TestHost::new();
    let rt = runtime(&host);

    let desc = ClassDescriptor::<Player>::of();
    assert_eq!(desc.name(), "Player");
    assert_eq!(desc.parent(), "Node2D");
    assert_eq!(desc.init_level(), InitializationLevel::Servers);
    rt.register_class(desc).unwrap();

    let player = rt.classes().instantiate("Player").unwrap();
    assert!(host.is_instance_of(player, "Node2D"));
    let result = host.call_virtual(player, "take_damage").arg(30i64).invoke();
    assert_eq!(result.outcome, VirtualOutcome::Overridden);
    assert_eq!(result.ret::<i64>(), 70);
    assert_eq!(rt.with_instance::<Player, _>(player, |p| p.health).unwrap(), 70);
    host.destroy(player);
}

#[test]
fn test_queued_classes_follow_levels() {
    let host = TestHost::new();
    let rt = runtime(&host);

    rt.queue_class(ClassDescriptor::<Player>::of());
    rt.queue_class(marker("Widget", "Node"));
    rt.queue_class(marker("Inspector", "Node").level(InitializationLevel::Editor));
    assert_eq!(rt.classes().minimum_level(), Some(InitializationLevel::Servers));
    assert_eq!(rt.classes().pending().len(), 3);

    rt.classes().initialize_level(InitializationLevel::Core).unwrap();
    assert!(host.registered_classes().is_empty());

    for level in [
        InitializationLevel::Servers,
        InitializationLevel::Scene,
        InitializationLevel::Editor,
    ] {
        rt.classes().initialize_level(level).unwrap();
    }
    assert_eq!(host.registered_classes(), vec!["Player", "Widget", "Inspector"]);
    assert!(rt.classes().pending().is_empty());

    rt.classes().deinitialize_level(InitializationLevel::Editor);
    assert_eq!(host.unregistered_classes(), vec!["Inspector"]);
    assert_eq!(rt.classes().registered(), vec!["Player", "Widget"]);
}

#[test]
fn test_queued_failure_still_registers_the_rest() {
    let host = TestHost::new();
    let rt = runtime(&host);

    rt.queue_class(marker("Broken", "Missing"));
    rt.queue_class(marker("Fine", "Node"));
    let err = rt
        .classes()
        .initialize_level(InitializationLevel::Scene)
        .unwrap_err();
    assert!(matches!(err, RegistrationError::HostRejected { .. }));
    assert!(rt.classes().is_registered("Fine"));
}

#[test]
fn test_unregister_all_in_reverse_order() {
    let host = TestHost::new();
    let rt = runtime(&host);

    rt.register_class(marker("First", "Node")).unwrap();
    rt.register_class(marker("Second", "First")).unwrap();
    rt.register_class(marker("Third", "Second")).unwrap();

    rt.classes().unregister("Second").unwrap();
    assert!(matches!(
        rt.classes().unregister("Second"),
        Err(RegistrationError::UnknownClass(_))
    ));

    rt.register_class(marker("Fourth", "Node")).unwrap();
    rt.shutdown();
    assert_eq!(
        host.unregistered_classes(),
        vec!["Second", "Fourth", "Third", "First"]
    );
    assert!(rt.classes().registered().is_empty());
}

#[test]
fn test_instantiate_unknown_class() {
    let host = TestHost::new();
    let rt = runtime(&host);

    let err = rt.classes().instantiate("Ghost").unwrap_err();
    assert!(matches!(err, RegistrationError::UnknownClass(_)));
}

#[test]
fn test_panicking_constructor_cleans_up() {
    let host = TestHost::new();
    let rt = runtime(&host);
    rt.register_class(ClassDescriptor::new("Fragile", "Node", |_| -> Marker {
        panic!("cannot build")
    }))
    .unwrap();

    let before = host.live_objects();
    let err = rt.classes().instantiate("Fragile").unwrap_err();
    assert!(matches!(err, RegistrationError::ConstructionFailed(_)));
    assert_eq!(host.live_objects(), before);
    assert_eq!(rt.classes().live_instances(), 0);
}

#[test]
fn test_host_callback_during_registration_can_query_registrar() {
    let host = TestHost::new();
    let rt = runtime(&host);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&rt);
    let log = Arc::clone(&seen);
    host.on_register(move |class| {
        let rt = weak.upgrade().expect("runtime alive");
        let registered = rt.classes().is_registered(class);
        let overridden = rt.lookup_override(class, "take_damage").is_some();
        log.lock().unwrap().push((class.to_string(), registered, overridden));
    });

    rt.register_class(ClassDescriptor::<Player>::of()).unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("Player".to_string(), false, false)]
    );
    assert!(rt.classes().is_registered("Player"));
    assert!(rt.lookup_override("Player", "take_damage").is_some());
}
