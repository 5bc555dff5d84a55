//! Integration test for library load and unload through the generated
//! entry point
//!
//! Kept in its own binary: it installs the process-wide runtime.

use std::sync::Arc;

use tether_core::sys::{ExtensionInitialization, InitializationLevel};
use tether_core::{
    runtime, tether_entry, ClassDescriptor, ObjectRef, Runtime, RuntimeConfig, RuntimeError,
    VirtualTable,
};
use tether_testhost::{TestHost, VirtualOutcome};

struct Spinner {
    turns: i64,
}

fn spinner(_: ObjectRef) -> Spinner {
    Spinner { turns: 0 }
}

fn setup(rt: &Arc<Runtime>) -> Result<(), RuntimeError> {
    let virtuals = VirtualTable::<Spinner>::new().add0("spin", |s: &mut Spinner| {
        s.turns += 1;
        s.turns
    });
    rt.queue_class(ClassDescriptor::new("Spinner", "Node2D", spinner).virtuals(virtuals));
    rt.queue_class(
        ClassDescriptor::new("SpinnerGizmo", "Node", |_| ()).level(InitializationLevel::Editor),
    );
    Ok(())
}

tether_entry!(spinner_library_init, setup);

#[test]
fn test_load_run_unload() {
    let host = TestHost::new();
    let interface = host.interface();
    let mut init = ExtensionInitialization::default();

    let loaded = unsafe { spinner_library_init(&interface, host.library(), &mut init) };
    assert!(loaded);
    assert_eq!(init.minimum_level, InitializationLevel::Core);
    let initialize = init.initialize.unwrap();
    let deinitialize = init.deinitialize.unwrap();

    let rt = runtime::get().unwrap();
    assert_eq!(rt.host().library(), host.library());
    assert_eq!(rt.classes().pending().len(), 2);

    // A second runtime cannot be installed while one is loaded
    let other = Runtime::new(&interface, host.library(), RuntimeConfig::default()).unwrap();
    assert!(matches!(runtime::install(other), Err(RuntimeError::AlreadyInitialized)));

    for level in InitializationLevel::ALL {
        unsafe { initialize(init.userdata, level) };
    }
    assert_eq!(host.registered_classes(), vec!["Spinner", "SpinnerGizmo"]);

    let spinner = rt.classes().instantiate("Spinner").unwrap();
    for expected in 1..=3 {
        let result = host.call_virtual(spinner, "spin").invoke();
        assert_eq!(result.outcome, VirtualOutcome::Overridden);
        assert_eq!(result.ret::<i64>(), expected);
    }
    host.destroy(spinner);
    drop(rt);

    for level in InitializationLevel::ALL.into_iter().rev() {
        unsafe { deinitialize(init.userdata, level) };
    }
    assert_eq!(host.unregistered_classes(), vec!["SpinnerGizmo", "Spinner"]);
    assert!(runtime::try_get().is_none());
    assert!(matches!(runtime::shutdown(), Err(RuntimeError::NotInitialized)));
    assert!(matches!(runtime::get(), Err(RuntimeError::NotInitialized)));
}
