//! Tether TestHost - a simulated engine behind the tether ABI
//!
//! `TestHost` implements every entry of `HostInterface` in plain Rust so the
//! runtime can be exercised without a real engine. It keeps the bookkeeping
//! tests need to check ownership rules: reference count traffic, destroyed
//! objects, frees of unknown handles, live strings and containers, method
//! bind lookups and registered classes. Members an extension class registers
//! can be called from the engine side with variant or ptrcall arguments, and
//! custom callables are reference counted by copies of their variant.
//!
//! # Example
//!
//! ```ignore
//! let host = TestHost::new();
//! host.define_method("Node", "get_child_count", 0, |call| call.ret(3i64));
//! let table = host.interface();
//! ```

#![warn(missing_docs)]

mod call;
mod ffi;
mod store;

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_sys::{
    CallError, CallErrorKind, CallableCustomInfo, ClassMethodInfo, HostInterface, InstanceId,
    PropertyInfo, RawArgs, RawInstance, RawObject, RawRet, RawString, RawStringName, RawVariant,
    VariantType,
};

pub use call::{HostCall, MethodFn, VarMethodFn, VirtualCall, VirtualOutcome, VirtualResult};
pub use store::{
    EmittedSignal, ExtensionConstant, ExtensionMethod, ExtensionProperty, ExtensionSignal,
    EMIT_SIGNAL_HASH,
};

use call::CallTarget;
use store::{Bind, CallableRecord, MethodRecord, Store};

/// Counters that are not naturally part of the store
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub ref_increments: AtomicUsize,
    pub ref_decrements: AtomicUsize,
    pub ptrcalls: AtomicUsize,
    pub varcalls: AtomicUsize,
    pub frames_allocated: AtomicUsize,
    pub frames_freed: AtomicUsize,
    pub registration_calls: AtomicUsize,
}

/// Callback run after the host accepts an extension class, with its name
pub type RegisterHook = dyn Fn(&str) + Send + Sync;

/// Engine state shared by every function in the table
pub struct HostState {
    store: Mutex<Store>,
    register_hook: Mutex<Option<Arc<RegisterHook>>>,
    pub(crate) counters: Counters,
}

/// Owner of a simulated host. Dereferences to [`HostState`].
#[derive(Clone)]
pub struct TestHost {
    state: Arc<HostState>,
}

impl TestHost {
    /// Create a host with the builtin classes Object, RefCounted, Resource,
    /// Node and Node2D
    pub fn new() -> Self {
        Self {
            state: Arc::new(HostState {
                store: Mutex::new(Store::new()),
                register_hook: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Function table pointing at this host. The host must outlive every
    /// runtime built from the table.
    pub fn interface(&self) -> HostInterface {
        ffi::interface(Arc::as_ptr(&self.state) as *mut c_void)
    }

    /// Library token passed alongside the interface
    pub fn library(&self) -> *mut c_void {
        0x7e7e_0000usize as *mut c_void
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestHost {
    type Target = HostState;

    fn deref(&self) -> &HostState {
        &self.state
    }
}

impl HostState {
    // ========================================================================
    // Class database setup
    // ========================================================================

    /// Add a native class
    pub fn define_class(&self, name: &str, parent: &str) {
        let mut store = self.store.lock();
        store.classes.insert(
            name.to_string(),
            store::ClassRecord {
                parent: Some(parent.to_string()),
                extension: None,
            },
        );
    }

    /// Add a native method. `hash` must match what the extension asks for.
    pub fn define_method<F>(&self, class: &str, method: &str, hash: i64, f: F)
    where
        F: Fn(&mut HostCall<'_>) + Send + Sync + 'static,
    {
        let mut store = self.store.lock();
        let bind = store.next_addr();
        let f: Arc<MethodFn> = Arc::new(f);
        store.binds.insert(bind, Bind::Ptr(f));
        store
            .methods
            .insert((class.to_string(), method.to_string()), MethodRecord { hash, bind });
    }

    /// Add a native method reached through `object_method_bind_call`
    pub fn define_vararg_method<F>(&self, class: &str, method: &str, hash: i64, f: F)
    where
        F: Fn(&HostState, RawObject, &[RawVariant]) -> Result<RawVariant, CallError>
            + Send
            + Sync
            + 'static,
    {
        let mut store = self.store.lock();
        let bind = store.next_addr();
        let f: Arc<VarMethodFn> = Arc::new(f);
        store.binds.insert(bind, Bind::Var(f));
        store
            .methods
            .insert((class.to_string(), method.to_string()), MethodRecord { hash, bind });
    }

    /// Number of times the extension looked up a method bind
    pub fn bind_lookups(&self, class: &str, method: &str) -> usize {
        self.store
            .lock()
            .bind_lookups
            .get(&(class.to_string(), method.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Register an engine singleton object
    pub fn add_singleton(&self, name: &str, class: &str) -> RawObject {
        let mut store = self.store.lock();
        let addr = store.new_object(class);
        store.singletons.insert(name.to_string(), addr);
        RawObject::from_addr(addr)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Construct an object the way the engine would
    pub fn construct(&self, class: &str) -> RawObject {
        let extension = {
            let mut store = self.store.lock();
            match store.classes.get(class).map(|c| c.extension) {
                Some(Some(info)) => Some(info),
                Some(None) => return RawObject::from_addr(store.new_object(class)),
                None => return RawObject::NULL,
            }
        };
        match extension.and_then(|info| info.0.create_instance.map(|f| (f, info.0.class_userdata))) {
            // SAFETY: registered by the extension for this class
            Some((create, userdata)) => unsafe { create(userdata) },
            None => RawObject::NULL,
        }
    }

    /// Destroy an object, running extension cleanup for extension instances
    pub fn destroy(&self, object: RawObject) {
        let removed = self.store.lock().remove_object(object.addr());
        if let Some((instance, Some(info))) = removed {
            if let Some(free) = info.0.free_instance {
                // SAFETY: instance was attached by the extension for this class
                unsafe { free(info.0.class_userdata, RawInstance::from_addr(instance)) };
            }
        }
    }

    /// Whether an object is still alive
    pub fn is_alive(&self, object: RawObject) -> bool {
        self.store.lock().objects.contains_key(&object.addr())
    }

    /// Instance id of a live object
    pub fn instance_id(&self, object: RawObject) -> InstanceId {
        self.store
            .lock()
            .objects
            .get(&object.addr())
            .map(|o| InstanceId(o.id))
            .unwrap_or(InstanceId::NONE)
    }

    /// Live object by id
    pub fn object_from_id(&self, id: InstanceId) -> RawObject {
        self.store
            .lock()
            .ids
            .get(&id.0)
            .map(|addr| RawObject::from_addr(*addr))
            .unwrap_or(RawObject::NULL)
    }

    /// Class an object currently reports
    pub fn class_of(&self, object: RawObject) -> Option<String> {
        self.store
            .lock()
            .objects
            .get(&object.addr())
            .map(|o| o.class.clone())
    }

    /// Current intrusive count; `None` for dead or non-refcounted objects
    pub fn refcount(&self, object: RawObject) -> Option<i64> {
        self.store
            .lock()
            .objects
            .get(&object.addr())
            .and_then(|o| o.refcount)
    }

    /// Whether `object` is an instance of `class` or a subclass
    pub fn is_instance_of(&self, object: RawObject, class: &str) -> bool {
        let store = self.store.lock();
        match store.objects.get(&object.addr()) {
            Some(o) => store.inherits(&o.class, class),
            None => false,
        }
    }

    pub(crate) fn set_instance(&self, object: RawObject, class: RawStringName, instance: RawInstance) {
        let mut store = self.store.lock();
        let Some(class) = store.names.get(&class.addr()).cloned() else {
            return;
        };
        let extension = store.classes.get(&class).and_then(|c| c.extension);
        if let Some(record) = store.objects.get_mut(&object.addr()) {
            record.class = class;
            record.instance = Some(instance.addr());
            record.extension = extension;
            record.virtuals.clear();
        }
    }

    pub(crate) fn reference(&self, object: RawObject) -> bool {
        let mut guard = self.store.lock();
        let store = &mut *guard;
        match store.objects.get_mut(&object.addr()).and_then(|o| o.refcount.as_mut()) {
            Some(count) => {
                *count += 1;
                self.counters.ref_increments.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub(crate) fn unreference(&self, object: RawObject) -> bool {
        let mut guard = self.store.lock();
        let store = &mut *guard;
        let count = match store.objects.get_mut(&object.addr()).and_then(|o| o.refcount.as_mut()) {
            Some(count) => count,
            None => {
                store.invalid_frees += 1;
                return false;
            }
        };
        self.counters.ref_decrements.fetch_add(1, Ordering::SeqCst);
        if *count == 0 {
            store.over_releases += 1;
            return false;
        }
        *count -= 1;
        *count == 0
    }

    pub(crate) fn cast_to(&self, object: RawObject, class: RawStringName) -> RawObject {
        let store = self.store.lock();
        let (Some(record), Some(target)) = (
            store.objects.get(&object.addr()),
            store.names.get(&class.addr()),
        ) else {
            return RawObject::NULL;
        };
        if store.inherits(&record.class, target) {
            object
        } else {
            RawObject::NULL
        }
    }

    pub(crate) fn singleton(&self, name: RawStringName) -> RawObject {
        let store = self.store.lock();
        store
            .names
            .get(&name.addr())
            .and_then(|n| store.singletons.get(n))
            .map(|addr| RawObject::from_addr(*addr))
            .unwrap_or(RawObject::NULL)
    }

    // ========================================================================
    // Method binds
    // ========================================================================

    pub(crate) fn method_bind(&self, class: RawStringName, method: RawStringName, hash: i64) -> usize {
        let mut store = self.store.lock();
        let (Some(class), Some(method)) = (
            store.names.get(&class.addr()).cloned(),
            store.names.get(&method.addr()).cloned(),
        ) else {
            return 0;
        };
        let key = (class, method);
        *store.bind_lookups.entry(key.clone()).or_insert(0) += 1;
        match store.methods.get(&key) {
            Some(record) if record.hash == hash => record.bind,
            _ => 0,
        }
    }

    pub(crate) fn ptrcall(&self, bind: usize, receiver: RawObject, args: RawArgs, ret: RawRet) {
        let f = self.store.lock().binds.get(&bind).cloned();
        self.counters.ptrcalls.fetch_add(1, Ordering::SeqCst);
        if let Some(Bind::Ptr(f)) = f {
            let mut call = HostCall::new(self, receiver, args, ret);
            f(&mut call);
        }
    }

    pub(crate) fn varcall(
        &self,
        bind: usize,
        receiver: RawObject,
        args: &[RawVariant],
    ) -> Result<RawVariant, CallError> {
        let f = self.store.lock().binds.get(&bind).cloned();
        self.counters.varcalls.fetch_add(1, Ordering::SeqCst);
        match f {
            Some(Bind::Var(f)) => f(self, receiver, args),
            _ => Err(CallError::new(CallErrorKind::InvalidMethod, 0, 0)),
        }
    }

    /// Total ptrcalls received
    pub fn ptrcalls(&self) -> usize {
        self.counters.ptrcalls.load(Ordering::SeqCst)
    }

    /// Total `object_method_bind_call` calls received
    pub fn varcalls(&self) -> usize {
        self.counters.varcalls.load(Ordering::SeqCst)
    }

    /// Built-in `Object.emit_signal`: the first argument names a signal
    /// declared by the receiver's class or an ancestor
    pub(crate) fn emit_signal(
        &self,
        receiver: RawObject,
        args: &[RawVariant],
    ) -> Result<RawVariant, CallError> {
        let mut store = self.store.lock();
        let Some(object) = store.objects.get(&receiver.addr()) else {
            return Err(CallError::new(CallErrorKind::InstanceIsNull, 0, 0));
        };
        let (id, class) = (object.id, object.class.clone());
        let Some(first) = args.first() else {
            return Err(CallError::new(CallErrorKind::TooFewArguments, 0, 1));
        };
        if first.variant_type() != Some(VariantType::StringName) {
            return Err(CallError::new(
                CallErrorKind::InvalidArgument,
                0,
                VariantType::StringName as i32,
            ));
        }
        let signal = store
            .names
            .get(&(first.payload[0] as usize))
            .cloned()
            .unwrap_or_default();
        let declared = store.class_chain(&class).iter().any(|c| {
            store
                .signals
                .get(c)
                .map_or(false, |list| list.iter().any(|s| s.name == signal))
        });
        if !declared {
            return Err(CallError::new(CallErrorKind::InvalidMethod, 0, 0));
        }
        let rendered = args[1..].iter().map(|a| store.describe_variant(a)).collect();
        store.emitted.push(EmittedSignal {
            source: InstanceId(id),
            signal,
            args: rendered,
        });
        Ok(RawVariant::new(VariantType::Int, [0, 0]))
    }

    /// Signals emitted so far, in order
    pub fn emitted_signals(&self) -> Vec<EmittedSignal> {
        self.store.lock().emitted.clone()
    }

    // ========================================================================
    // Extension classes
    // ========================================================================

    pub(crate) fn register_class(
        &self,
        class: RawStringName,
        parent: RawStringName,
        info: &tether_sys::ClassCreationInfo,
    ) -> bool {
        self.counters.registration_calls.fetch_add(1, Ordering::SeqCst);
        let mut store = self.store.lock();
        let (Some(class), Some(parent)) = (
            store.names.get(&class.addr()).cloned(),
            store.names.get(&parent.addr()).cloned(),
        ) else {
            return false;
        };
        if store.classes.contains_key(&class) || !store.classes.contains_key(&parent) {
            return false;
        }
        store.classes.insert(
            class.clone(),
            store::ClassRecord {
                parent: Some(parent),
                extension: Some(store::ExtensionInfo(*info)),
            },
        );
        store.registered.push(class.clone());
        drop(store);

        // Still inside the extension's register call, like engine-side
        // class setup that calls back into the extension
        let hook = self.register_hook.lock().clone();
        if let Some(hook) = hook {
            hook(&class);
        }
        true
    }

    /// Run `f` with the class name each time an extension class is
    /// accepted, before the registering call returns
    pub fn on_register<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.register_hook.lock() = Some(Arc::new(f));
    }

    pub(crate) fn unregister_class(&self, class: RawStringName) {
        let mut store = self.store.lock();
        let Some(class) = store.names.get(&class.addr()).cloned() else {
            return;
        };
        let is_extension = store
            .classes
            .get(&class)
            .map(|c| c.extension.is_some())
            .unwrap_or(false);
        if is_extension {
            store.classes.remove(&class);
            store.forget_members(&class);
            store.unregistered.push(class);
        }
    }

    // ========================================================================
    // Extension class members
    // ========================================================================

    fn extension_class_name(store: &Store, class: RawStringName) -> Option<String> {
        let name = store.names.get(&class.addr())?;
        match store.classes.get(name) {
            Some(record) if record.extension.is_some() => Some(name.clone()),
            _ => None,
        }
    }

    fn property_kind(info: &PropertyInfo) -> Option<VariantType> {
        VariantType::from_u32(info.variant_type)
    }

    pub(crate) fn register_method(
        &self,
        class: RawStringName,
        info: &ClassMethodInfo,
        args: &[PropertyInfo],
        ret: Option<&PropertyInfo>,
    ) -> bool {
        let mut store = self.store.lock();
        let Some(class) = Self::extension_class_name(&store, class) else {
            return false;
        };
        let Some(method) = store.names.get(&info.name.addr()).cloned() else {
            return false;
        };
        let key = (class, method);
        if store.ext_methods.contains_key(&key) {
            return false;
        }
        let args = args
            .iter()
            .map(|a| {
                let name = store.names.get(&a.name.addr()).cloned().unwrap_or_default();
                (name, Self::property_kind(a).unwrap_or(VariantType::Nil))
            })
            .collect();
        let record = ExtensionMethod {
            args,
            ret: ret.and_then(Self::property_kind),
            flags: info.flags,
            userdata: info.method_userdata as usize,
            call: info.call,
            ptrcall: info.ptrcall,
        };
        store.ext_methods.insert(key, record);
        true
    }

    pub(crate) fn register_property(
        &self,
        class: RawStringName,
        info: &PropertyInfo,
        setter: RawStringName,
        getter: RawStringName,
    ) -> bool {
        let mut store = self.store.lock();
        let Some(class) = Self::extension_class_name(&store, class) else {
            return false;
        };
        let name = store.names.get(&info.name.addr()).cloned();
        let getter = store.names.get(&getter.addr()).cloned();
        let setter = store.names.get(&setter.addr()).cloned().unwrap_or_default();
        let (Some(name), Some(getter)) = (name, getter) else {
            return false;
        };
        let declared = |method: &str| {
            store
                .ext_methods
                .contains_key(&(class.clone(), method.to_string()))
        };
        if !declared(&getter) || (!setter.is_empty() && !declared(&setter)) {
            return false;
        }
        let key = (class.clone(), name);
        if store.properties.contains_key(&key) {
            return false;
        }
        store.properties.insert(
            key,
            ExtensionProperty {
                kind: Self::property_kind(info),
                getter,
                setter,
            },
        );
        true
    }

    pub(crate) fn register_signal(
        &self,
        class: RawStringName,
        signal: RawStringName,
        args: &[PropertyInfo],
    ) -> bool {
        let mut store = self.store.lock();
        let Some(class) = Self::extension_class_name(&store, class) else {
            return false;
        };
        let Some(name) = store.names.get(&signal.addr()).cloned() else {
            return false;
        };
        let args = args
            .iter()
            .map(|a| {
                let arg = store.names.get(&a.name.addr()).cloned().unwrap_or_default();
                (arg, Self::property_kind(a))
            })
            .collect();
        // A signal name may appear once along the inheritance chain
        let taken = store.class_chain(&class).iter().any(|c| {
            store
                .signals
                .get(c)
                .map_or(false, |list| list.iter().any(|s| s.name == name))
        });
        if taken {
            return false;
        }
        store
            .signals
            .entry(class)
            .or_default()
            .push(ExtensionSignal { name, args });
        true
    }

    pub(crate) fn register_constant(
        &self,
        class: RawStringName,
        enum_name: RawStringName,
        constant: RawStringName,
        value: i64,
        is_bitfield: bool,
    ) -> bool {
        let mut store = self.store.lock();
        let Some(class) = Self::extension_class_name(&store, class) else {
            return false;
        };
        let Some(name) = store.names.get(&constant.addr()).cloned() else {
            return false;
        };
        let enum_name = store
            .names
            .get(&enum_name.addr())
            .filter(|n| !n.is_empty())
            .cloned();
        let key = (class, name);
        if store.constants.contains_key(&key) {
            return false;
        }
        store.constants.insert(
            key,
            ExtensionConstant {
                enum_name,
                value,
                is_bitfield,
            },
        );
        true
    }

    /// Method registered by an extension class
    pub fn extension_method(&self, class: &str, method: &str) -> Option<ExtensionMethod> {
        self.store
            .lock()
            .ext_methods
            .get(&(class.to_string(), method.to_string()))
            .cloned()
    }

    /// Property registered by an extension class
    pub fn extension_property(&self, class: &str, property: &str) -> Option<ExtensionProperty> {
        self.store
            .lock()
            .properties
            .get(&(class.to_string(), property.to_string()))
            .cloned()
    }

    /// Signals registered by an extension class, in registration order
    pub fn extension_signals(&self, class: &str) -> Vec<ExtensionSignal> {
        self.store
            .lock()
            .signals
            .get(class)
            .cloned()
            .unwrap_or_default()
    }

    /// Integer constant registered by an extension class
    pub fn extension_constant(&self, class: &str, constant: &str) -> Option<ExtensionConstant> {
        self.store
            .lock()
            .constants
            .get(&(class.to_string(), constant.to_string()))
            .cloned()
    }

    /// Method and instance behind an engine-side call on `object`
    fn resolve_method(
        &self,
        object: RawObject,
        method: &str,
    ) -> Result<(ExtensionMethod, RawInstance), CallError> {
        let store = self.store.lock();
        let Some(record) = store.objects.get(&object.addr()) else {
            return Err(CallError::new(CallErrorKind::InstanceIsNull, 0, 0));
        };
        let Some(instance) = record.instance else {
            return Err(CallError::new(CallErrorKind::InvalidMethod, 0, 0));
        };
        match store.find_ext_method(&record.class, method) {
            Some(found) => Ok((found, RawInstance::from_addr(instance))),
            None => Err(CallError::new(CallErrorKind::InvalidMethod, 0, 0)),
        }
    }

    /// Call a registered method with variant arguments, the way scripts
    /// do. Arguments stay owned by the caller; the returned variant is the
    /// caller's to destroy.
    pub fn call_method(
        &self,
        object: RawObject,
        method: &str,
        args: &[RawVariant],
    ) -> (RawVariant, CallError) {
        let (found, instance) = match self.resolve_method(object, method) {
            Ok(found) => found,
            Err(err) => return (RawVariant::NIL, err),
        };
        let Some(call) = found.call else {
            return (
                RawVariant::NIL,
                CallError::new(CallErrorKind::InvalidMethod, 0, 0),
            );
        };
        let ptrs: Vec<*const RawVariant> = args.iter().map(|a| a as *const RawVariant).collect();
        let mut ret = RawVariant::NIL;
        let mut err = CallError::OK;
        // SAFETY: callback and userdata registered together by the extension
        unsafe {
            call(
                found.userdata as *mut c_void,
                instance,
                ptrs.as_ptr(),
                ptrs.len() as i64,
                &mut ret,
                &mut err,
            )
        };
        (ret, err)
    }

    /// Start an engine-side ptrcall of a registered method
    pub fn call_method_ptr(&self, object: RawObject, method: &str) -> VirtualCall<'_> {
        VirtualCall::new(self, object, method, CallTarget::Method)
    }

    pub(crate) fn dispatch_method(
        &self,
        object: RawObject,
        method: &str,
        args: RawArgs,
        ret: RawRet,
    ) -> VirtualOutcome {
        let (found, instance) = match self.resolve_method(object, method) {
            Ok(found) => found,
            Err(err) if err.kind() == Some(CallErrorKind::InstanceIsNull) => {
                return VirtualOutcome::NotAnInstance
            }
            Err(_) => return VirtualOutcome::Default,
        };
        let Some(ptrcall) = found.ptrcall else {
            return VirtualOutcome::Default;
        };
        // SAFETY: callback and userdata registered together by the extension
        unsafe { ptrcall(found.userdata as *mut c_void, instance, args, ret) };
        VirtualOutcome::Overridden
    }

    fn find_property(&self, object: RawObject, property: &str) -> Option<ExtensionProperty> {
        let store = self.store.lock();
        let class = store.objects.get(&object.addr())?.class.clone();
        store
            .class_chain(&class)
            .into_iter()
            .find_map(|c| store.properties.get(&(c, property.to_string())).cloned())
    }

    /// Read a property through its getter
    pub fn get_property(&self, object: RawObject, property: &str) -> (RawVariant, CallError) {
        match self.find_property(object, property) {
            Some(found) => self.call_method(object, &found.getter, &[]),
            None => (
                RawVariant::NIL,
                CallError::new(CallErrorKind::InvalidMethod, 0, 0),
            ),
        }
    }

    /// Write a property through its setter. `value` stays owned by the
    /// caller.
    pub fn set_property(&self, object: RawObject, property: &str, value: RawVariant) -> CallError {
        let setter = match self.find_property(object, property) {
            Some(found) if !found.setter.is_empty() => found.setter,
            _ => return CallError::new(CallErrorKind::InvalidMethod, 0, 0),
        };
        let (mut ret, err) = self.call_method(object, &setter, &[value]);
        self.destroy_variant(&mut ret);
        err
    }

    // ========================================================================
    // Custom callables
    // ========================================================================

    pub(crate) fn create_callable(&self, info: &CallableCustomInfo) -> RawVariant {
        let mut store = self.store.lock();
        let Some(name) = store.names.get(&info.name.addr()).cloned() else {
            return RawVariant::NIL;
        };
        let id = store.next_id();
        store.callables.insert(
            id,
            CallableRecord {
                name,
                userdata: info.callable_userdata as usize,
                call: info.call,
                is_valid: info.is_valid,
                free: info.free,
                refs: 1,
            },
        );
        RawVariant::new(VariantType::Callable, [id, info.name.addr() as u64])
    }

    fn callable_record(&self, callable: &RawVariant) -> Option<CallableRecord> {
        if callable.variant_type() != Some(VariantType::Callable) {
            return None;
        }
        self.store.lock().callables.get(&callable.payload[0]).cloned()
    }

    /// Invoke a custom callable the way the engine would. Arguments stay
    /// owned by the caller; the returned variant is the caller's to destroy.
    pub fn call_callable(
        &self,
        callable: &RawVariant,
        args: &[RawVariant],
    ) -> (RawVariant, CallError) {
        let record = self.callable_record(callable);
        let Some((call, record)) = record.and_then(|r| Some((r.call?, r))) else {
            return (
                RawVariant::NIL,
                CallError::new(CallErrorKind::InvalidMethod, 0, 0),
            );
        };
        let ptrs: Vec<*const RawVariant> = args.iter().map(|a| a as *const RawVariant).collect();
        let mut ret = RawVariant::NIL;
        let mut err = CallError::OK;
        // SAFETY: callback and userdata registered together by the extension
        unsafe {
            call(
                record.userdata as *mut c_void,
                ptrs.as_ptr(),
                ptrs.len() as i64,
                &mut ret,
                &mut err,
            )
        };
        (ret, err)
    }

    /// Whether a custom callable reports itself callable; false once freed
    pub fn callable_is_valid(&self, callable: &RawVariant) -> bool {
        match self.callable_record(callable) {
            // SAFETY: callback and userdata registered together by the extension
            Some(record) => record
                .is_valid
                .map_or(true, |f| unsafe { f(record.userdata as *mut c_void) }),
            None => false,
        }
    }

    /// Name a custom callable was created with
    pub fn callable_name(&self, callable: &RawVariant) -> Option<String> {
        self.callable_record(callable).map(|r| r.name)
    }

    /// Custom callables with at least one live reference
    pub fn live_callables(&self) -> usize {
        self.store.lock().callables.len()
    }

    /// Extension classes in registration order
    pub fn registered_classes(&self) -> Vec<String> {
        self.store.lock().registered.clone()
    }

    /// Extension classes in unregistration order
    pub fn unregistered_classes(&self) -> Vec<String> {
        self.store.lock().unregistered.clone()
    }

    /// Calls to `classdb_register_extension_class`, accepted or not
    pub fn registration_calls(&self) -> usize {
        self.counters.registration_calls.load(Ordering::SeqCst)
    }

    /// Start an engine-side virtual call on an extension instance
    pub fn call_virtual(&self, object: RawObject, method: &str) -> VirtualCall<'_> {
        VirtualCall::new(self, object, method, CallTarget::Virtual)
    }

    pub(crate) fn dispatch_virtual(
        &self,
        object: RawObject,
        method: &str,
        args: RawArgs,
        ret: RawRet,
    ) -> VirtualOutcome {
        let (info, instance, name, cached) = {
            let mut store = self.store.lock();
            let Some(record) = store.objects.get(&object.addr()) else {
                return VirtualOutcome::NotAnInstance;
            };
            let (Some(info), Some(instance)) = (record.extension, record.instance) else {
                return VirtualOutcome::NotAnInstance;
            };
            let cached = record.virtuals.get(method).copied();
            let name = store.intern(method);
            (info.0, instance, RawStringName::from_addr(name), cached)
        };
        let (Some(lookup), Some(call)) = (info.get_virtual_call_data, info.call_virtual_with_data)
        else {
            return VirtualOutcome::Default;
        };
        // Call data is asked for once per object and method, then reused
        let data = match cached {
            Some(data) => data as *mut c_void,
            None => {
                // SAFETY: callback registered by the extension for this class
                let data = unsafe { lookup(info.class_userdata, name) };
                if let Some(record) = self.store.lock().objects.get_mut(&object.addr()) {
                    record.virtuals.insert(method.to_string(), data as usize);
                }
                data
            }
        };
        if data.is_null() {
            return VirtualOutcome::Default;
        }
        // SAFETY: call data came from this class's lookup callback
        unsafe { call(RawInstance::from_addr(instance), name, data, args, ret) };
        VirtualOutcome::Overridden
    }

    /// Engine frames built for virtual calls
    pub fn frames_allocated(&self) -> usize {
        self.counters.frames_allocated.load(Ordering::SeqCst)
    }

    /// Engine frames released after virtual calls
    pub fn frames_freed(&self) -> usize {
        self.counters.frames_freed.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Strings, names, variants
    // ========================================================================

    /// Create a host string
    pub fn new_string(&self, text: &str) -> RawString {
        RawString::from_addr(self.store.lock().new_string(text))
    }

    /// Contents of a live host string
    pub fn string_content(&self, raw: RawString) -> Option<String> {
        self.store.lock().strings.get(&raw.addr()).cloned()
    }

    /// Destroy a host string
    pub fn destroy_string(&self, raw: RawString) {
        self.store.lock().destroy_string(raw.addr());
    }

    /// Intern a name
    pub fn intern(&self, text: &str) -> RawStringName {
        RawStringName::from_addr(self.store.lock().intern(text))
    }

    /// Text of an interned name
    pub fn name_content(&self, raw: RawStringName) -> Option<String> {
        self.store.lock().names.get(&raw.addr()).cloned()
    }

    /// Deep copy a variant
    pub fn copy_variant(&self, value: &RawVariant) -> RawVariant {
        self.with_store(|s| s.copy_variant(value))
    }

    /// Release a variant's resources
    pub fn destroy_variant(&self, value: &mut RawVariant) {
        self.with_store(|s| s.destroy_variant(value))
    }

    /// Run `f` on the store, then free the callables it released once the
    /// lock is dropped
    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        let (result, frees) = {
            let mut store = self.store.lock();
            let result = f(&mut store);
            (result, std::mem::take(&mut store.pending_frees))
        };
        for (free, userdata) in frees {
            // SAFETY: the extension handed out userdata with this free
            unsafe { free(userdata as *mut c_void) };
        }
        result
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    /// Successful `ref_reference` calls
    pub fn ref_increments(&self) -> usize {
        self.counters.ref_increments.load(Ordering::SeqCst)
    }

    /// `ref_unreference` calls on refcounted objects
    pub fn ref_decrements(&self) -> usize {
        self.counters.ref_decrements.load(Ordering::SeqCst)
    }

    /// Ids of destroyed objects, in destruction order
    pub fn destroyed(&self) -> Vec<InstanceId> {
        self.store.lock().destroyed.iter().map(|id| InstanceId(*id)).collect()
    }

    /// Frees and unreferences of handles the host does not know about
    pub fn invalid_frees(&self) -> usize {
        self.store.lock().invalid_frees
    }

    /// Unreference calls on objects whose count was already zero
    pub fn over_releases(&self) -> usize {
        self.store.lock().over_releases
    }

    /// Live objects
    pub fn live_objects(&self) -> usize {
        self.store.lock().objects.len()
    }

    /// Live host strings
    pub fn live_strings(&self) -> usize {
        self.store.lock().strings.len()
    }

    /// Live arrays, dictionaries and packed arrays
    pub fn live_containers(&self) -> usize {
        let store = self.store.lock();
        store.arrays.len() + store.dictionaries.len() + store.packed.len()
    }

    /// Live `mem_alloc` blocks
    pub fn live_allocations(&self) -> usize {
        self.store.lock().allocations.len()
    }
}
