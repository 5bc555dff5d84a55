//! Class Registrar
//!
//! Registers Rust classes with the engine's class database. Each class gets
//! a [`ClassBinding`] that lives at a stable address for as long as the
//! engine may call back into it; its address is the class userdata the
//! engine passes to every callback.
//!
//! Registration is rejected before reaching the host when the name is
//! already registered by this runtime, so the engine never sees a class
//! twice. Registrations are serialized, and no class map guard is held
//! while the host runs, so host callbacks may query the registrar.
//!
//! Methods, properties, signals and integer constants declared on the
//! descriptor are registered right after the class is accepted.
//!
//! Classes can also be queued with an initialization level and are then
//! registered when the host reaches that level, and unregistered in
//! reverse order when it goes back down.

use std::any::TypeId;
use std::cell::RefCell;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};

use tether_sys::{
    ClassCreationInfo, InitializationLevel, MethodFlags, RawInstance, RawObject, RawStringName,
};

use crate::dispatch::{
    call_virtual_with_data, get_virtual_call_data, panic_message, DispatchError, DispatchMap,
    InstanceStorage, MethodArgs, VirtualCallData, VirtualTable,
};
use crate::error::RegistrationError;
use crate::frame::PtrCall;
use crate::host::HostApi;
use crate::members::{register_methods, MethodEntry, Members};
use crate::name::{NameInterner, StringName};
use crate::runtime::Runtime;
use crate::variant::{ObjectRef, ToVariant, VariantKind};

/// Convenience description of an extension class
pub trait ExtensionClass: Sized + Send + 'static {
    /// Class name in the engine
    const CLASS: &'static str;
    /// Engine parent class
    const PARENT: &'static str;
    /// Level at which the class registers when queued
    const LEVEL: InitializationLevel = InitializationLevel::Scene;

    /// Build the Rust state for a freshly constructed engine object
    fn create(base: ObjectRef) -> Self;

    /// Overrides of engine virtual methods
    fn virtuals(table: VirtualTable<Self>) -> VirtualTable<Self> {
        table
    }

    /// Methods, properties, signals and constants
    fn members(desc: ClassDescriptor<Self>) -> ClassDescriptor<Self> {
        desc
    }
}

type Factory<T> = Box<dyn Fn(ObjectRef) -> T + Send + Sync>;

/// Everything needed to register one class
pub struct ClassDescriptor<T> {
    name: String,
    parent: String,
    level: InitializationLevel,
    is_abstract: bool,
    factory: Factory<T>,
    virtuals: VirtualTable<T>,
    members: Members<T>,
}

impl<T: Send + 'static> ClassDescriptor<T> {
    /// Class `name` deriving from `parent`, constructed by `factory`
    pub fn new<F>(name: impl Into<String>, parent: impl Into<String>, factory: F) -> Self
    where
        F: Fn(ObjectRef) -> T + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            parent: parent.into(),
            level: InitializationLevel::Scene,
            is_abstract: false,
            factory: Box::new(factory),
            virtuals: VirtualTable::new(),
            members: Members::default(),
        }
    }

    /// Initialization level for queued registration
    pub fn level(mut self, level: InitializationLevel) -> Self {
        self.level = level;
        self
    }

    /// Engine refuses to instantiate the class
    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Virtual method overrides
    pub fn virtuals(mut self, table: VirtualTable<T>) -> Self {
        self.virtuals = table;
        self
    }

    /// Method the engine and scripts can call. `A` is the argument tuple,
    /// e.g. `(i64, String)`; `arg_names` names the arguments for the editor.
    /// A later method with the same name replaces the earlier one.
    pub fn method<A, R, F>(mut self, name: &str, arg_names: &[&str], f: F) -> Self
    where
        A: MethodArgs + 'static,
        R: PtrCall + ToVariant + Default + 'static,
        F: Fn(&mut T, A) -> R + Send + Sync + 'static,
    {
        self.members
            .add_method(MethodEntry::new(name, arg_names, MethodFlags::NORMAL, f));
        self
    }

    /// Method that only reads the instance
    pub fn const_method<A, R, F>(mut self, name: &str, arg_names: &[&str], f: F) -> Self
    where
        A: MethodArgs + 'static,
        R: PtrCall + ToVariant + Default + 'static,
        F: Fn(&T, A) -> R + Send + Sync + 'static,
    {
        let flags = MethodFlags::NORMAL | MethodFlags::CONST;
        self.members.add_method(MethodEntry::new(
            name,
            arg_names,
            flags,
            move |this: &mut T, args: A| f(this, args),
        ));
        self
    }

    /// Property read through `getter` and written through `setter`, both
    /// declared with [`ClassDescriptor::method`]. Without a setter the
    /// property is read-only. Its type is the getter's return type.
    pub fn property(mut self, name: &str, getter: &str, setter: Option<&str>) -> Self {
        self.members.add_property(name, getter, setter);
        self
    }

    /// Signal with named, typed arguments
    pub fn signal(mut self, name: &str, args: &[(&str, VariantKind)]) -> Self {
        self.members.add_signal(name, args);
        self
    }

    /// Integer constant outside any enum
    pub fn constant(mut self, name: &str, value: i64) -> Self {
        self.members.add_constant(None, name, value, false);
        self
    }

    /// Integer constant grouped under `enum_name`
    pub fn enum_constant(mut self, enum_name: &str, name: &str, value: i64) -> Self {
        self.members.add_constant(Some(enum_name), name, value, false);
        self
    }

    /// Flag of a bitfield enum
    pub fn bitfield_flag(mut self, enum_name: &str, name: &str, value: i64) -> Self {
        self.members.add_constant(Some(enum_name), name, value, true);
        self
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared method names
    pub fn method_names(&self) -> Vec<&str> {
        self.members.method_names().collect()
    }

    /// Parent class name
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Initialization level
    pub fn init_level(&self) -> InitializationLevel {
        self.level
    }
}

impl<T: ExtensionClass> ClassDescriptor<T> {
    /// Descriptor built from the class's [`ExtensionClass`] impl
    pub fn of() -> Self {
        let desc = Self::new(T::CLASS, T::PARENT, T::create)
            .level(T::LEVEL)
            .virtuals(T::virtuals(VirtualTable::new()));
        T::members(desc)
    }
}

// ============================================================================
// Per-class binding
// ============================================================================

pub(crate) struct ClassBinding<T> {
    rt: Weak<Runtime>,
    name: StringName,
    parent: StringName,
    factory: Factory<T>,
    virtuals: DispatchMap<T>,
    methods: Vec<Box<MethodEntry<T>>>,
    live: AtomicUsize,
}

impl<T: Send + 'static> ClassBinding<T> {
    pub(crate) fn lookup(&self, name: &StringName) -> Option<VirtualCallData> {
        self.virtuals.get(name).map(|entry| VirtualCallData::of(entry))
    }

    pub(crate) fn lookup_raw(&self, name: RawStringName) -> Option<VirtualCallData> {
        let rt = self.rt.upgrade()?;
        let name = rt.names().from_raw(name, rt.host());
        self.lookup(&name)
    }

    fn instantiate(&self) -> Result<RawObject, RegistrationError> {
        let rt = self.rt.upgrade().ok_or(RegistrationError::RuntimeGone)?;
        let host = rt.host();
        let names = rt.names();
        let failed = || RegistrationError::ConstructionFailed(self.name.to_string());

        let base = host
            .construct(names.to_raw(&self.parent, host))
            .ok_or_else(failed)?;
        let id = host.instance_id(base);
        let value = match catch_unwind(AssertUnwindSafe(|| (self.factory)(ObjectRef { raw: base, id }))) {
            Ok(value) => value,
            Err(payload) => {
                log::error!("constructor of {} panicked: {}", self.name, panic_message(&*payload));
                host.object_destroy(base);
                return Err(failed());
            }
        };

        let storage = Box::into_raw(Box::new(InstanceStorage {
            rt: self.rt.clone(),
            base,
            value: ReentrantMutex::new(RefCell::new(value)),
        }));
        host.set_instance(
            base,
            names.to_raw(&self.name, host),
            RawInstance(storage as *mut c_void),
        );
        rt.classes()
            .track_instance(base, storage as usize, TypeId::of::<T>());
        self.live.fetch_add(1, Ordering::SeqCst);
        log::trace!("created {} {:?}", self.name, id);
        Ok(base)
    }
}

unsafe extern "C" fn create_instance<T: Send + 'static>(userdata: *mut c_void) -> RawObject {
    let binding = &*(userdata as *const ClassBinding<T>);
    match catch_unwind(AssertUnwindSafe(|| binding.instantiate())) {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            log::error!("{}", e);
            RawObject::NULL
        }
        Err(payload) => {
            log::error!("creating {} panicked: {}", binding.name, panic_message(&*payload));
            RawObject::NULL
        }
    }
}

unsafe extern "C" fn free_instance<T: Send + 'static>(userdata: *mut c_void, instance: RawInstance) {
    let binding = &*(userdata as *const ClassBinding<T>);
    let storage = Box::from_raw(instance.0 as *mut InstanceStorage<T>);
    if let Some(rt) = binding.rt.upgrade() {
        rt.classes().forget_instance(storage.base);
    }
    binding.live.fetch_sub(1, Ordering::SeqCst);
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(storage))) {
        log::error!("destructor of {} panicked: {}", binding.name, panic_message(&*payload));
    }
}

unsafe fn lookup_erased<T: Send + 'static>(binding: usize, name: &StringName) -> Option<VirtualCallData> {
    (*(binding as *const ClassBinding<T>)).lookup(name)
}

unsafe fn live_erased<T>(binding: usize) -> usize {
    (*(binding as *const ClassBinding<T>)).live.load(Ordering::SeqCst)
}

unsafe fn drop_erased<T>(binding: usize) {
    drop(Box::from_raw(binding as *mut ClassBinding<T>));
}

// ============================================================================
// Registrar
// ============================================================================

struct ClassRecord {
    level: InitializationLevel,
    binding: usize,
    lookup: unsafe fn(usize, &StringName) -> Option<VirtualCallData>,
    live: unsafe fn(usize) -> usize,
    drop_binding: unsafe fn(usize),
}

#[derive(Clone, Copy)]
struct InstanceRecord {
    storage: usize,
    type_id: TypeId,
}

type Deferred = Box<dyn FnOnce(&ClassRegistrar) -> Result<(), RegistrationError> + Send>;

struct PendingClass {
    name: String,
    level: InitializationLevel,
    register: Deferred,
}

/// Registered extension classes of one runtime
pub struct ClassRegistrar {
    host: Arc<HostApi>,
    names: Arc<NameInterner>,
    rt: Weak<Runtime>,
    classes: DashMap<StringName, ClassRecord>,
    order: Mutex<Vec<StringName>>,
    pending: Mutex<Vec<PendingClass>>,
    instances: DashMap<usize, InstanceRecord>,
    registering: ReentrantMutex<()>,
}

impl ClassRegistrar {
    pub(crate) fn new(host: Arc<HostApi>, names: Arc<NameInterner>, rt: Weak<Runtime>) -> Self {
        Self {
            host,
            names,
            rt,
            classes: DashMap::new(),
            order: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            instances: DashMap::new(),
            registering: ReentrantMutex::new(()),
        }
    }

    /// Register a class with the engine now.
    ///
    /// A name already registered by this runtime is rejected with
    /// [`RegistrationError::AlreadyRegistered`] and the engine is not asked.
    pub fn register<T: Send + 'static>(&self, desc: ClassDescriptor<T>) -> Result<(), RegistrationError> {
        let name = self.names.intern(&desc.name);
        let parent = self.names.intern(&desc.parent);
        desc.members.validate(&desc.name)?;

        // Held across the host call; the host may call back on this thread
        let _registering = self.registering.lock();
        if self.classes.contains_key(&name) {
            log::warn!("class '{}' is already registered", name);
            return Err(RegistrationError::AlreadyRegistered(desc.name));
        }

        let (methods, declarations) = desc.members.split();
        let binding = Box::into_raw(Box::new(ClassBinding {
            rt: self.rt.clone(),
            name: name.clone(),
            parent: parent.clone(),
            factory: desc.factory,
            virtuals: desc.virtuals.freeze(&self.names),
            methods,
            live: AtomicUsize::new(0),
        }));
        let info = ClassCreationInfo {
            is_virtual: false,
            is_abstract: desc.is_abstract,
            class_userdata: binding as *mut c_void,
            create_instance: Some(create_instance::<T>),
            free_instance: Some(free_instance::<T>),
            get_virtual_call_data: Some(get_virtual_call_data::<T>),
            call_virtual_with_data: Some(call_virtual_with_data::<T>),
        };

        let raw_name = self.names.to_raw(&name, &self.host);
        let raw_parent = self.names.to_raw(&parent, &self.host);
        // SAFETY: the binding stays allocated until the class is unregistered
        let accepted = unsafe { self.host.register_class(raw_name, raw_parent, &info) };
        if !accepted {
            // SAFETY: the host rejected the class and kept no reference to it
            unsafe { drop(Box::from_raw(binding)) };
            log::warn!("host rejected class '{}' (parent '{}')", name, parent);
            return Err(RegistrationError::HostRejected {
                class: desc.name,
                parent: desc.parent,
            });
        }

        self.classes.insert(
            name.clone(),
            ClassRecord {
                level: desc.level,
                binding: binding as usize,
                lookup: lookup_erased::<T>,
                live: live_erased::<T>,
                drop_binding: drop_erased::<T>,
            },
        );
        self.order.lock().push(name.clone());

        // SAFETY: the binding is registered and stays allocated until
        // unregister_name drops it
        let methods = unsafe { &(*binding).methods };
        let members = register_methods(&self.host, &self.names, &name, methods)
            .and_then(|()| declarations.register(&self.host, &self.names, &name, methods));
        if let Err(member) = members {
            log::warn!("host rejected member '{}' of class '{}'", member, name);
            self.unregister_name(&name);
            return Err(RegistrationError::MemberRejected {
                class: desc.name,
                member,
            });
        }
        log::debug!("registered class '{}' extends '{}'", name, parent);
        Ok(())
    }

    /// Register `desc` when the host reaches its initialization level
    pub fn queue<T: Send + 'static>(&self, desc: ClassDescriptor<T>) {
        let name = desc.name.clone();
        let level = desc.level;
        self.pending.lock().push(PendingClass {
            name,
            level,
            register: Box::new(move |registrar| registrar.register(desc)),
        });
    }

    /// Register every queued class of `level`, in queue order. Every class
    /// is attempted; the first failure is returned.
    pub fn initialize_level(&self, level: InitializationLevel) -> Result<(), RegistrationError> {
        let ready: Vec<PendingClass> = {
            let mut pending = self.pending.lock();
            let (ready, rest) = pending.drain(..).partition(|p| p.level == level);
            *pending = rest;
            ready
        };
        let mut first_error = None;
        for class in ready {
            if let Err(e) = (class.register)(self) {
                log::error!("registering '{}' at {:?}: {}", class.name, level, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Unregister the classes registered at `level`, newest first
    pub fn deinitialize_level(&self, level: InitializationLevel) {
        let names: Vec<StringName> = self
            .order
            .lock()
            .iter()
            .rev()
            .filter(|name| self.classes.get(*name).map(|r| r.level) == Some(level))
            .cloned()
            .collect();
        for name in names {
            self.unregister_name(&name);
        }
    }

    /// Unregister one class
    pub fn unregister(&self, class: &str) -> Result<(), RegistrationError> {
        let name = self.names.intern(class);
        if self.unregister_name(&name) {
            Ok(())
        } else {
            Err(RegistrationError::UnknownClass(class.to_string()))
        }
    }

    /// Unregister every class, newest first
    pub fn unregister_all(&self) {
        let names: Vec<StringName> = self.order.lock().iter().rev().cloned().collect();
        for name in names {
            self.unregister_name(&name);
        }
        self.pending.lock().clear();
    }

    fn unregister_name(&self, name: &StringName) -> bool {
        let Some((_, record)) = self.classes.remove(name) else {
            return false;
        };
        self.order.lock().retain(|n| n != name);
        self.host.unregister_class(self.names.to_raw(name, &self.host));

        // SAFETY: record was built for this binding's concrete type
        let live = unsafe { (record.live)(record.binding) };
        if live == 0 {
            // SAFETY: unregistered, and no instance can call back into it
            unsafe { (record.drop_binding)(record.binding) };
        } else {
            log::warn!(
                "class '{}' unregistered with {} live instances; keeping its binding",
                name,
                live
            );
        }
        log::debug!("unregistered class '{}'", name);
        true
    }

    /// Whether this runtime registered `class`
    pub fn is_registered(&self, class: &str) -> bool {
        self.classes.contains_key(&self.names.intern(class))
    }

    /// Registered class names, oldest first
    pub fn registered(&self) -> Vec<String> {
        self.order.lock().iter().map(|n| n.to_string()).collect()
    }

    /// Classes waiting for their initialization level
    pub fn pending(&self) -> Vec<String> {
        self.pending.lock().iter().map(|p| p.name.clone()).collect()
    }

    /// Lowest initialization level among queued classes
    pub fn minimum_level(&self) -> Option<InitializationLevel> {
        self.pending.lock().iter().map(|p| p.level).min()
    }

    /// Call data for `class::method`, or `None` when the class does not
    /// override it and the engine's default should run
    pub fn lookup_override(&self, class: &str, method: &str) -> Option<VirtualCallData> {
        let record = self.classes.get(&self.names.intern(class))?;
        let method = self.names.intern(method);
        // SAFETY: record was built for this binding's concrete type
        unsafe { (record.lookup)(record.binding, &method) }
    }

    /// Construct an instance of a registered class through the engine
    pub fn instantiate(&self, class: &str) -> Result<RawObject, RegistrationError> {
        let name = self.names.intern(class);
        if !self.classes.contains_key(&name) {
            return Err(RegistrationError::UnknownClass(class.to_string()));
        }
        self.host
            .construct(self.names.to_raw(&name, &self.host))
            .ok_or_else(|| RegistrationError::ConstructionFailed(class.to_string()))
    }

    /// Run `f` on the Rust state of an extension object.
    ///
    /// The object must stay alive for the duration of the call.
    pub fn with_instance<T: 'static, R>(
        &self,
        object: RawObject,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, DispatchError> {
        let record = self
            .instances
            .get(&object.addr())
            .map(|r| *r)
            .filter(|r| r.type_id == TypeId::of::<T>())
            .ok_or(DispatchError::NotAnInstance)?;
        // SAFETY: type checked above; the storage lives until free_instance
        let storage = unsafe { &*(record.storage as *const InstanceStorage<T>) };
        storage.with_mut(f)
    }

    /// Live extension instances
    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    pub(crate) fn track_instance(&self, base: RawObject, storage: usize, type_id: TypeId) {
        self.instances
            .insert(base.addr(), InstanceRecord { storage, type_id });
    }

    pub(crate) fn forget_instance(&self, base: RawObject) {
        self.instances.remove(&base.addr());
    }
}

impl Drop for ClassRegistrar {
    fn drop(&mut self) {
        self.unregister_all();
    }
}
