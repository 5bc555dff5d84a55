//! Runtime lifecycle
//!
//! A [`Runtime`] owns every component and hands each one its dependencies
//! explicitly; nothing below this module looks the host up globally.
//!
//! The host loads the library through the symbol generated by
//! [`tether_entry!`](crate::tether_entry). That entry point builds the
//! runtime, installs it in the process-wide slot, runs the extension's
//! setup function (which usually queues classes) and then forwards the
//! host's initialization level callbacks to the class registrar. Leaving the
//! `Core` level shuts the runtime down.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use tether_sys::{
    ExtensionInitialization, HostInterface, InitializationLevel, RawObject,
};

use crate::callable::{self, CallableHandle};
use crate::config::RuntimeConfig;
use crate::dispatch::{panic_message, DispatchError, VirtualCallData};
use crate::error::{
    fatal, AbiViolation, ConversionError, ConversionResult, OwnershipError, RegistrationError,
    RuntimeError, VarcallError,
};
use crate::frame::{Frame, PtrArg, PtrCall, Receiver};
use crate::handle::{Class, HandleRegistry, ManagedHandle, Ownership};
use crate::host::HostApi;
use crate::logging::init_logging;
use crate::method_bind::{MethodBindTable, MethodSpec, ReturnOwnership};
use crate::name::NameInterner;
use crate::registrar::{ClassDescriptor, ClassRegistrar};
use crate::variant::bridge::VariantBridge;
use crate::variant::Variant;

// ============================================================================
// Statistics
// ============================================================================

/// Runtime counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct RuntimeStats {
    frames_allocated: AtomicU64,
    frames_freed: AtomicU64,
    binds_resolved: AtomicU64,
    virtual_calls: AtomicU64,
    virtual_failures: AtomicU64,
    method_calls: AtomicU64,
    method_failures: AtomicU64,
    varcalls: AtomicU64,
}

/// Point-in-time copy of [`RuntimeStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Call frames taken
    pub frames_allocated: u64,
    /// Call frames released
    pub frames_freed: u64,
    /// Method binds asked of the host
    pub binds_resolved: u64,
    /// Virtual calls received from the host
    pub virtual_calls: u64,
    /// Virtual calls that returned a default value instead
    pub virtual_failures: u64,
    /// Calls into registered extension methods, both call paths
    pub method_calls: u64,
    /// Registered method calls that failed inside the extension
    pub method_failures: u64,
    /// Variant calls made into the engine
    pub varcalls: u64,
}

impl StatsSnapshot {
    /// Frames taken but not yet released
    pub fn frames_outstanding(&self) -> u64 {
        self.frames_allocated.saturating_sub(self.frames_freed)
    }
}

impl RuntimeStats {
    pub(crate) fn record_frame_allocated(&self) {
        self.frames_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_freed(&self) {
        self.frames_freed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bind_resolved(&self) {
        self.binds_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_virtual_call(&self) {
        self.virtual_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_virtual_failure(&self) {
        self.virtual_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_method_call(&self) {
        self.method_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_method_failure(&self) {
        self.method_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_varcall(&self) {
        self.varcalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_allocated: self.frames_allocated.load(Ordering::Relaxed),
            frames_freed: self.frames_freed.load(Ordering::Relaxed),
            binds_resolved: self.binds_resolved.load(Ordering::Relaxed),
            virtual_calls: self.virtual_calls.load(Ordering::Relaxed),
            virtual_failures: self.virtual_failures.load(Ordering::Relaxed),
            method_calls: self.method_calls.load(Ordering::Relaxed),
            method_failures: self.method_failures.load(Ordering::Relaxed),
            varcalls: self.varcalls.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// `Object.emit_signal`: vararg, the signal name first
pub const EMIT_SIGNAL: MethodSpec = MethodSpec::new("Object", "emit_signal", 4047867050);

/// Binding runtime for one loaded extension
pub struct Runtime {
    this: Weak<Runtime>,
    host: Arc<HostApi>,
    names: Arc<NameInterner>,
    handles: Arc<HandleRegistry>,
    bridge: VariantBridge,
    binds: MethodBindTable,
    classes: ClassRegistrar,
    config: RuntimeConfig,
    stats: Arc<RuntimeStats>,
}

impl Runtime {
    /// Validate the host table and build every component
    pub fn new(
        interface: &HostInterface,
        library: *mut c_void,
        config: RuntimeConfig,
    ) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;
        let host = Arc::new(HostApi::new(*interface, library)?);
        let names = Arc::new(NameInterner::new());
        let stats = Arc::new(RuntimeStats::default());
        let handles = Arc::new(HandleRegistry::new(Arc::clone(&host), Arc::clone(&names)));

        let rt = Arc::new_cyclic(|weak| Runtime {
            this: weak.clone(),
            bridge: VariantBridge::new(Arc::clone(&host), Arc::clone(&names)),
            binds: MethodBindTable::new(Arc::clone(&host), Arc::clone(&names), Arc::clone(&stats)),
            classes: ClassRegistrar::new(Arc::clone(&host), Arc::clone(&names), weak.clone()),
            host,
            names,
            handles,
            config,
            stats,
        });
        log::debug!("runtime created against host {:?}", rt.host.version());
        Ok(rt)
    }

    /// Host function table
    pub fn host(&self) -> &HostApi {
        &self.host
    }

    pub(crate) fn host_arc(&self) -> Arc<HostApi> {
        Arc::clone(&self.host)
    }

    /// Name interner
    pub fn names(&self) -> &NameInterner {
        &self.names
    }

    /// Handle registry
    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    /// Variant bridge
    pub fn bridge(&self) -> &VariantBridge {
        &self.bridge
    }

    /// Method bind table
    pub fn binds(&self) -> &MethodBindTable {
        &self.binds
    }

    /// Class registrar
    pub fn classes(&self) -> &ClassRegistrar {
        &self.classes
    }

    /// Active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Counters
    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Take a frame for a call with `arity` arguments
    pub fn new_frame(&self, arity: usize) -> Frame<'_> {
        Frame::new(self, arity)
    }

    /// Resolve, encode, invoke and decode one method call. The frame is
    /// released before this returns.
    ///
    /// # Safety
    /// `args` and `R` must match the native signature of `spec`.
    pub unsafe fn call<R: PtrCall, V: Receiver + ?Sized>(
        &self,
        spec: &MethodSpec,
        receiver: &V,
        args: &[&dyn PtrArg],
    ) -> ConversionResult<R> {
        let bind = self.binds.resolve_spec(spec);
        let mut frame = self.new_frame(args.len());
        for (index, arg) in args.iter().enumerate() {
            frame.write_arg(index, *arg);
        }
        frame.invoke(bind, receiver);
        frame.read_result()
    }

    /// Like [`Runtime::call`] for methods returning an object, attaching the
    /// ownership recorded in `spec`.
    ///
    /// Borrowed results cannot leave the call; use [`Runtime::new_frame`] and
    /// [`Frame::read_object`] to work with them inside the frame.
    ///
    /// # Safety
    /// `args` must match the native signature of `spec`.
    pub unsafe fn call_object<C: Class, V: Receiver + ?Sized>(
        &self,
        spec: &MethodSpec,
        receiver: &V,
        args: &[&dyn PtrArg],
    ) -> Result<Option<ManagedHandle<'static, C>>, OwnershipError> {
        let ownership = match spec.returns {
            ReturnOwnership::Object(ownership) => ownership,
            ReturnOwnership::Value => {
                fatal(AbiViolation::ResultState("object read from a value method"))
            }
        };
        let raw = self
            .call::<RawObject, V>(spec, receiver, args)
            .unwrap_or(RawObject::NULL);
        if raw.is_null() {
            return Ok(None);
        }
        match ownership {
            Ownership::Borrowed => Err(OwnershipError::BorrowEscapes { addr: raw.addr() }),
            owned => self.handles.acquire(raw, owned).map(Some),
        }
    }

    /// Call a method with variant arguments. The host checks the arguments
    /// against the method, so unlike [`Runtime::call`] a mismatch is an
    /// error rather than undefined behavior. Vararg methods can only be
    /// called this way.
    pub fn varcall<V: Receiver + ?Sized>(
        &self,
        spec: &MethodSpec,
        receiver: &V,
        args: &[Variant],
    ) -> Result<Variant, VarcallError> {
        let bind = self.binds.resolve_spec(spec);
        if self.config.assert_instance_ids {
            if let Err(OwnershipError::Freed { id }) = receiver.check_receiver() {
                fatal(AbiViolation::UseAfterFree { id });
            }
        }
        let mut raw: Vec<_> = args.iter().map(|arg| self.bridge.to_raw(arg)).collect();
        let ptrs: Vec<_> = raw.iter().map(|r| r as *const _).collect();
        self.stats.record_varcall();
        // SAFETY: every pointer refers to a live element of `raw`
        let (mut ret, error) = unsafe { self.host.varcall(bind.raw(), receiver.receiver(), &ptrs) };
        for temporary in &mut raw {
            self.bridge.destroy(temporary);
        }
        if !error.is_ok() {
            self.bridge.destroy(&mut ret);
            log::debug!("{}::{} refused a variant call: {:?}", spec.class, spec.method, error);
            return Err(VarcallError::Rejected(error));
        }
        Ok(self.bridge.from_raw_owned(ret)?)
    }

    /// Emit `signal` on `receiver` with `args`
    pub fn emit_signal<V: Receiver + ?Sized>(
        &self,
        receiver: &V,
        signal: &str,
        args: &[Variant],
    ) -> Result<(), VarcallError> {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(Variant::StringName(self.names.intern(signal)));
        all.extend_from_slice(args);
        self.varcall(&EMIT_SIGNAL, receiver, &all).map(drop)
    }

    /// Hand a closure to the engine as a callable. The engine keeps it alive
    /// for as long as any copy of the callable exists.
    pub fn create_callable<F>(&self, name: &str, f: F) -> Result<CallableHandle, ConversionError>
    where
        F: Fn(&[Variant]) -> Variant + Send + Sync + 'static,
    {
        callable::create(self, self.this.clone(), name, f)
    }

    /// Engine singleton `name` as an engine-owned handle. `None` when the
    /// host has no such singleton or it is not a `C`.
    pub fn singleton<C: Class>(&self, name: &str) -> Option<ManagedHandle<'static, C>> {
        let raw = self
            .host
            .singleton(self.names.to_raw(&self.names.intern(name), &self.host))?;
        let raw = self
            .host
            .cast_to(raw, self.names.to_raw(&self.names.intern(C::NAME), &self.host))?;
        match self.handles.acquire(raw, Ownership::EngineOwned) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("singleton '{}': {}", name, e);
                None
            }
        }
    }

    /// Register a class with the engine now
    pub fn register_class<T: Send + 'static>(&self, desc: ClassDescriptor<T>) -> Result<(), RegistrationError> {
        self.classes.register(desc)
    }

    /// Register a class when the host reaches its initialization level
    pub fn queue_class<T: Send + 'static>(&self, desc: ClassDescriptor<T>) {
        self.classes.queue(desc)
    }

    /// Call data for an override, or `None` for the engine's default
    pub fn lookup_override(&self, class: &str, method: &str) -> Option<VirtualCallData> {
        self.classes.lookup_override(class, method)
    }

    /// Run `f` on the Rust state of an extension object
    pub fn with_instance<T: 'static, R>(
        &self,
        object: RawObject,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, DispatchError> {
        self.classes.with_instance(object, f)
    }

    /// Unregister every class and report leaked handles
    pub fn shutdown(&self) {
        self.classes.unregister_all();
        if self.config.track_handles {
            let leaked = self.handles.report_outstanding();
            if leaked > 0 {
                log::warn!("{} handles still outstanding at shutdown", leaked);
            }
        }
        let stats = self.stats.snapshot();
        if stats.frames_outstanding() > 0 {
            log::warn!("{} call frames still outstanding at shutdown", stats.frames_outstanding());
        }
        log::debug!("runtime shut down: {:?}", stats);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("host", &self.host.version())
            .field("binds", &self.binds.len())
            .field("classes", &self.classes.registered())
            .finish()
    }
}

// ============================================================================
// Process-wide slot
// ============================================================================

static RUNTIME: Lazy<RwLock<Option<Arc<Runtime>>>> = Lazy::new(|| RwLock::new(None));

/// Make `rt` the process-wide runtime. Only one may be installed at a time.
pub fn install(rt: Arc<Runtime>) -> Result<(), RuntimeError> {
    let mut slot = RUNTIME.write();
    if slot.is_some() {
        return Err(RuntimeError::AlreadyInitialized);
    }
    *slot = Some(rt);
    Ok(())
}

/// The process-wide runtime
pub fn get() -> Result<Arc<Runtime>, RuntimeError> {
    try_get().ok_or(RuntimeError::NotInitialized)
}

/// The process-wide runtime, if one is installed
pub fn try_get() -> Option<Arc<Runtime>> {
    RUNTIME.read().clone()
}

/// Shut down and remove the process-wide runtime
pub fn shutdown() -> Result<(), RuntimeError> {
    let rt = RUNTIME.write().take().ok_or(RuntimeError::NotInitialized)?;
    rt.shutdown();
    Ok(())
}

// ============================================================================
// Library entry
// ============================================================================

/// Extension setup run once at library load, typically queueing classes
pub type SetupFn = fn(&Arc<Runtime>) -> Result<(), RuntimeError>;

/// Body of the symbol generated by [`tether_entry!`](crate::tether_entry).
///
/// Returns false when the extension cannot run against this host; the host
/// then unloads the library without calling back.
///
/// # Safety
/// `interface` and `init` must be null or valid for the duration of the call.
pub unsafe fn entry_point(
    interface: *const HostInterface,
    library: *mut c_void,
    init: *mut ExtensionInitialization,
    setup: SetupFn,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| start(interface, library, init, setup))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::error!("extension failed to load: {}", e);
            false
        }
        Err(payload) => {
            log::error!("extension setup panicked: {}", panic_message(&*payload));
            false
        }
    }
}

unsafe fn start(
    interface: *const HostInterface,
    library: *mut c_void,
    init: *mut ExtensionInitialization,
    setup: SetupFn,
) -> Result<(), RuntimeError> {
    if interface.is_null() || init.is_null() {
        return Err(RuntimeError::NullInterface);
    }
    let config = RuntimeConfig::from_env()?;
    init_logging(config.log_filter.as_deref());

    let rt = Runtime::new(&*interface, library, config)?;
    install(Arc::clone(&rt))?;
    if let Err(e) = setup(&rt) {
        let _ = shutdown();
        return Err(e);
    }

    *init = ExtensionInitialization {
        minimum_level: InitializationLevel::Core,
        userdata: std::ptr::null_mut(),
        initialize: Some(initialize_level),
        deinitialize: Some(deinitialize_level),
    };
    log::debug!("extension loaded, {} classes queued", rt.classes().pending().len());
    Ok(())
}

unsafe extern "C" fn initialize_level(_userdata: *mut c_void, level: InitializationLevel) {
    let outcome = catch_unwind(|| {
        let Some(rt) = try_get() else {
            log::error!("initialize {:?} without a runtime", level);
            return;
        };
        if let Err(e) = rt.classes().initialize_level(level) {
            log::error!("initialization level {:?} failed: {}", level, e);
        }
    });
    if let Err(payload) = outcome {
        log::error!("initialize {:?} panicked: {}", level, panic_message(&*payload));
    }
}

unsafe extern "C" fn deinitialize_level(_userdata: *mut c_void, level: InitializationLevel) {
    let outcome = catch_unwind(|| {
        if let Some(rt) = try_get() {
            rt.classes().deinitialize_level(level);
        }
        if level == InitializationLevel::Core {
            if let Err(e) = shutdown() {
                log::warn!("deinitialize: {}", e);
            }
        }
    });
    if let Err(payload) = outcome {
        log::error!("deinitialize {:?} panicked: {}", level, panic_message(&*payload));
    }
}

/// Export the library entry symbol the host looks up.
///
/// ```ignore
/// fn setup(rt: &Arc<Runtime>) -> Result<(), RuntimeError> {
///     rt.queue_class(ClassDescriptor::<Player>::of());
///     Ok(())
/// }
///
/// tether_entry!(my_extension_init, setup);
/// ```
#[macro_export]
macro_rules! tether_entry {
    ($symbol:ident, $setup:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $symbol(
            interface: *const $crate::sys::HostInterface,
            library: *mut ::std::ffi::c_void,
            init: *mut $crate::sys::ExtensionInitialization,
        ) -> bool {
            $crate::runtime::entry_point(interface, library, init, $setup)
        }
    };
}
