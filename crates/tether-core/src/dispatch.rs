//! Virtual Dispatch Bridge
//!
//! A class's overrides are collected in a [`VirtualTable`] before
//! registration and frozen into a name-keyed map when the class is
//! registered. The engine then asks for call data by name
//! (`get_virtual_call_data`), which is a pointer to the boxed entry or null
//! when the class does not override the method, and later invokes it through
//! `call_virtual_with_data`.
//!
//! Nothing unwinds into the engine. Argument decoding failures, panics in
//! overrides and re-entrant calls on an instance that is already mutably
//! borrowed all write the return type's default value, are logged and are
//! counted in the runtime stats. A call arriving after the runtime is gone
//! gets a zeroed return slot. An ABI violation raised inside an override
//! aborts the process.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Weak;

use parking_lot::ReentrantMutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use tether_sys::{RawArgs, RawInstance, RawObject, RawRet, RawStringName};

use crate::error::{AbiViolation, ConversionError, ConversionResult};
use crate::frame::PtrCall;
use crate::name::{NameInterner, StringName};
use crate::registrar::ClassBinding;
use crate::runtime::Runtime;
use crate::variant::bridge::VariantBridge;
use crate::variant::{FromVariant, Variant, VariantKind};

/// Why a callback into an extension instance did not run
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Object has no extension instance of the requested type
    #[error("object is not an instance of this extension class")]
    NotAnInstance,

    /// Instance is mutably borrowed further up the stack
    #[error("instance is already borrowed by an outer call")]
    Reentrant,

    /// An argument could not be decoded
    #[error("argument conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// The override panicked
    #[error("override panicked: {0}")]
    Panic(String),
}

type Thunk<T> = dyn Fn(&mut T, &VariantBridge, RawArgs, RawRet) -> ConversionResult<()> + Send + Sync;

pub(crate) struct VirtualEntry<T> {
    name: String,
    arity: usize,
    call: Box<Thunk<T>>,
    write_default: unsafe fn(&VariantBridge, RawRet),
    write_zeroed: unsafe fn(RawRet),
}

impl<T: 'static> VirtualEntry<T> {
    pub(crate) fn new<A, R, F>(name: &str, f: F) -> Self
    where
        A: VirtualArgs + 'static,
        R: PtrCall + Default + 'static,
        F: Fn(&mut T, A) -> R + Send + Sync + 'static,
    {
        let call = move |this: &mut T,
                         bridge: &VariantBridge,
                         args: RawArgs,
                         ret: RawRet|
              -> ConversionResult<()> {
            // SAFETY: the engine passes one pointer per declared argument
            let args = unsafe { A::read(bridge, args)? };
            let result = f(this, args);
            // SAFETY: the engine sized the return slot for R
            unsafe { result.write_ret(bridge, ret) };
            Ok(())
        };
        Self {
            name: name.to_string(),
            arity: A::ARITY,
            call: Box::new(call),
            write_default: write_default::<R>,
            write_zeroed: write_zeroed::<R>,
        }
    }
}

impl<T> VirtualEntry<T> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// # Safety
    /// `ret` must be null or a return slot sized for the entry's result.
    pub(crate) unsafe fn write_zeroed(&self, ret: RawRet) {
        (self.write_zeroed)(ret)
    }
}

unsafe fn write_default<R: PtrCall + Default>(bridge: &VariantBridge, ret: RawRet) {
    if !ret.is_null() {
        R::default().write_ret(bridge, ret);
    }
}

unsafe fn write_zeroed<R: PtrCall>(ret: RawRet) {
    if !ret.is_null() {
        R::write_zeroed_ret(ret);
    }
}

// ============================================================================
// Argument tuples
// ============================================================================

/// Argument list of a virtual method, decoded from an engine frame
pub trait VirtualArgs: Sized {
    /// Number of arguments
    const ARITY: usize;

    /// Decode every argument without taking ownership.
    ///
    /// # Safety
    /// `args` must hold `ARITY` pointers to values of the declared types.
    unsafe fn read(bridge: &VariantBridge, args: RawArgs) -> ConversionResult<Self>;
}

impl VirtualArgs for () {
    const ARITY: usize = 0;

    unsafe fn read(_: &VariantBridge, _: RawArgs) -> ConversionResult<Self> {
        Ok(())
    }
}

/// Argument list of a registered method, decoded from a ptrcall frame or
/// from the variants of a variant call
pub trait MethodArgs: VirtualArgs {
    /// Variant kind the engine sees for each argument
    fn kinds() -> Vec<VariantKind>;

    /// Decode exactly `ARITY` variants. The error carries the index of the
    /// argument that failed.
    fn from_variants(args: &[Variant]) -> Result<Self, (usize, ConversionError)>;
}

impl MethodArgs for () {
    fn kinds() -> Vec<VariantKind> {
        Vec::new()
    }

    fn from_variants(_: &[Variant]) -> Result<Self, (usize, ConversionError)> {
        Ok(())
    }
}

macro_rules! virtual_args {
    ($arity:expr; $($ty:ident : $index:tt),+) => {
        impl<$($ty: PtrCall),+> VirtualArgs for ($($ty,)+) {
            const ARITY: usize = $arity;

            unsafe fn read(bridge: &VariantBridge, args: RawArgs) -> ConversionResult<Self> {
                Ok(($(
                    <$ty as PtrCall>::read_arg(bridge, *args.add($index))
                        .map_err(|e| e.at_index($index))?,
                )+))
            }
        }

        impl<$($ty: PtrCall + FromVariant),+> MethodArgs for ($($ty,)+) {
            fn kinds() -> Vec<VariantKind> {
                vec![$(<$ty as PtrCall>::KIND),+]
            }

            fn from_variants(args: &[Variant]) -> Result<Self, (usize, ConversionError)> {
                Ok(($(
                    <$ty as FromVariant>::from_variant(&args[$index]).map_err(|e| ($index, e))?,
                )+))
            }
        }
    };
}

virtual_args!(1; A: 0);
virtual_args!(2; A: 0, B: 1);
virtual_args!(3; A: 0, B: 1, C: 2);
virtual_args!(4; A: 0, B: 1, C: 2, D: 3);
virtual_args!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
virtual_args!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
virtual_args!(7; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
virtual_args!(8; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
virtual_args!(9; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8);
virtual_args!(10; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9);
virtual_args!(11; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10);
virtual_args!(12; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11);
virtual_args!(13; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12);
virtual_args!(14; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13);
virtual_args!(15; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13, O: 14);
virtual_args!(16; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13, O: 14, P: 15);

// ============================================================================
// Tables
// ============================================================================

/// Overrides of one extension class, keyed by engine method name
pub struct VirtualTable<T> {
    entries: Vec<VirtualEntry<T>>,
}

impl<T: 'static> VirtualTable<T> {
    /// Empty table: the engine's defaults run for every method
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Override a method that takes no arguments
    pub fn add0<R, F>(self, name: &str, f: F) -> Self
    where
        R: PtrCall + Default + 'static,
        F: Fn(&mut T) -> R + Send + Sync + 'static,
    {
        self.add(name, move |this: &mut T, (): ()| f(this))
    }

    /// Override a method; `A` is the argument tuple, e.g. `(f64,)`
    pub fn add<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: VirtualArgs + 'static,
        R: PtrCall + Default + 'static,
        F: Fn(&mut T, A) -> R + Send + Sync + 'static,
    {
        self.entries.retain(|e| e.name != name);
        self.entries.push(VirtualEntry::new(name, f));
        self
    }

    /// Overridden method names in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Declared argument count of an override
    pub fn arity(&self, name: &str) -> Option<usize> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.arity)
    }

    /// Number of overrides
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is overridden
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn freeze(self, names: &NameInterner) -> DispatchMap<T> {
        self.entries
            .into_iter()
            .map(|entry| (names.intern(&entry.name), Box::new(entry)))
            .collect()
    }
}

impl<T: 'static> Default for VirtualTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen overrides; boxed so call data pointers stay put
pub(crate) type DispatchMap<T> = FxHashMap<StringName, Box<VirtualEntry<T>>>;

/// Opaque call data the engine passes back on invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualCallData(NonNull<c_void>);

impl VirtualCallData {
    pub(crate) fn of<T>(entry: &VirtualEntry<T>) -> Self {
        Self(NonNull::from(entry).cast())
    }

    /// Pointer handed to the engine
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

// ============================================================================
// Instances
// ============================================================================

/// Rust side of one extension object, attached with `object_set_instance`
pub(crate) struct InstanceStorage<T> {
    pub(crate) rt: Weak<Runtime>,
    pub(crate) base: RawObject,
    pub(crate) value: ReentrantMutex<RefCell<T>>,
}

impl<T> InstanceStorage<T> {
    /// Run `f` with exclusive access. The lock is re-entrant so an engine
    /// call back into the same instance on this thread reports
    /// [`DispatchError::Reentrant`] instead of deadlocking.
    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, DispatchError> {
        let guard = self.value.lock();
        let mut value = guard.try_borrow_mut().map_err(|_| DispatchError::Reentrant)?;
        Ok(f(&mut value))
    }
}

/// Message of a panic caught at an engine boundary. An ABI violation cannot
/// be recovered from and aborts the process.
pub(crate) fn recover_panic(payload: Box<dyn Any + Send>, what: &str) -> String {
    if let Some(violation) = payload.downcast_ref::<AbiViolation>() {
        log::error!("fatal ABI violation in '{}': {}", what, violation);
        std::process::abort();
    }
    panic_message(&*payload)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Engine entry points
// ============================================================================

pub(crate) unsafe extern "C" fn get_virtual_call_data<T: Send + 'static>(
    userdata: *mut c_void,
    name: RawStringName,
) -> *mut c_void {
    let binding = &*(userdata as *const ClassBinding<T>);
    match catch_unwind(AssertUnwindSafe(|| binding.lookup_raw(name))) {
        Ok(Some(data)) => data.as_ptr(),
        Ok(None) => std::ptr::null_mut(),
        Err(payload) => {
            log::error!("virtual lookup panicked: {}", panic_message(&*payload));
            std::ptr::null_mut()
        }
    }
}

pub(crate) unsafe extern "C" fn call_virtual_with_data<T: Send + 'static>(
    instance: RawInstance,
    _name: RawStringName,
    data: *mut c_void,
    args: RawArgs,
    ret: RawRet,
) {
    let storage = &*(instance.0 as *const InstanceStorage<T>);
    let entry = &*(data as *const VirtualEntry<T>);
    let Some(rt) = storage.rt.upgrade() else {
        // No bridge left to build a default with; hand back zeroed bytes.
        log::error!("virtual '{}' called after the runtime shut down", entry.name);
        entry.write_zeroed(ret);
        return;
    };
    rt.stats().record_virtual_call();
    if !run_entry(&rt, storage, entry, args, ret) {
        rt.stats().record_virtual_failure();
    }
}

/// Run `entry` on an instance with an engine frame. On failure the default
/// result is written and false is returned.
///
/// # Safety
/// `args` and `ret` must match the entry's declared signature.
pub(crate) unsafe fn run_entry<T>(
    rt: &Runtime,
    storage: &InstanceStorage<T>,
    entry: &VirtualEntry<T>,
    args: RawArgs,
    ret: RawRet,
) -> bool {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        storage
            .with_mut(|value| (entry.call)(value, rt.bridge(), args, ret))
            .and_then(|r| r.map_err(DispatchError::from))
    }));
    let failure = match outcome {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => e,
        Err(payload) => DispatchError::Panic(recover_panic(payload, &entry.name)),
    };

    log::error!(
        "'{}' on object {:#x} failed, returning default: {}",
        entry.name,
        storage.base.addr(),
        failure
    );
    let bridge = rt.bridge();
    if catch_unwind(AssertUnwindSafe(|| (entry.write_default)(bridge, ret))).is_err() {
        log::error!("writing the default result of '{}' panicked", entry.name);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        hits: u32,
    }

    #[test]
    fn test_table_replaces_duplicate_names() {
        let table = VirtualTable::<Counter>::new()
            .add0("ready", |c: &mut Counter| c.hits += 1)
            .add("process", |c: &mut Counter, (dt,): (f64,)| {
                c.hits += dt as u32;
            })
            .add0("ready", |c: &mut Counter| c.hits += 2);
        let names: Vec<_> = table.names().collect();
        assert_eq!(names, vec!["process", "ready"]);
        assert_eq!(table.arity("process"), Some(1));
        assert_eq!(table.arity("ready"), Some(0));
        assert_eq!(table.arity("input"), None);
    }

    #[test]
    fn test_method_args_report_failing_index() {
        let args = vec![Variant::Int(3), Variant::from("three")];
        let err = <(i64, i64)>::from_variants(&args).unwrap_err();
        assert_eq!(err.0, 1);
        assert_eq!(<(i64, String)>::kinds(), vec![VariantKind::Int, VariantKind::String]);
        let (n, s) = <(i32, String)>::from_variants(&args).unwrap();
        assert_eq!((n, s.as_str()), (3, "three"));
    }

    #[test]
    fn test_reentrant_borrow_is_reported() {
        let storage = InstanceStorage {
            rt: Weak::new(),
            base: RawObject::NULL,
            value: ReentrantMutex::new(RefCell::new(Counter { hits: 0 })),
        };
        let inner = storage
            .with_mut(|c| {
                c.hits += 1;
                storage.with_mut(|c| c.hits += 1).is_err()
            })
            .unwrap();
        assert!(inner);
        assert_eq!(storage.with_mut(|c| c.hits).unwrap(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom 1");
        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static");
    }
}
