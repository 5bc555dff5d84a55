//! Custom callables
//!
//! A Rust closure handed to the engine as a Callable through
//! `callable_custom_create`. The engine owns the closure from then on: it
//! reference counts the callable variant and calls `free` when the last copy
//! is destroyed. [`CallableHandle`] is this side's copy.
//!
//! Calls arriving after the runtime shut down, and calls whose arguments do
//! not decode, fail through the `CallError` out-parameter. A panicking
//! closure is logged and reported as an invalid method.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tether_sys::{
    CallError, CallErrorKind, CallableCustomInfo, InstanceId, RawVariant, RawVariantArgs,
};

use crate::dispatch::{panic_message, recover_panic};
use crate::error::ConversionError;
use crate::host::HostApi;
use crate::runtime::Runtime;
use crate::variant::{Callable, Variant, VariantKind};

/// Body of a custom callable
pub type CallableFn = dyn Fn(&[Variant]) -> Variant + Send + Sync;

struct CustomCallable {
    rt: Weak<Runtime>,
    name: String,
    f: Box<CallableFn>,
}

impl CustomCallable {
    unsafe fn call(
        &self,
        args: RawVariantArgs,
        count: i64,
        ret: *mut RawVariant,
    ) -> Result<(), CallError> {
        let Some(rt) = self.rt.upgrade() else {
            log::error!("callable '{}' called after the runtime shut down", self.name);
            return Err(CallError::new(CallErrorKind::InvalidMethod, 0, 0));
        };
        let bridge = rt.bridge();
        let count = usize::try_from(count).unwrap_or(0);
        let mut values = Vec::with_capacity(count);
        for index in 0..count {
            match (*args.add(index)).as_ref().map(|raw| bridge.from_raw_borrowed(raw)) {
                Some(Ok(value)) => values.push(value),
                _ => {
                    return Err(CallError::new(
                        CallErrorKind::InvalidArgument,
                        index as i32,
                        VariantKind::Nil as i32,
                    ))
                }
            }
        }
        match catch_unwind(AssertUnwindSafe(|| (self.f)(&values))) {
            Ok(result) => {
                ret.write(bridge.to_raw(&result));
                Ok(())
            }
            Err(payload) => {
                let message = recover_panic(payload, &self.name);
                log::error!("callable '{}' panicked: {}", self.name, message);
                Err(CallError::new(CallErrorKind::InvalidMethod, 0, 0))
            }
        }
    }
}

unsafe extern "C" fn call_custom(
    userdata: *mut c_void,
    args: RawVariantArgs,
    count: i64,
    ret: *mut RawVariant,
    error: *mut CallError,
) {
    let callable = &*(userdata as *const CustomCallable);
    ret.write(RawVariant::NIL);
    let outcome = callable.call(args, count, ret);
    error.write(match outcome {
        Ok(()) => CallError::OK,
        Err(e) => e,
    });
}

unsafe extern "C" fn is_valid_custom(userdata: *mut c_void) -> bool {
    (*(userdata as *const CustomCallable)).rt.strong_count() > 0
}

unsafe extern "C" fn free_custom(userdata: *mut c_void) {
    let callable = Box::from_raw(userdata as *mut CustomCallable);
    log::trace!("freeing callable '{}'", callable.name);
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(callable))) {
        log::error!("dropping a callable panicked: {}", panic_message(&*payload));
    }
}

/// Hand `f` to the engine as a callable named `name`
pub(crate) fn create<F>(
    rt: &Runtime,
    weak: Weak<Runtime>,
    name: &str,
    f: F,
) -> Result<CallableHandle, ConversionError>
where
    F: Fn(&[Variant]) -> Variant + Send + Sync + 'static,
{
    let host = rt.host_arc();
    let names = rt.names();
    let userdata = Box::into_raw(Box::new(CustomCallable {
        rt: weak,
        name: name.to_string(),
        f: Box::new(f),
    }));
    let info = CallableCustomInfo {
        callable_userdata: userdata as *mut c_void,
        token: host.library(),
        object_id: InstanceId::NONE,
        name: names.to_raw(&names.intern(name), &host),
        call: Some(call_custom),
        is_valid: Some(is_valid_custom),
        free: Some(free_custom),
    };
    // SAFETY: userdata is released only through free_custom
    let mut raw = unsafe { host.callable_create(&info) };
    match rt.bridge().from_raw_borrowed(&raw) {
        Ok(Variant::Callable(callable)) => Ok(CallableHandle {
            host,
            raw,
            callable,
        }),
        other => {
            // The host kept nothing; the closure is still ours to drop
            host.variant_destroy(&mut raw);
            // SAFETY: the host refused the callable and will not call free
            drop(unsafe { Box::from_raw(userdata) });
            Err(match other {
                Ok(value) => ConversionError::mismatch(VariantKind::Callable, value.kind()),
                Err(e) => e,
            })
        }
    }
}

/// This side's reference to a custom callable. Dropping it releases the
/// reference; the closure is freed once the engine drops its copies too.
pub struct CallableHandle {
    host: Arc<HostApi>,
    raw: RawVariant,
    callable: Callable,
}

impl CallableHandle {
    /// Callable as a managed value
    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    /// Callable as a variant, for passing as an argument
    pub fn to_variant(&self) -> Variant {
        Variant::Callable(self.callable.clone())
    }

    /// Raw variant the host created; still owned by this handle
    pub fn as_raw(&self) -> &RawVariant {
        &self.raw
    }
}

impl std::fmt::Debug for CallableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableHandle")
            .field("callable", &self.callable)
            .finish()
    }
}

impl Drop for CallableHandle {
    fn drop(&mut self) {
        self.host.variant_destroy(&mut self.raw);
    }
}
