//! Tether SYS - raw ABI shared with the native engine host
//!
//! This crate holds only `#[repr(C)]` layouts and function pointer types. It
//! has no behavior of its own: the runtime in `tether-core` builds ownership
//! tracking, call frames and variant conversion on top of these definitions,
//! and a host (the engine, or `tether-testhost` in tests) fills in the
//! function table.
//!
//! # Layout summary
//!
//! ```text
//! HostInterface     host context pointer + nullable extern "C" fn table
//! RawVariant        24 bytes: tag(u32) pad(u32) payload([u64; 2])
//! Raw* handles      pointer-sized, opaque, no type information
//! Call frame        *const *const c_void (one pointer per argument) + *mut c_void return
//! Variant call      *const *const RawVariant + count + *mut RawVariant return + CallError
//! ```

#![warn(missing_docs)]

mod call;
mod class;
mod handles;
mod init;
mod interface;
mod variant;

pub use call::{
    CallError, CallErrorKind, CallableCallFn, CallableCustomInfo, CallableFreeFn,
    CallableIsValidFn, RawVariantArgs,
};
pub use class::{
    CallVirtualWithDataFn, ClassCreationInfo, ClassMethodInfo, CreateInstanceFn, FreeInstanceFn,
    GetVirtualCallDataFn, MethodCallFn, MethodFlags, MethodPtrCallFn, PropertyInfo,
};
pub use handles::{
    InstanceId, RawArray, RawDictionary, RawInstance, RawMethodBind, RawObject, RawPackedArray,
    RawString, RawStringName,
};
pub use init::{
    DeinitializeFn, EntryPointFn, ExtensionInitialization, InitializationLevel, InitializeFn,
};
pub use interface::{AbiVersion, HostCtx, HostInterface, ABI_VERSION};
pub use variant::{PackedElement, RawVariant, VariantType, RAW_VARIANT_SIZE};

/// Argument array passed to ptrcalls: one pointer per argument value.
pub type RawArgs = *const *const std::ffi::c_void;

/// Return slot passed to ptrcalls: storage sized for the return type.
pub type RawRet = *mut std::ffi::c_void;
