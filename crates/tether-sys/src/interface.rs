//! Host function table
//!
//! Every entry is nullable so a partially populated table can be detected
//! at load time instead of crashing on first use. The `host` context pointer
//! is passed back as the first argument of every call, which lets several
//! independent hosts coexist in one process.

use std::ffi::c_void;

use crate::call::{CallError, CallableCustomInfo, RawVariantArgs};
use crate::class::{ClassCreationInfo, ClassMethodInfo, PropertyInfo};
use crate::handles::{
    InstanceId, RawArray, RawDictionary, RawMethodBind, RawObject, RawPackedArray, RawString,
    RawStringName,
};
use crate::variant::RawVariant;
use crate::{RawArgs, RawRet};

/// Opaque host context, passed back to every host function
pub type HostCtx = *mut c_void;

/// Interface version negotiated at load time
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiVersion {
    /// Incompatible layout changes
    pub major: u32,
    /// Additive changes
    pub minor: u32,
}

/// Version this crate was built against
pub const ABI_VERSION: AbiVersion = AbiVersion { major: 4, minor: 3 };

impl AbiVersion {
    /// A host is usable when the major version matches and it is at least as
    /// new as the extension.
    pub fn is_compatible_with(self, required: AbiVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

/// Raw function table supplied by the host at library load
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostInterface {
    /// Host context passed back as the first argument of every call
    pub host: HostCtx,
    /// Interface version implemented by the host
    pub version: AbiVersion,

    // ========================================================================
    // Memory
    // ========================================================================
    /// Allocate `size` bytes of host memory (16-byte aligned)
    pub mem_alloc: Option<unsafe extern "C" fn(HostCtx, usize) -> *mut c_void>,
    /// Free memory returned by `mem_alloc`
    pub mem_free: Option<unsafe extern "C" fn(HostCtx, *mut c_void)>,

    // ========================================================================
    // Objects
    // ========================================================================
    /// Invoke a method bind on a receiver with a ptrcall frame
    pub object_method_bind_ptrcall:
        Option<unsafe extern "C" fn(HostCtx, RawMethodBind, RawObject, RawArgs, RawRet)>,
    /// Invoke a method bind with variant arguments. The result is written to
    /// uninitialized `ret` even when the call fails.
    pub object_method_bind_call: Option<
        unsafe extern "C" fn(
            HostCtx,
            RawMethodBind,
            RawObject,
            RawVariantArgs,
            i64,
            *mut RawVariant,
            *mut CallError,
        ),
    >,
    /// Destroy an object immediately
    pub object_destroy: Option<unsafe extern "C" fn(HostCtx, RawObject)>,
    /// Instance id of a live object
    pub object_get_instance_id: Option<unsafe extern "C" fn(HostCtx, RawObject) -> InstanceId>,
    /// Look up a live object by id; null when the object is gone
    pub object_get_instance_from_id: Option<unsafe extern "C" fn(HostCtx, InstanceId) -> RawObject>,
    /// Cast to a class by name; null when the object does not inherit it
    pub object_cast_to: Option<unsafe extern "C" fn(HostCtx, RawObject, RawStringName) -> RawObject>,
    /// Attach extension instance data to an object of an extension class
    pub object_set_instance:
        Option<unsafe extern "C" fn(HostCtx, RawObject, RawStringName, crate::RawInstance)>,
    /// Engine singleton by class name
    pub global_get_singleton: Option<unsafe extern "C" fn(HostCtx, RawStringName) -> RawObject>,

    // ========================================================================
    // Class database
    // ========================================================================
    /// Construct an object of a (native or extension) class
    pub classdb_construct_object: Option<unsafe extern "C" fn(HostCtx, RawStringName) -> RawObject>,
    /// Resolve a method; null when the class has no such method or the hash
    /// does not match
    pub classdb_get_method_bind: Option<
        unsafe extern "C" fn(HostCtx, RawStringName, RawStringName, i64) -> RawMethodBind,
    >,
    /// Register an extension class; returns false when the host refuses it
    pub classdb_register_extension_class: Option<
        unsafe extern "C" fn(
            HostCtx,
            *mut c_void,
            RawStringName,
            RawStringName,
            *const ClassCreationInfo,
        ) -> bool,
    >,
    /// Remove an extension class registered by this library
    pub classdb_unregister_extension_class:
        Option<unsafe extern "C" fn(HostCtx, *mut c_void, RawStringName)>,
    /// Add a method to an extension class
    pub classdb_register_extension_class_method: Option<
        unsafe extern "C" fn(HostCtx, *mut c_void, RawStringName, *const ClassMethodInfo) -> bool,
    >,
    /// Add a property backed by a setter and getter method of the class.
    /// An empty setter name makes the property read-only.
    pub classdb_register_extension_class_property: Option<
        unsafe extern "C" fn(
            HostCtx,
            *mut c_void,
            RawStringName,
            *const PropertyInfo,
            RawStringName,
            RawStringName,
        ) -> bool,
    >,
    /// Add a signal with `count` argument descriptions
    pub classdb_register_extension_class_signal: Option<
        unsafe extern "C" fn(
            HostCtx,
            *mut c_void,
            RawStringName,
            RawStringName,
            *const PropertyInfo,
            usize,
        ) -> bool,
    >,
    /// Add an integer constant, optionally grouped under an enum name
    pub classdb_register_extension_class_integer_constant: Option<
        unsafe extern "C" fn(
            HostCtx,
            *mut c_void,
            RawStringName,
            RawStringName,
            RawStringName,
            i64,
            bool,
        ) -> bool,
    >,

    // ========================================================================
    // Callables
    // ========================================================================
    /// Create a callable backed by extension callbacks and write it to
    /// uninitialized `out` as a Callable variant
    pub callable_custom_create:
        Option<unsafe extern "C" fn(HostCtx, *mut RawVariant, *const CallableCustomInfo)>,

    // ========================================================================
    // Reference counting
    // ========================================================================
    /// Increment the intrusive count; returns false for non-refcounted objects
    pub ref_reference: Option<unsafe extern "C" fn(HostCtx, RawObject) -> bool>,
    /// Decrement the intrusive count; returns true when it reached zero
    pub ref_unreference: Option<unsafe extern "C" fn(HostCtx, RawObject) -> bool>,

    // ========================================================================
    // Strings
    // ========================================================================
    /// Create a host string from UTF-8 bytes
    pub string_new_with_utf8_chars_and_len:
        Option<unsafe extern "C" fn(HostCtx, *const u8, usize) -> RawString>,
    /// Copy up to `cap` UTF-8 bytes into `buf`; returns the full length
    pub string_to_utf8_chars: Option<unsafe extern "C" fn(HostCtx, RawString, *mut u8, usize) -> usize>,
    /// Destroy a host string
    pub string_destroy: Option<unsafe extern "C" fn(HostCtx, RawString)>,
    /// Intern a name; the result lives as long as the host
    pub string_name_new_with_utf8_chars_and_len:
        Option<unsafe extern "C" fn(HostCtx, *const u8, usize) -> RawStringName>,
    /// Copy up to `cap` UTF-8 bytes of a name into `buf`; returns the full length
    pub string_name_to_utf8_chars:
        Option<unsafe extern "C" fn(HostCtx, RawStringName, *mut u8, usize) -> usize>,

    // ========================================================================
    // Variants
    // ========================================================================
    /// Deep copy `src` into uninitialized `dst`
    pub variant_new_copy: Option<unsafe extern "C" fn(HostCtx, *mut RawVariant, *const RawVariant)>,
    /// Release whatever host resources a variant holds and reset it to nil
    pub variant_destroy: Option<unsafe extern "C" fn(HostCtx, *mut RawVariant)>,

    // ========================================================================
    // Arrays
    // ========================================================================
    /// Create an empty array
    pub array_new: Option<unsafe extern "C" fn(HostCtx) -> RawArray>,
    /// Number of elements
    pub array_size: Option<unsafe extern "C" fn(HostCtx, RawArray) -> usize>,
    /// Copy element `index` into uninitialized `out`
    pub array_get: Option<unsafe extern "C" fn(HostCtx, RawArray, usize, *mut RawVariant)>,
    /// Append a copy of `value`
    pub array_push: Option<unsafe extern "C" fn(HostCtx, RawArray, *const RawVariant)>,
    /// Destroy an array and its elements
    pub array_destroy: Option<unsafe extern "C" fn(HostCtx, RawArray)>,

    // ========================================================================
    // Dictionaries (insertion ordered)
    // ========================================================================
    /// Create an empty dictionary
    pub dictionary_new: Option<unsafe extern "C" fn(HostCtx) -> RawDictionary>,
    /// Number of entries
    pub dictionary_size: Option<unsafe extern "C" fn(HostCtx, RawDictionary) -> usize>,
    /// Copy the key at insertion position `index` into `out`
    pub dictionary_key_at:
        Option<unsafe extern "C" fn(HostCtx, RawDictionary, usize, *mut RawVariant)>,
    /// Copy the value at insertion position `index` into `out`
    pub dictionary_value_at:
        Option<unsafe extern "C" fn(HostCtx, RawDictionary, usize, *mut RawVariant)>,
    /// Insert or overwrite an entry with copies of `key` and `value`
    pub dictionary_set:
        Option<unsafe extern "C" fn(HostCtx, RawDictionary, *const RawVariant, *const RawVariant)>,
    /// Destroy a dictionary and its entries
    pub dictionary_destroy: Option<unsafe extern "C" fn(HostCtx, RawDictionary)>,

    // ========================================================================
    // Packed arrays
    // ========================================================================
    /// Create a packed array by copying `len` elements of kind `element`
    /// (a `PackedElement` discriminant) from `data`
    pub packed_array_new:
        Option<unsafe extern "C" fn(HostCtx, u32, *const c_void, usize) -> RawPackedArray>,
    /// Borrow the contiguous element storage; writes the element kind and length
    pub packed_array_data:
        Option<unsafe extern "C" fn(HostCtx, RawPackedArray, *mut u32, *mut usize) -> *const c_void>,
    /// Destroy a packed array
    pub packed_array_destroy: Option<unsafe extern "C" fn(HostCtx, RawPackedArray)>,
}

macro_rules! function_names {
    ($($field:ident),* $(,)?) => {
        impl HostInterface {
            /// Names of function entries that are null
            pub fn missing_functions(&self) -> Vec<&'static str> {
                let mut missing = Vec::new();
                $(
                    if self.$field.is_none() {
                        missing.push(stringify!($field));
                    }
                )*
                missing
            }

            /// A table with every entry null
            pub fn empty(host: HostCtx) -> Self {
                Self {
                    host,
                    version: ABI_VERSION,
                    $($field: None,)*
                }
            }
        }
    };
}

function_names!(
    mem_alloc,
    mem_free,
    object_method_bind_ptrcall,
    object_method_bind_call,
    object_destroy,
    object_get_instance_id,
    object_get_instance_from_id,
    object_cast_to,
    object_set_instance,
    global_get_singleton,
    classdb_construct_object,
    classdb_get_method_bind,
    classdb_register_extension_class,
    classdb_unregister_extension_class,
    classdb_register_extension_class_method,
    classdb_register_extension_class_property,
    classdb_register_extension_class_signal,
    classdb_register_extension_class_integer_constant,
    callable_custom_create,
    ref_reference,
    ref_unreference,
    string_new_with_utf8_chars_and_len,
    string_to_utf8_chars,
    string_destroy,
    string_name_new_with_utf8_chars_and_len,
    string_name_to_utf8_chars,
    variant_new_copy,
    variant_destroy,
    array_new,
    array_size,
    array_get,
    array_push,
    array_destroy,
    dictionary_new,
    dictionary_size,
    dictionary_key_at,
    dictionary_value_at,
    dictionary_set,
    dictionary_destroy,
    packed_array_new,
    packed_array_data,
    packed_array_destroy,
);

impl std::fmt::Debug for HostInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostInterface")
            .field("host", &self.host)
            .field("version", &self.version)
            .field("missing", &self.missing_functions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_reports_every_function() {
        let table = HostInterface::empty(std::ptr::null_mut());
        let missing = table.missing_functions();
        assert_eq!(missing.len(), 42);
        assert_eq!(missing[0], "mem_alloc");
        assert!(missing.contains(&"classdb_get_method_bind"));
    }

    #[test]
    fn test_version_compatibility() {
        let host = AbiVersion { major: 4, minor: 4 };
        assert!(host.is_compatible_with(ABI_VERSION));
        assert!(!AbiVersion { major: 3, minor: 9 }.is_compatible_with(ABI_VERSION));
        assert!(!AbiVersion { major: 4, minor: 1 }.is_compatible_with(ABI_VERSION));
    }
}
