//! Extension class creation callbacks

use std::ffi::c_void;

use crate::call::{CallError, RawVariantArgs};
use crate::handles::{RawInstance, RawObject, RawString, RawStringName};
use crate::variant::RawVariant;
use crate::{RawArgs, RawRet};

/// Construct a new object of the extension class; returns the engine object
pub type CreateInstanceFn = unsafe extern "C" fn(class_userdata: *mut c_void) -> RawObject;

/// Drop the extension instance data attached to an object being destroyed
pub type FreeInstanceFn = unsafe extern "C" fn(class_userdata: *mut c_void, instance: RawInstance);

/// Look up per-method call data for a virtual method name.
/// A null result tells the host to run its own default implementation.
pub type GetVirtualCallDataFn =
    unsafe extern "C" fn(class_userdata: *mut c_void, name: RawStringName) -> *mut c_void;

/// Invoke a virtual override with the data returned by `GetVirtualCallDataFn`
pub type CallVirtualWithDataFn = unsafe extern "C" fn(
    instance: RawInstance,
    name: RawStringName,
    call_data: *mut c_void,
    args: RawArgs,
    ret: RawRet,
);

/// Callback table handed to `classdb_register_extension_class`.
/// The host copies the struct; `class_userdata` must outlive the registration.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClassCreationInfo {
    /// Class cannot be instantiated from the editor
    pub is_virtual: bool,
    /// Class cannot be instantiated at all
    pub is_abstract: bool,
    /// Extension data passed back to every class callback
    pub class_userdata: *mut c_void,
    /// Instance constructor
    pub create_instance: Option<CreateInstanceFn>,
    /// Instance destructor
    pub free_instance: Option<FreeInstanceFn>,
    /// Virtual name lookup
    pub get_virtual_call_data: Option<GetVirtualCallDataFn>,
    /// Virtual trampoline
    pub call_virtual_with_data: Option<CallVirtualWithDataFn>,
}

// ============================================================================
// Class members
// ============================================================================

/// Description of a property, method argument or return value
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PropertyInfo {
    /// `VariantType` discriminant; `Nil` accepts any value
    pub variant_type: u32,
    /// Property or argument name
    pub name: RawStringName,
    /// Class name for object values, null otherwise
    pub class_name: RawStringName,
    /// Editor hint
    pub hint: u32,
    /// Editor hint text, null when empty
    pub hint_string: RawString,
    /// `PropertyInfo::USAGE_*` bits
    pub usage: u32,
}

impl PropertyInfo {
    /// Saved with the object
    pub const USAGE_STORAGE: u32 = 1 << 1;
    /// Shown in the editor
    pub const USAGE_EDITOR: u32 = 1 << 2;
    /// Usage of an ordinary exported property
    pub const USAGE_DEFAULT: u32 = Self::USAGE_STORAGE | Self::USAGE_EDITOR;
}

/// Method flag bits
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodFlags(pub u32);

impl MethodFlags {
    /// Ordinary method
    pub const NORMAL: Self = Self(1);
    /// Editor only
    pub const EDITOR: Self = Self(1 << 1);
    /// Does not mutate the instance
    pub const CONST: Self = Self(1 << 2);
    /// Overridable by scripts
    pub const VIRTUAL: Self = Self(1 << 3);
    /// Takes any number of arguments
    pub const VARARG: Self = Self(1 << 4);
    /// No instance
    pub const STATIC: Self = Self(1 << 5);

    /// Whether every bit of `other` is set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MethodFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Call a registered method with variant arguments. `ret` is uninitialized
/// and is always written; `error` reports argument problems.
pub type MethodCallFn = unsafe extern "C" fn(
    method_userdata: *mut c_void,
    instance: RawInstance,
    args: RawVariantArgs,
    count: i64,
    ret: *mut RawVariant,
    error: *mut CallError,
);

/// Call a registered method with a ptrcall frame
pub type MethodPtrCallFn = unsafe extern "C" fn(
    method_userdata: *mut c_void,
    instance: RawInstance,
    args: RawArgs,
    ret: RawRet,
);

/// Method handed to `classdb_register_extension_class_method`. The host
/// copies the struct and the info arrays; `method_userdata` must outlive the
/// class registration.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClassMethodInfo {
    /// Method name
    pub name: RawStringName,
    /// Extension data passed back to both call paths
    pub method_userdata: *mut c_void,
    /// Variant call path
    pub call: Option<MethodCallFn>,
    /// Ptrcall path
    pub ptrcall: Option<MethodPtrCallFn>,
    /// Flag bits
    pub flags: MethodFlags,
    /// Whether `return_value_info` describes a result
    pub has_return_value: bool,
    /// Result description, null without a return value
    pub return_value_info: *const PropertyInfo,
    /// Number of entries at `arguments_info`
    pub argument_count: u32,
    /// Argument descriptions
    pub arguments_info: *const PropertyInfo,
}
