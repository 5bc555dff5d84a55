//! Validated access to the host function table
//!
//! `HostApi` is built once from the table the engine passes at load time.
//! Construction checks every entry, so the wrappers below can treat a null
//! entry as a contract violation rather than a recoverable error.

use std::ffi::c_void;

use tether_sys::{
    AbiVersion, CallError, CallableCustomInfo, ClassCreationInfo, ClassMethodInfo, HostInterface,
    InstanceId, PackedElement, PropertyInfo, RawArgs, RawArray, RawDictionary, RawInstance,
    RawMethodBind, RawObject, RawPackedArray, RawRet, RawString, RawStringName, RawVariant,
    ABI_VERSION,
};

use crate::error::{fatal, AbiViolation, RuntimeError};

macro_rules! host_fn {
    ($api:expr, $name:ident) => {
        match $api.table.$name {
            Some(f) => f,
            None => fatal(AbiViolation::MissingHostFunction(stringify!($name))),
        }
    };
}

/// The host function table plus the library token it was loaded with
pub struct HostApi {
    table: HostInterface,
    library: *mut c_void,
}

// The table is immutable after validation and the host functions are
// documented as callable from any thread.
unsafe impl Send for HostApi {}
unsafe impl Sync for HostApi {}

impl std::fmt::Debug for HostApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostApi")
            .field("version", &self.table.version)
            .field("library", &self.library)
            .finish()
    }
}

impl HostApi {
    /// Validate a host table
    pub fn new(table: HostInterface, library: *mut c_void) -> Result<Self, RuntimeError> {
        if !table.version.is_compatible_with(ABI_VERSION) {
            return Err(RuntimeError::IncompatibleHost {
                found: table.version,
                required: ABI_VERSION,
            });
        }
        if let Some(name) = table.missing_functions().first().copied() {
            return Err(RuntimeError::MissingHostFunction(name));
        }
        Ok(Self { table, library })
    }

    /// Interface version the host reported
    pub fn version(&self) -> AbiVersion {
        self.table.version
    }

    /// Library token from load time
    pub fn library(&self) -> *mut c_void {
        self.library
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Allocate host memory
    pub fn alloc(&self, size: usize) -> *mut c_void {
        unsafe { host_fn!(self, mem_alloc)(self.table.host, size) }
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Call a method bind with a prepared frame
    ///
    /// # Safety
    /// `args` and `ret` must match the method's signature exactly.
    pub unsafe fn ptrcall(&self, bind: RawMethodBind, receiver: RawObject, args: RawArgs, ret: RawRet) {
        host_fn!(self, object_method_bind_ptrcall)(self.table.host, bind, receiver, args, ret)
    }

    /// Call a method bind with variant arguments; the host copies what it
    /// keeps. Returns the owned result and the call outcome.
    ///
    /// # Safety
    /// Every pointer in `args` must point to a valid raw variant.
    pub unsafe fn varcall(
        &self,
        bind: RawMethodBind,
        receiver: RawObject,
        args: &[*const RawVariant],
    ) -> (RawVariant, CallError) {
        let mut ret = RawVariant::NIL;
        let mut error = CallError::OK;
        host_fn!(self, object_method_bind_call)(
            self.table.host,
            bind,
            receiver,
            args.as_ptr(),
            args.len() as i64,
            &mut ret,
            &mut error,
        );
        (ret, error)
    }

    /// Destroy an object
    pub fn object_destroy(&self, object: RawObject) {
        unsafe { host_fn!(self, object_destroy)(self.table.host, object) }
    }

    /// Instance id of an object
    pub fn instance_id(&self, object: RawObject) -> InstanceId {
        unsafe { host_fn!(self, object_get_instance_id)(self.table.host, object) }
    }

    /// Live object for an id
    pub fn object_from_id(&self, id: InstanceId) -> Option<RawObject> {
        let raw = unsafe { host_fn!(self, object_get_instance_from_id)(self.table.host, id) };
        (!raw.is_null()).then_some(raw)
    }

    /// Cast by class name
    pub fn cast_to(&self, object: RawObject, class: RawStringName) -> Option<RawObject> {
        let raw = unsafe { host_fn!(self, object_cast_to)(self.table.host, object, class) };
        (!raw.is_null()).then_some(raw)
    }

    /// Attach extension instance data
    pub fn set_instance(&self, object: RawObject, class: RawStringName, instance: RawInstance) {
        unsafe { host_fn!(self, object_set_instance)(self.table.host, object, class, instance) }
    }

    /// Engine singleton
    pub fn singleton(&self, name: RawStringName) -> Option<RawObject> {
        let raw = unsafe { host_fn!(self, global_get_singleton)(self.table.host, name) };
        (!raw.is_null()).then_some(raw)
    }

    // ========================================================================
    // Class database
    // ========================================================================

    /// Construct an object by class name
    pub fn construct(&self, class: RawStringName) -> Option<RawObject> {
        let raw = unsafe { host_fn!(self, classdb_construct_object)(self.table.host, class) };
        (!raw.is_null()).then_some(raw)
    }

    /// Look up a method bind
    pub fn method_bind(&self, class: RawStringName, method: RawStringName, hash: i64) -> Option<RawMethodBind> {
        let raw =
            unsafe { host_fn!(self, classdb_get_method_bind)(self.table.host, class, method, hash) };
        (!raw.is_null()).then_some(raw)
    }

    /// Register an extension class
    ///
    /// # Safety
    /// The userdata in `info` must stay valid until the class is unregistered.
    pub unsafe fn register_class(
        &self,
        class: RawStringName,
        parent: RawStringName,
        info: &ClassCreationInfo,
    ) -> bool {
        host_fn!(self, classdb_register_extension_class)(
            self.table.host,
            self.library,
            class,
            parent,
            info,
        )
    }

    /// Unregister an extension class
    pub fn unregister_class(&self, class: RawStringName) {
        unsafe {
            host_fn!(self, classdb_unregister_extension_class)(self.table.host, self.library, class)
        }
    }

    /// Add a method to a registered extension class
    ///
    /// # Safety
    /// `info.method_userdata` must stay valid until the class is unregistered,
    /// and the info arrays must be valid for the call.
    pub unsafe fn register_method(&self, class: RawStringName, info: &ClassMethodInfo) -> bool {
        host_fn!(self, classdb_register_extension_class_method)(
            self.table.host,
            self.library,
            class,
            info,
        )
    }

    /// Add a property backed by `setter` and `getter`
    pub fn register_property(
        &self,
        class: RawStringName,
        info: &PropertyInfo,
        setter: RawStringName,
        getter: RawStringName,
    ) -> bool {
        unsafe {
            host_fn!(self, classdb_register_extension_class_property)(
                self.table.host,
                self.library,
                class,
                info,
                setter,
                getter,
            )
        }
    }

    /// Add a signal
    pub fn register_signal(
        &self,
        class: RawStringName,
        signal: RawStringName,
        args: &[PropertyInfo],
    ) -> bool {
        unsafe {
            host_fn!(self, classdb_register_extension_class_signal)(
                self.table.host,
                self.library,
                class,
                signal,
                args.as_ptr(),
                args.len(),
            )
        }
    }

    /// Add an integer constant; a null `enum_name` leaves it ungrouped
    pub fn register_constant(
        &self,
        class: RawStringName,
        enum_name: RawStringName,
        constant: RawStringName,
        value: i64,
        is_bitfield: bool,
    ) -> bool {
        unsafe {
            host_fn!(self, classdb_register_extension_class_integer_constant)(
                self.table.host,
                self.library,
                class,
                enum_name,
                constant,
                value,
                is_bitfield,
            )
        }
    }

    // ========================================================================
    // Callables
    // ========================================================================

    /// Create a custom callable; the result is an owned Callable variant
    ///
    /// # Safety
    /// `info.callable_userdata` must stay valid until the host calls `free`.
    pub unsafe fn callable_create(&self, info: &CallableCustomInfo) -> RawVariant {
        let mut out = RawVariant::NIL;
        host_fn!(self, callable_custom_create)(self.table.host, &mut out, info);
        out
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    /// Increment; false when the object is not refcounted
    pub fn reference(&self, object: RawObject) -> bool {
        unsafe { host_fn!(self, ref_reference)(self.table.host, object) }
    }

    /// Decrement; true when the count reached zero
    pub fn unreference(&self, object: RawObject) -> bool {
        unsafe { host_fn!(self, ref_unreference)(self.table.host, object) }
    }

    // ========================================================================
    // Strings
    // ========================================================================

    /// New host string
    pub fn new_string(&self, text: &str) -> RawString {
        unsafe {
            host_fn!(self, string_new_with_utf8_chars_and_len)(
                self.table.host,
                text.as_ptr(),
                text.len(),
            )
        }
    }

    /// Copy a host string into Rust
    pub fn read_string(&self, string: RawString) -> String {
        let f = host_fn!(self, string_to_utf8_chars);
        let host = self.table.host;
        read_utf8(|buf, cap| unsafe { f(host, string, buf, cap) })
    }

    /// Destroy a host string
    pub fn destroy_string(&self, string: RawString) {
        unsafe { host_fn!(self, string_destroy)(self.table.host, string) }
    }

    /// Intern a name on the host
    pub fn new_name(&self, text: &str) -> RawStringName {
        unsafe {
            host_fn!(self, string_name_new_with_utf8_chars_and_len)(
                self.table.host,
                text.as_ptr(),
                text.len(),
            )
        }
    }

    /// Copy a host name into Rust
    pub fn read_name(&self, name: RawStringName) -> String {
        let f = host_fn!(self, string_name_to_utf8_chars);
        let host = self.table.host;
        read_utf8(|buf, cap| unsafe { f(host, name, buf, cap) })
    }

    // ========================================================================
    // Variants and containers
    // ========================================================================

    /// Copy a raw variant the way the engine copies it; the copy owns its
    /// own reference to whatever `value` refers to
    pub fn variant_copy(&self, value: &RawVariant) -> RawVariant {
        let mut out = RawVariant::NIL;
        unsafe { host_fn!(self, variant_new_copy)(self.table.host, &mut out, value) };
        out
    }

    /// Release a raw variant's resources
    pub fn variant_destroy(&self, value: &mut RawVariant) {
        unsafe { host_fn!(self, variant_destroy)(self.table.host, value) }
    }

    /// New empty array
    pub fn array_new(&self) -> RawArray {
        unsafe { host_fn!(self, array_new)(self.table.host) }
    }

    /// Array length
    pub fn array_size(&self, array: RawArray) -> usize {
        unsafe { host_fn!(self, array_size)(self.table.host, array) }
    }

    /// Owned copy of an element
    pub fn array_get(&self, array: RawArray, index: usize) -> RawVariant {
        let mut out = RawVariant::NIL;
        unsafe { host_fn!(self, array_get)(self.table.host, array, index, &mut out) };
        out
    }

    /// Append a copy of `value`
    pub fn array_push(&self, array: RawArray, value: &RawVariant) {
        unsafe { host_fn!(self, array_push)(self.table.host, array, value) }
    }

    /// Destroy an array
    pub fn array_destroy(&self, array: RawArray) {
        unsafe { host_fn!(self, array_destroy)(self.table.host, array) }
    }

    /// New empty dictionary
    pub fn dictionary_new(&self) -> RawDictionary {
        unsafe { host_fn!(self, dictionary_new)(self.table.host) }
    }

    /// Dictionary length
    pub fn dictionary_size(&self, dict: RawDictionary) -> usize {
        unsafe { host_fn!(self, dictionary_size)(self.table.host, dict) }
    }

    /// Owned copies of the entry at insertion position `index`
    pub fn dictionary_entry(&self, dict: RawDictionary, index: usize) -> (RawVariant, RawVariant) {
        let mut key = RawVariant::NIL;
        let mut value = RawVariant::NIL;
        unsafe {
            host_fn!(self, dictionary_key_at)(self.table.host, dict, index, &mut key);
            host_fn!(self, dictionary_value_at)(self.table.host, dict, index, &mut value);
        }
        (key, value)
    }

    /// Insert copies of `key` and `value`
    pub fn dictionary_set(&self, dict: RawDictionary, key: &RawVariant, value: &RawVariant) {
        unsafe { host_fn!(self, dictionary_set)(self.table.host, dict, key, value) }
    }

    /// Destroy a dictionary
    pub fn dictionary_destroy(&self, dict: RawDictionary) {
        unsafe { host_fn!(self, dictionary_destroy)(self.table.host, dict) }
    }

    /// New packed array copied from `len` elements at `data`
    ///
    /// # Safety
    /// `data` must point to `len` elements of kind `element`.
    pub unsafe fn packed_new(&self, element: PackedElement, data: *const c_void, len: usize) -> RawPackedArray {
        host_fn!(self, packed_array_new)(self.table.host, element as u32, data, len)
    }

    /// Borrow packed storage: element kind, length and data pointer
    pub fn packed_data(&self, packed: RawPackedArray) -> (Option<PackedElement>, usize, *const c_void) {
        let mut element = 0u32;
        let mut len = 0usize;
        let data = unsafe {
            host_fn!(self, packed_array_data)(self.table.host, packed, &mut element, &mut len)
        };
        (PackedElement::from_u32(element), len, data)
    }

    /// Destroy a packed array
    pub fn packed_destroy(&self, packed: RawPackedArray) {
        unsafe { host_fn!(self, packed_array_destroy)(self.table.host, packed) }
    }
}

/// Two-pass read of a UTF-8 buffer: ask for the length, then copy
fn read_utf8(mut copy: impl FnMut(*mut u8, usize) -> usize) -> String {
    let len = copy(std::ptr::null_mut(), 0);
    if len == 0 {
        return String::new();
    }
    let mut buf = vec![0u8; len];
    let written = copy(buf.as_mut_ptr(), len).min(len);
    buf.truncate(written);
    match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_incomplete_table() {
        let table = HostInterface::empty(std::ptr::null_mut());
        let err = HostApi::new(table, std::ptr::null_mut()).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingHostFunction("mem_alloc")));
    }

    #[test]
    fn test_rejects_old_major_version() {
        let mut table = HostInterface::empty(std::ptr::null_mut());
        table.version = AbiVersion { major: 3, minor: 0 };
        let err = HostApi::new(table, std::ptr::null_mut()).unwrap_err();
        assert!(matches!(err, RuntimeError::IncompatibleHost { .. }));
    }

    #[test]
    fn test_read_utf8_two_pass() {
        let source = "héllo";
        let text = read_utf8(|buf, cap| {
            if !buf.is_null() {
                let n = source.len().min(cap);
                unsafe { std::ptr::copy_nonoverlapping(source.as_ptr(), buf, n) };
            }
            source.len()
        });
        assert_eq!(text, "héllo");
    }
}
