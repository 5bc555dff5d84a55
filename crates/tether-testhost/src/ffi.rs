//! `extern "C"` entry points of the simulated host
//!
//! Each function recovers the `HostState` from the context pointer and
//! forwards to it. None of them hold the store lock while calling back into
//! the extension.

use std::ffi::c_void;

use tether_sys::{
    CallError, CallableCustomInfo, ClassCreationInfo, ClassMethodInfo, HostCtx, HostInterface,
    InstanceId, PackedElement, PropertyInfo, RawArgs, RawArray, RawDictionary, RawInstance,
    RawMethodBind, RawObject, RawPackedArray, RawRet, RawString, RawStringName, RawVariant,
    RawVariantArgs, ABI_VERSION,
};

use crate::HostState;

unsafe fn state<'a>(ctx: HostCtx) -> &'a HostState {
    &*(ctx as *const HostState)
}

unsafe fn copy_utf8(text: &str, buf: *mut u8, cap: usize) -> usize {
    if !buf.is_null() {
        let n = text.len().min(cap);
        std::ptr::copy_nonoverlapping(text.as_ptr(), buf, n);
    }
    text.len()
}

unsafe fn utf8_arg<'a>(chars: *const u8, len: usize) -> &'a str {
    if chars.is_null() || len == 0 {
        return "";
    }
    std::str::from_utf8(std::slice::from_raw_parts(chars, len)).unwrap_or("")
}

// ============================================================================
// Memory and objects
// ============================================================================

unsafe extern "C" fn mem_alloc(ctx: HostCtx, size: usize) -> *mut c_void {
    state(ctx).with_store(|s| s.alloc(size)) as *mut c_void
}

unsafe extern "C" fn mem_free(ctx: HostCtx, ptr: *mut c_void) {
    state(ctx).with_store(|s| s.free(ptr as usize))
}

unsafe extern "C" fn object_method_bind_ptrcall(
    ctx: HostCtx,
    bind: RawMethodBind,
    object: RawObject,
    args: RawArgs,
    ret: RawRet,
) {
    state(ctx).ptrcall(bind.addr(), object, args, ret)
}

unsafe extern "C" fn object_method_bind_call(
    ctx: HostCtx,
    bind: RawMethodBind,
    object: RawObject,
    args: RawVariantArgs,
    count: i64,
    ret: *mut RawVariant,
    error: *mut CallError,
) {
    let args = variant_args(args, count);
    let (value, err) = match state(ctx).varcall(bind.addr(), object, &args) {
        Ok(value) => (value, CallError::OK),
        Err(err) => (RawVariant::NIL, err),
    };
    ret.write(value);
    error.write(err);
}

/// Bitwise copies of the argument variants; the caller keeps ownership
unsafe fn variant_args(args: RawVariantArgs, count: i64) -> Vec<RawVariant> {
    let count = usize::try_from(count).unwrap_or(0);
    (0..count)
        .map(|i| (*args.add(i)).as_ref().copied().unwrap_or(RawVariant::NIL))
        .collect()
}

unsafe fn property_slice<'a>(info: *const PropertyInfo, count: usize) -> &'a [PropertyInfo] {
    if info.is_null() || count == 0 {
        return &[];
    }
    std::slice::from_raw_parts(info, count)
}

unsafe extern "C" fn object_destroy(ctx: HostCtx, object: RawObject) {
    state(ctx).destroy(object)
}

unsafe extern "C" fn object_get_instance_id(ctx: HostCtx, object: RawObject) -> InstanceId {
    state(ctx).instance_id(object)
}

unsafe extern "C" fn object_get_instance_from_id(ctx: HostCtx, id: InstanceId) -> RawObject {
    state(ctx).object_from_id(id)
}

unsafe extern "C" fn object_cast_to(
    ctx: HostCtx,
    object: RawObject,
    class: RawStringName,
) -> RawObject {
    state(ctx).cast_to(object, class)
}

unsafe extern "C" fn object_set_instance(
    ctx: HostCtx,
    object: RawObject,
    class: RawStringName,
    instance: RawInstance,
) {
    state(ctx).set_instance(object, class, instance)
}

unsafe extern "C" fn global_get_singleton(ctx: HostCtx, name: RawStringName) -> RawObject {
    state(ctx).singleton(name)
}

// ============================================================================
// Class database
// ============================================================================

unsafe extern "C" fn classdb_construct_object(ctx: HostCtx, class: RawStringName) -> RawObject {
    let host = state(ctx);
    match host.name_content(class) {
        Some(class) => host.construct(&class),
        None => RawObject::NULL,
    }
}

unsafe extern "C" fn classdb_get_method_bind(
    ctx: HostCtx,
    class: RawStringName,
    method: RawStringName,
    hash: i64,
) -> RawMethodBind {
    RawMethodBind::from_addr(state(ctx).method_bind(class, method, hash))
}

unsafe extern "C" fn classdb_register_extension_class(
    ctx: HostCtx,
    _library: *mut c_void,
    class: RawStringName,
    parent: RawStringName,
    info: *const ClassCreationInfo,
) -> bool {
    match info.as_ref() {
        Some(info) => state(ctx).register_class(class, parent, info),
        None => false,
    }
}

unsafe extern "C" fn classdb_register_extension_class_method(
    ctx: HostCtx,
    _library: *mut c_void,
    class: RawStringName,
    info: *const ClassMethodInfo,
) -> bool {
    let Some(info) = info.as_ref() else {
        return false;
    };
    let args = property_slice(info.arguments_info, info.argument_count as usize);
    let ret = if info.has_return_value {
        info.return_value_info.as_ref()
    } else {
        None
    };
    state(ctx).register_method(class, info, args, ret)
}

unsafe extern "C" fn classdb_register_extension_class_property(
    ctx: HostCtx,
    _library: *mut c_void,
    class: RawStringName,
    info: *const PropertyInfo,
    setter: RawStringName,
    getter: RawStringName,
) -> bool {
    match info.as_ref() {
        Some(info) => state(ctx).register_property(class, info, setter, getter),
        None => false,
    }
}

unsafe extern "C" fn classdb_register_extension_class_signal(
    ctx: HostCtx,
    _library: *mut c_void,
    class: RawStringName,
    signal: RawStringName,
    args: *const PropertyInfo,
    count: usize,
) -> bool {
    state(ctx).register_signal(class, signal, property_slice(args, count))
}

unsafe extern "C" fn classdb_register_extension_class_integer_constant(
    ctx: HostCtx,
    _library: *mut c_void,
    class: RawStringName,
    enum_name: RawStringName,
    constant: RawStringName,
    value: i64,
    is_bitfield: bool,
) -> bool {
    state(ctx).register_constant(class, enum_name, constant, value, is_bitfield)
}

unsafe extern "C" fn callable_custom_create(
    ctx: HostCtx,
    out: *mut RawVariant,
    info: *const CallableCustomInfo,
) {
    let value = match info.as_ref() {
        Some(info) => state(ctx).create_callable(info),
        None => RawVariant::NIL,
    };
    out.write(value);
}

unsafe extern "C" fn classdb_unregister_extension_class(
    ctx: HostCtx,
    _library: *mut c_void,
    class: RawStringName,
) {
    state(ctx).unregister_class(class)
}

unsafe extern "C" fn ref_reference(ctx: HostCtx, object: RawObject) -> bool {
    state(ctx).reference(object)
}

unsafe extern "C" fn ref_unreference(ctx: HostCtx, object: RawObject) -> bool {
    state(ctx).unreference(object)
}

// ============================================================================
// Strings and names
// ============================================================================

unsafe extern "C" fn string_new_with_utf8_chars_and_len(
    ctx: HostCtx,
    chars: *const u8,
    len: usize,
) -> RawString {
    state(ctx).new_string(utf8_arg(chars, len))
}

unsafe extern "C" fn string_to_utf8_chars(
    ctx: HostCtx,
    string: RawString,
    buf: *mut u8,
    cap: usize,
) -> usize {
    let text = state(ctx).string_content(string).unwrap_or_default();
    copy_utf8(&text, buf, cap)
}

unsafe extern "C" fn string_destroy(ctx: HostCtx, string: RawString) {
    state(ctx).destroy_string(string)
}

unsafe extern "C" fn string_name_new_with_utf8_chars_and_len(
    ctx: HostCtx,
    chars: *const u8,
    len: usize,
) -> RawStringName {
    state(ctx).intern(utf8_arg(chars, len))
}

unsafe extern "C" fn string_name_to_utf8_chars(
    ctx: HostCtx,
    name: RawStringName,
    buf: *mut u8,
    cap: usize,
) -> usize {
    let text = state(ctx).name_content(name).unwrap_or_default();
    copy_utf8(&text, buf, cap)
}

// ============================================================================
// Variants and containers
// ============================================================================

unsafe extern "C" fn variant_new_copy(ctx: HostCtx, dst: *mut RawVariant, src: *const RawVariant) {
    let copy = state(ctx).copy_variant(&*src);
    dst.write(copy);
}

unsafe extern "C" fn variant_destroy(ctx: HostCtx, value: *mut RawVariant) {
    state(ctx).destroy_variant(&mut *value)
}

unsafe extern "C" fn array_new(ctx: HostCtx) -> RawArray {
    RawArray::from_addr(state(ctx).with_store(|s| {
        let addr = s.next_addr();
        s.arrays.insert(addr, Vec::new());
        addr
    }))
}

unsafe extern "C" fn array_size(ctx: HostCtx, array: RawArray) -> usize {
    state(ctx).with_store(|s| s.arrays.get(&array.addr()).map_or(0, Vec::len))
}

unsafe extern "C" fn array_get(ctx: HostCtx, array: RawArray, index: usize, out: *mut RawVariant) {
    let copy = state(ctx).with_store(|s| {
        let element = s.arrays.get(&array.addr()).and_then(|a| a.get(index)).copied();
        element.map_or(RawVariant::NIL, |e| s.copy_variant(&e))
    });
    out.write(copy);
}

unsafe extern "C" fn array_push(ctx: HostCtx, array: RawArray, value: *const RawVariant) {
    let value = *value;
    state(ctx).with_store(|s| {
        let copy = s.copy_variant(&value);
        match s.arrays.get_mut(&array.addr()) {
            Some(elements) => elements.push(copy),
            None => {
                let mut copy = copy;
                s.destroy_variant(&mut copy);
                s.invalid_frees += 1;
            }
        }
    })
}

unsafe extern "C" fn array_destroy(ctx: HostCtx, array: RawArray) {
    state(ctx).with_store(|s| s.destroy_array(array.addr()))
}

unsafe extern "C" fn dictionary_new(ctx: HostCtx) -> RawDictionary {
    RawDictionary::from_addr(state(ctx).with_store(|s| {
        let addr = s.next_addr();
        s.dictionaries.insert(addr, Vec::new());
        addr
    }))
}

unsafe extern "C" fn dictionary_size(ctx: HostCtx, dict: RawDictionary) -> usize {
    state(ctx).with_store(|s| s.dictionaries.get(&dict.addr()).map_or(0, Vec::len))
}

unsafe extern "C" fn dictionary_key_at(
    ctx: HostCtx,
    dict: RawDictionary,
    index: usize,
    out: *mut RawVariant,
) {
    let copy = state(ctx).with_store(|s| {
        let key = s
            .dictionaries
            .get(&dict.addr())
            .and_then(|d| d.get(index))
            .map(|(k, _)| *k);
        key.map_or(RawVariant::NIL, |k| s.copy_variant(&k))
    });
    out.write(copy);
}

unsafe extern "C" fn dictionary_value_at(
    ctx: HostCtx,
    dict: RawDictionary,
    index: usize,
    out: *mut RawVariant,
) {
    let copy = state(ctx).with_store(|s| {
        let value = s
            .dictionaries
            .get(&dict.addr())
            .and_then(|d| d.get(index))
            .map(|(_, v)| *v);
        value.map_or(RawVariant::NIL, |v| s.copy_variant(&v))
    });
    out.write(copy);
}

unsafe extern "C" fn dictionary_set(
    ctx: HostCtx,
    dict: RawDictionary,
    key: *const RawVariant,
    value: *const RawVariant,
) {
    let (key, value) = (*key, *value);
    state(ctx).with_store(|s| {
        let Some(entries) = s.dictionaries.get(&dict.addr()).cloned() else {
            s.invalid_frees += 1;
            return;
        };
        let position = entries.iter().position(|(k, _)| s.variant_key_eq(k, &key));
        let value_copy = s.copy_variant(&value);
        match position {
            Some(i) => {
                let mut old = entries[i].1;
                s.destroy_variant(&mut old);
                if let Some(d) = s.dictionaries.get_mut(&dict.addr()) {
                    d[i].1 = value_copy;
                }
            }
            None => {
                let key_copy = s.copy_variant(&key);
                if let Some(d) = s.dictionaries.get_mut(&dict.addr()) {
                    d.push((key_copy, value_copy));
                }
            }
        }
    })
}

unsafe extern "C" fn dictionary_destroy(ctx: HostCtx, dict: RawDictionary) {
    state(ctx).with_store(|s| s.destroy_dictionary(dict.addr()))
}

unsafe extern "C" fn packed_array_new(
    ctx: HostCtx,
    element: u32,
    data: *const c_void,
    len: usize,
) -> RawPackedArray {
    let Some(element) = PackedElement::from_u32(element) else {
        return RawPackedArray::NULL;
    };
    RawPackedArray::from_addr(
        state(ctx).with_store(|s| s.new_packed(element, data as *const u8, len)),
    )
}

unsafe extern "C" fn packed_array_data(
    ctx: HostCtx,
    packed: RawPackedArray,
    element_out: *mut u32,
    len_out: *mut usize,
) -> *const c_void {
    state(ctx).with_store(|s| match s.packed.get(&packed.addr()) {
        Some(record) => {
            element_out.write(record.element as u32);
            len_out.write(record.len);
            record.words.as_ptr() as *const c_void
        }
        None => {
            len_out.write(0);
            std::ptr::null()
        }
    })
}

unsafe extern "C" fn packed_array_destroy(ctx: HostCtx, packed: RawPackedArray) {
    state(ctx).with_store(|s| s.destroy_packed(packed.addr()))
}

/// Fully populated function table for a host context
pub(crate) fn interface(host: HostCtx) -> HostInterface {
    HostInterface {
        host,
        version: ABI_VERSION,
        mem_alloc: Some(mem_alloc),
        mem_free: Some(mem_free),
        object_method_bind_ptrcall: Some(object_method_bind_ptrcall),
        object_method_bind_call: Some(object_method_bind_call),
        object_destroy: Some(object_destroy),
        object_get_instance_id: Some(object_get_instance_id),
        object_get_instance_from_id: Some(object_get_instance_from_id),
        object_cast_to: Some(object_cast_to),
        object_set_instance: Some(object_set_instance),
        global_get_singleton: Some(global_get_singleton),
        classdb_construct_object: Some(classdb_construct_object),
        classdb_get_method_bind: Some(classdb_get_method_bind),
        classdb_register_extension_class: Some(classdb_register_extension_class),
        classdb_unregister_extension_class: Some(classdb_unregister_extension_class),
        classdb_register_extension_class_method: Some(classdb_register_extension_class_method),
        classdb_register_extension_class_property: Some(classdb_register_extension_class_property),
        classdb_register_extension_class_signal: Some(classdb_register_extension_class_signal),
        classdb_register_extension_class_integer_constant: Some(
            classdb_register_extension_class_integer_constant,
        ),
        callable_custom_create: Some(callable_custom_create),
        ref_reference: Some(ref_reference),
        ref_unreference: Some(ref_unreference),
        string_new_with_utf8_chars_and_len: Some(string_new_with_utf8_chars_and_len),
        string_to_utf8_chars: Some(string_to_utf8_chars),
        string_destroy: Some(string_destroy),
        string_name_new_with_utf8_chars_and_len: Some(string_name_new_with_utf8_chars_and_len),
        string_name_to_utf8_chars: Some(string_name_to_utf8_chars),
        variant_new_copy: Some(variant_new_copy),
        variant_destroy: Some(variant_destroy),
        array_new: Some(array_new),
        array_size: Some(array_size),
        array_get: Some(array_get),
        array_push: Some(array_push),
        array_destroy: Some(array_destroy),
        dictionary_new: Some(dictionary_new),
        dictionary_size: Some(dictionary_size),
        dictionary_key_at: Some(dictionary_key_at),
        dictionary_value_at: Some(dictionary_value_at),
        dictionary_set: Some(dictionary_set),
        dictionary_destroy: Some(dictionary_destroy),
        packed_array_new: Some(packed_array_new),
        packed_array_data: Some(packed_array_data),
        packed_array_destroy: Some(packed_array_destroy),
    }
}

#[cfg(test)]
mod tests {
    use crate::TestHost;

    #[test]
    fn test_interface_is_complete() {
        let host = TestHost::new();
        assert!(host.interface().missing_functions().is_empty());
    }

    #[test]
    fn test_refcount_reaches_zero() {
        let host = TestHost::new();
        let table = host.interface();
        let obj = host.construct("Resource");
        unsafe {
            assert!(table.ref_reference.unwrap()(table.host, obj));
            assert!(table.ref_reference.unwrap()(table.host, obj));
            assert!(!table.ref_unreference.unwrap()(table.host, obj));
            assert!(table.ref_unreference.unwrap()(table.host, obj));
        }
        assert_eq!(host.refcount(obj), Some(0));
        assert_eq!(host.ref_increments(), 2);
        assert_eq!(host.over_releases(), 0);
    }

    #[test]
    fn test_nested_variant_copy_and_destroy() {
        use tether_sys::{RawVariant, VariantType};
        let host = TestHost::new();
        let table = host.interface();
        let text = host.new_string("inner");
        unsafe {
            let array = table.array_new.unwrap()(table.host);
            let element = RawVariant::new(VariantType::String, [text.addr() as u64, 0]);
            table.array_push.unwrap()(table.host, array, &element);
            let outer = RawVariant::new(VariantType::Array, [array.addr() as u64, 0]);
            let mut copy = host.copy_variant(&outer);
            assert_eq!(host.live_containers(), 2);
            host.destroy_variant(&mut copy);
            let mut outer = outer;
            host.destroy_variant(&mut outer);
        }
        host.destroy_string(text);
        assert_eq!(host.live_containers(), 0);
        assert_eq!(host.live_strings(), 0);
        assert_eq!(host.invalid_frees(), 0);
    }
}
