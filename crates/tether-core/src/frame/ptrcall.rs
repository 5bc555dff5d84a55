//! Per-type slot codecs
//!
//! Every argument slot and the return slot hold the value itself, never a
//! pointer to it: a `bool` is one byte, an `i16` two, a `Transform3D` its
//! full 48 bytes. Reference types (strings, containers, packed arrays) put
//! their host handle in the slot.
//!
//! Four directions, two on each side of a call:
//!
//! | direction   | side   | ownership                                      |
//! |-------------|--------|------------------------------------------------|
//! | `write_arg` | caller | creates host temporaries, destroyed at free    |
//! | `read_ret`  | caller | takes the engine's result and destroys it      |
//! | `read_arg`  | callee | copies an engine argument, engine keeps it     |
//! | `write_ret` | callee | creates host values the engine takes over      |

use std::ffi::c_void;

use tether_sys::{
    InstanceId, RawArray, RawDictionary, RawObject, RawPackedArray, RawString, RawStringName,
    RawVariant, VariantType,
};

use crate::error::ConversionResult;
use crate::handle::{Class, ManagedHandle};
use crate::name::StringName;
use crate::variant::bridge::{PackedCodec, VariantBridge};
use crate::variant::{
    Aabb, Basis, Color, Dictionary, NodePath, ObjectRef, PackedElementType, Plane, Projection,
    Quaternion, Rect2, Rect2i, Rid, Transform2D, Transform3D, Variant, VariantKind, Vector2,
    Vector2i, Vector3, Vector3i, Vector4, Vector4i,
};

/// Encodes a value into an argument slot
pub trait PtrArg {
    /// Write `self` into `slot`. Host resources the slot refers to are
    /// returned as a raw variant the frame destroys after the call.
    ///
    /// # Safety
    /// `slot` must point to a writable, 16-aligned argument slot.
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant>;
}

/// Full codec for types that can also be returned and received
pub trait PtrCall: PtrArg + Sized {
    /// Bytes the encoded value occupies in a slot
    const RAW_SIZE: usize;

    /// Variant kind the engine sees for this type; `Nil` accepts any value
    const KIND: VariantKind;

    /// Decode a result the caller now owns, destroying its host resources
    ///
    /// # Safety
    /// `slot` must hold a value of this type written by the engine.
    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self>;

    /// Decode an argument the engine keeps owning
    ///
    /// # Safety
    /// `slot` must hold a value of this type written by the engine.
    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self>;

    /// Encode a result; the engine takes ownership of any host resources
    ///
    /// # Safety
    /// `slot` must point to a writable return slot sized for this type.
    unsafe fn write_ret(self, bridge: &VariantBridge, slot: *mut c_void);

    /// Zero the encoded bytes of a return slot. Zero is the default for
    /// plain data and the null handle for reference types, so this needs no
    /// host.
    ///
    /// # Safety
    /// `slot` must point to a writable return slot sized for this type.
    unsafe fn write_zeroed_ret(slot: *mut c_void) {
        std::ptr::write_bytes(slot as *mut u8, 0, Self::RAW_SIZE);
    }
}

impl<T: PtrArg + ?Sized> PtrArg for &T {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        (**self).write_arg(bridge, slot)
    }
}

unsafe fn put<T>(slot: *mut c_void, value: T) {
    (slot as *mut T).write_unaligned(value)
}

unsafe fn get<T>(slot: *const c_void) -> T {
    (slot as *const T).read_unaligned()
}

// ============================================================================
// Plain data
// ============================================================================

macro_rules! pod_ptrcall {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl PtrArg for $ty {
                unsafe fn write_arg(&self, _: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
                    put(slot, *self);
                    None
                }
            }

            impl PtrCall for $ty {
                const RAW_SIZE: usize = std::mem::size_of::<$ty>();
                const KIND: VariantKind = VariantKind::$kind;

                unsafe fn read_ret(_: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
                    Ok(get(slot))
                }

                unsafe fn read_arg(_: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
                    Ok(get(slot))
                }

                unsafe fn write_ret(self, _: &VariantBridge, slot: *mut c_void) {
                    put(slot, self)
                }
            }
        )*
    };
}

pod_ptrcall!(
    i8 => Int, i16 => Int, i32 => Int, i64 => Int,
    u8 => Int, u16 => Int, u32 => Int, u64 => Int,
    f32 => Float, f64 => Float,
    Vector2 => Vector2, Vector2i => Vector2i, Rect2 => Rect2, Rect2i => Rect2i,
    Vector3 => Vector3, Vector3i => Vector3i, Transform2D => Transform2D,
    Vector4 => Vector4, Vector4i => Vector4i, Plane => Plane, Quaternion => Quaternion,
    Aabb => Aabb, Basis => Basis, Transform3D => Transform3D, Projection => Projection,
    Color => Color, Rid => Rid, InstanceId => Int, RawObject => Object,
);

// Engine booleans are one byte; anything non-zero is true.
impl PtrArg for bool {
    unsafe fn write_arg(&self, _: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        put(slot, *self as u8);
        None
    }
}

impl PtrCall for bool {
    const RAW_SIZE: usize = 1;
    const KIND: VariantKind = VariantKind::Bool;

    unsafe fn read_ret(_: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        Ok(get::<u8>(slot) != 0)
    }

    unsafe fn read_arg(_: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        Ok(get::<u8>(slot) != 0)
    }

    unsafe fn write_ret(self, _: &VariantBridge, slot: *mut c_void) {
        put(slot, self as u8)
    }
}

impl PtrArg for () {
    unsafe fn write_arg(&self, _: &VariantBridge, _: *mut c_void) -> Option<RawVariant> {
        None
    }
}

impl PtrCall for () {
    const RAW_SIZE: usize = 0;
    const KIND: VariantKind = VariantKind::Nil;

    unsafe fn read_ret(_: &VariantBridge, _: *const c_void) -> ConversionResult<Self> {
        Ok(())
    }

    unsafe fn read_arg(_: &VariantBridge, _: *const c_void) -> ConversionResult<Self> {
        Ok(())
    }

    unsafe fn write_ret(self, _: &VariantBridge, _: *mut c_void) {}
}

// ============================================================================
// Strings and names
// ============================================================================

fn temporary_string(raw: RawString) -> Option<RawVariant> {
    Some(RawVariant::new(VariantType::String, [raw.addr() as u64, 0]))
}

unsafe fn take_string(bridge: &VariantBridge, slot: *const c_void) -> String {
    let raw: RawString = get(slot);
    if raw.is_null() {
        return String::new();
    }
    let text = bridge.host().read_string(raw);
    bridge.host().destroy_string(raw);
    text
}

unsafe fn peek_string(bridge: &VariantBridge, slot: *const c_void) -> String {
    let raw: RawString = get(slot);
    if raw.is_null() {
        return String::new();
    }
    bridge.host().read_string(raw)
}

impl PtrArg for str {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        let raw = bridge.host().new_string(self);
        put(slot, raw);
        temporary_string(raw)
    }
}

impl PtrArg for String {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        self.as_str().write_arg(bridge, slot)
    }
}

impl PtrCall for String {
    const RAW_SIZE: usize = std::mem::size_of::<RawString>();
    const KIND: VariantKind = VariantKind::String;

    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        Ok(take_string(bridge, slot))
    }

    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        Ok(peek_string(bridge, slot))
    }

    unsafe fn write_ret(self, bridge: &VariantBridge, slot: *mut c_void) {
        put(slot, bridge.host().new_string(&self))
    }
}

impl PtrArg for NodePath {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        self.as_str().write_arg(bridge, slot)
    }
}

impl PtrCall for NodePath {
    const RAW_SIZE: usize = std::mem::size_of::<RawString>();
    const KIND: VariantKind = VariantKind::NodePath;

    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        Ok(NodePath(take_string(bridge, slot)))
    }

    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        Ok(NodePath(peek_string(bridge, slot)))
    }

    unsafe fn write_ret(self, bridge: &VariantBridge, slot: *mut c_void) {
        put(slot, bridge.host().new_string(self.as_str()))
    }
}

// Host names are never freed, so names need no temporaries.
impl PtrArg for StringName {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        put(slot, bridge.names().to_raw(self, bridge.host()));
        None
    }
}

impl PtrCall for StringName {
    const RAW_SIZE: usize = std::mem::size_of::<RawStringName>();
    const KIND: VariantKind = VariantKind::StringName;

    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        Self::read_arg(bridge, slot)
    }

    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        let raw: RawStringName = get(slot);
        Ok(bridge.names().from_raw(raw, bridge.host()))
    }

    unsafe fn write_ret(self, bridge: &VariantBridge, slot: *mut c_void) {
        self.write_arg(bridge, slot);
    }
}

// ============================================================================
// Variants and containers
// ============================================================================

impl PtrArg for Variant {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        let raw = bridge.to_raw(self);
        put(slot, raw);
        Some(raw)
    }
}

impl PtrCall for Variant {
    const RAW_SIZE: usize = std::mem::size_of::<RawVariant>();
    const KIND: VariantKind = VariantKind::Nil;

    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        bridge.from_raw_owned(get(slot))
    }

    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        bridge.from_raw_borrowed(&get(slot))
    }

    unsafe fn write_ret(self, bridge: &VariantBridge, slot: *mut c_void) {
        put(slot, bridge.to_raw(&self))
    }
}

impl PtrArg for [Variant] {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        let array = bridge.new_array(self);
        put(slot, array);
        Some(RawVariant::new(VariantType::Array, [array.addr() as u64, 0]))
    }
}

impl PtrArg for Vec<Variant> {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        self.as_slice().write_arg(bridge, slot)
    }
}

impl PtrCall for Vec<Variant> {
    const RAW_SIZE: usize = std::mem::size_of::<RawArray>();
    const KIND: VariantKind = VariantKind::Array;

    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        let array: RawArray = get(slot);
        if array.is_null() {
            return Ok(Vec::new());
        }
        let items = bridge.read_array(array);
        bridge.host().array_destroy(array);
        items
    }

    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        let array: RawArray = get(slot);
        if array.is_null() {
            return Ok(Vec::new());
        }
        bridge.read_array(array)
    }

    unsafe fn write_ret(self, bridge: &VariantBridge, slot: *mut c_void) {
        put(slot, bridge.new_array(&self))
    }
}

impl PtrArg for Dictionary {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        let dict = bridge.new_dictionary(self);
        put(slot, dict);
        Some(RawVariant::new(VariantType::Dictionary, [dict.addr() as u64, 0]))
    }
}

impl PtrCall for Dictionary {
    const RAW_SIZE: usize = std::mem::size_of::<RawDictionary>();
    const KIND: VariantKind = VariantKind::Dictionary;

    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        let dict: RawDictionary = get(slot);
        if dict.is_null() {
            return Ok(Dictionary::new());
        }
        let out = bridge.read_dictionary(dict);
        bridge.host().dictionary_destroy(dict);
        out
    }

    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        let dict: RawDictionary = get(slot);
        if dict.is_null() {
            return Ok(Dictionary::new());
        }
        bridge.read_dictionary(dict)
    }

    unsafe fn write_ret(self, bridge: &VariantBridge, slot: *mut c_void) {
        put(slot, bridge.new_dictionary(&self))
    }
}

impl<T: PackedCodec> PtrArg for [T] {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        let packed = T::pack(bridge, self);
        put(slot, packed);
        Some(RawVariant::new(T::KIND, [packed.addr() as u64, 0]))
    }
}

impl<T: PackedCodec> PtrArg for Vec<T> {
    unsafe fn write_arg(&self, bridge: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        self.as_slice().write_arg(bridge, slot)
    }
}

impl<T: PackedCodec> PtrCall for Vec<T> {
    const RAW_SIZE: usize = std::mem::size_of::<RawPackedArray>();
    const KIND: VariantKind = <T as PackedElementType>::KIND;

    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        let packed: RawPackedArray = get(slot);
        if packed.is_null() {
            return Ok(Vec::new());
        }
        let values = T::unpack(bridge, packed);
        bridge.host().packed_destroy(packed);
        values
    }

    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        let packed: RawPackedArray = get(slot);
        if packed.is_null() {
            return Ok(Vec::new());
        }
        T::unpack(bridge, packed)
    }

    unsafe fn write_ret(self, bridge: &VariantBridge, slot: *mut c_void) {
        put(slot, T::pack(bridge, &self))
    }
}

// ============================================================================
// Objects
// ============================================================================

impl PtrArg for ObjectRef {
    unsafe fn write_arg(&self, _: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        put(slot, self.raw);
        None
    }
}

impl PtrCall for ObjectRef {
    const RAW_SIZE: usize = std::mem::size_of::<RawObject>();
    const KIND: VariantKind = VariantKind::Object;

    unsafe fn read_ret(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        Self::read_arg(bridge, slot)
    }

    unsafe fn read_arg(bridge: &VariantBridge, slot: *const c_void) -> ConversionResult<Self> {
        let raw: RawObject = get(slot);
        if raw.is_null() {
            return Ok(ObjectRef::NULL);
        }
        Ok(ObjectRef {
            raw,
            id: bridge.host().instance_id(raw),
        })
    }

    unsafe fn write_ret(self, _: &VariantBridge, slot: *mut c_void) {
        put(slot, self.raw)
    }
}

impl<C: Class> PtrArg for ManagedHandle<'_, C> {
    unsafe fn write_arg(&self, _: &VariantBridge, slot: *mut c_void) -> Option<RawVariant> {
        put(slot, self.as_raw());
        None
    }
}
