//! Raw variant conversion
//!
//! [`VariantBridge::to_raw`] produces a raw variant that owns fresh host
//! resources (strings, containers, boxed math payloads). Whoever ends up
//! holding it must either destroy it or hand it to the engine.
//!
//! Reading comes in two flavours. [`VariantBridge::from_raw_owned`] consumes
//! the raw value and destroys it, whether or not the conversion succeeds.
//! [`VariantBridge::from_raw_borrowed`] only reads, for values the engine
//! still owns.

use std::ffi::c_void;
use std::mem::size_of;
use std::sync::Arc;

use tether_sys::{
    InstanceId, PackedElement, RawArray, RawDictionary, RawObject, RawPackedArray, RawString,
    RawStringName, RawVariant, VariantType,
};

use super::{
    Aabb, Basis, Callable, Color, Dictionary, NodePath, ObjectRef, PackedElementType,
    Projection, Rid, Signal, Transform2D, Transform3D, Variant, Vector2, Vector3, Vector4,
};
use crate::error::{ConversionError, ConversionErrorKind, ConversionResult};
use crate::host::HostApi;
use crate::name::NameInterner;

/// Nesting limit for containers read from the host. Engine arrays can
/// contain themselves.
pub const MAX_DEPTH: usize = 64;

/// Converts between [`Variant`] and [`RawVariant`] using host primitives
pub struct VariantBridge {
    host: Arc<HostApi>,
    names: Arc<NameInterner>,
}

impl VariantBridge {
    /// Create a bridge over a host
    pub fn new(host: Arc<HostApi>, names: Arc<NameInterner>) -> Self {
        Self { host, names }
    }

    /// Host used for conversions
    pub fn host(&self) -> &HostApi {
        &self.host
    }

    /// Name table used for StringName conversions
    pub fn names(&self) -> &NameInterner {
        &self.names
    }

    /// Release a raw variant's host resources
    pub fn destroy(&self, raw: &mut RawVariant) {
        self.host.variant_destroy(raw);
    }

    // ========================================================================
    // Managed -> raw
    // ========================================================================

    /// Encode a variant. The result owns new host resources.
    pub fn to_raw(&self, value: &Variant) -> RawVariant {
        let ty = value.kind();
        match value {
            Variant::Nil => RawVariant::NIL,
            Variant::Bool(b) => RawVariant::new(ty, [*b as u64, 0]),
            Variant::Int(i) => RawVariant::new(ty, [*i as u64, 0]),
            Variant::Float(f) => RawVariant::new(ty, [f.to_bits(), 0]),
            Variant::String(s) => RawVariant::new(ty, [self.host.new_string(s).addr() as u64, 0]),
            Variant::NodePath(p) => {
                RawVariant::new(ty, [self.host.new_string(p.as_str()).addr() as u64, 0])
            }
            Variant::Vector2(v) => inline(ty, v),
            Variant::Vector2i(v) => inline(ty, v),
            Variant::Rect2(v) => inline(ty, v),
            Variant::Rect2i(v) => inline(ty, v),
            Variant::Vector3(v) => inline(ty, v),
            Variant::Vector3i(v) => inline(ty, v),
            Variant::Vector4(v) => inline(ty, v),
            Variant::Vector4i(v) => inline(ty, v),
            Variant::Plane(v) => inline(ty, v),
            Variant::Quaternion(v) => inline(ty, v),
            Variant::Color(v) => inline(ty, v),
            Variant::Transform2D(v) => self.boxed(ty, v),
            Variant::Aabb(v) => self.boxed(ty, v),
            Variant::Basis(v) => self.boxed(ty, v),
            Variant::Transform3D(v) => self.boxed(ty, v),
            Variant::Projection(v) => self.boxed(ty, v),
            Variant::StringName(name) => {
                RawVariant::new(ty, [self.names.to_raw(name, &self.host).addr() as u64, 0])
            }
            Variant::Rid(rid) => RawVariant::new(ty, [rid.0, 0]),
            Variant::Object(obj) => RawVariant::new(ty, [obj.raw.addr() as u64, obj.id.0]),
            // Callables may be reference counted by the engine; the copy
            // takes a reference of its own
            Variant::Callable(c) => self.host.variant_copy(&RawVariant::new(
                ty,
                [c.target.0, self.names.to_raw(&c.method, &self.host).addr() as u64],
            )),
            Variant::Signal(s) => RawVariant::new(
                ty,
                [s.source.0, self.names.to_raw(&s.name, &self.host).addr() as u64],
            ),
            Variant::Array(items) => RawVariant::new(ty, [self.new_array(items).addr() as u64, 0]),
            Variant::Dictionary(dict) => {
                RawVariant::new(ty, [self.new_dictionary(dict).addr() as u64, 0])
            }
            Variant::PackedByteArray(v) => self.packed_variant(ty, v),
            Variant::PackedInt32Array(v) => self.packed_variant(ty, v),
            Variant::PackedInt64Array(v) => self.packed_variant(ty, v),
            Variant::PackedFloat32Array(v) => self.packed_variant(ty, v),
            Variant::PackedFloat64Array(v) => self.packed_variant(ty, v),
            Variant::PackedStringArray(v) => self.packed_variant(ty, v),
            Variant::PackedVector2Array(v) => self.packed_variant(ty, v),
            Variant::PackedVector3Array(v) => self.packed_variant(ty, v),
            Variant::PackedColorArray(v) => self.packed_variant(ty, v),
            Variant::PackedVector4Array(v) => self.packed_variant(ty, v),
        }
    }

    /// New host array holding encoded copies of `items`
    pub fn new_array(&self, items: &[Variant]) -> RawArray {
        let array = self.host.array_new();
        for item in items {
            let mut raw = self.to_raw(item);
            self.host.array_push(array, &raw);
            self.host.variant_destroy(&mut raw);
        }
        array
    }

    /// New host dictionary holding encoded copies of `dict`, in order
    pub fn new_dictionary(&self, dict: &Dictionary) -> RawDictionary {
        let raw_dict = self.host.dictionary_new();
        for (key, value) in dict.iter() {
            let mut k = self.to_raw(key);
            let mut v = self.to_raw(value);
            self.host.dictionary_set(raw_dict, &k, &v);
            self.host.variant_destroy(&mut k);
            self.host.variant_destroy(&mut v);
        }
        raw_dict
    }

    fn boxed<T: Copy>(&self, ty: VariantType, value: &T) -> RawVariant {
        let ptr = self.host.alloc(size_of::<T>()) as *mut T;
        // SAFETY: host memory is 16-aligned and sized for T
        unsafe { ptr.write(*value) };
        RawVariant::new(ty, [ptr as u64, 0])
    }

    fn packed_variant<T: PackedCodec>(&self, ty: VariantType, values: &[T]) -> RawVariant {
        RawVariant::new(ty, [T::pack(self, values).addr() as u64, 0])
    }

    // ========================================================================
    // Raw -> managed
    // ========================================================================

    /// Decode and destroy a raw variant
    pub fn from_raw_owned(&self, raw: RawVariant) -> ConversionResult<Variant> {
        self.owned(raw, 0)
    }

    /// Decode a raw variant the engine keeps owning
    pub fn from_raw_borrowed(&self, raw: &RawVariant) -> ConversionResult<Variant> {
        self.read(raw, 0)
    }

    fn owned(&self, mut raw: RawVariant, depth: usize) -> ConversionResult<Variant> {
        let result = self.read(&raw, depth);
        self.host.variant_destroy(&mut raw);
        result
    }

    fn read(&self, raw: &RawVariant, depth: usize) -> ConversionResult<Variant> {
        if depth > MAX_DEPTH {
            return Err(ConversionError::new(ConversionErrorKind::MaxDepthExceeded));
        }
        let ty = raw
            .variant_type()
            .ok_or_else(|| ConversionError::new(ConversionErrorKind::UnknownTag(raw.tag)))?;
        let p0 = raw.payload[0];
        let value = match ty {
            VariantType::Nil => Variant::Nil,
            VariantType::Bool => Variant::Bool(p0 != 0),
            VariantType::Int => Variant::Int(p0 as i64),
            VariantType::Float => Variant::Float(f64::from_bits(p0)),
            VariantType::String => {
                Variant::String(self.host.read_string(RawString::from_addr(p0 as usize)))
            }
            VariantType::NodePath => {
                Variant::NodePath(NodePath(self.host.read_string(RawString::from_addr(p0 as usize))))
            }
            VariantType::Vector2 => Variant::Vector2(read_inline(raw)),
            VariantType::Vector2i => Variant::Vector2i(read_inline(raw)),
            VariantType::Rect2 => Variant::Rect2(read_inline(raw)),
            VariantType::Rect2i => Variant::Rect2i(read_inline(raw)),
            VariantType::Vector3 => Variant::Vector3(read_inline(raw)),
            VariantType::Vector3i => Variant::Vector3i(read_inline(raw)),
            VariantType::Vector4 => Variant::Vector4(read_inline(raw)),
            VariantType::Vector4i => Variant::Vector4i(read_inline(raw)),
            VariantType::Plane => Variant::Plane(read_inline(raw)),
            VariantType::Quaternion => Variant::Quaternion(read_inline(raw)),
            VariantType::Color => Variant::Color(read_inline(raw)),
            VariantType::Transform2D => Variant::Transform2D(read_boxed::<Transform2D>(raw, ty)?),
            VariantType::Aabb => Variant::Aabb(read_boxed::<Aabb>(raw, ty)?),
            VariantType::Basis => Variant::Basis(read_boxed::<Basis>(raw, ty)?),
            VariantType::Transform3D => Variant::Transform3D(read_boxed::<Transform3D>(raw, ty)?),
            VariantType::Projection => Variant::Projection(read_boxed::<Projection>(raw, ty)?),
            VariantType::StringName => Variant::StringName(
                self.names
                    .from_raw(RawStringName::from_addr(p0 as usize), &self.host),
            ),
            VariantType::Rid => Variant::Rid(Rid(p0)),
            VariantType::Object => Variant::Object(ObjectRef {
                raw: RawObject::from_addr(p0 as usize),
                id: InstanceId(raw.payload[1]),
            }),
            VariantType::Callable => Variant::Callable(Callable {
                target: InstanceId(p0),
                method: self.names.from_raw(
                    RawStringName::from_addr(raw.payload[1] as usize),
                    &self.host,
                ),
            }),
            VariantType::Signal => Variant::Signal(Signal {
                source: InstanceId(p0),
                name: self.names.from_raw(
                    RawStringName::from_addr(raw.payload[1] as usize),
                    &self.host,
                ),
            }),
            VariantType::Array => {
                Variant::Array(self.decode_array(RawArray::from_addr(p0 as usize), depth)?)
            }
            VariantType::Dictionary => Variant::Dictionary(
                self.decode_dictionary(RawDictionary::from_addr(p0 as usize), depth)?,
            ),
            VariantType::PackedByteArray => Variant::PackedByteArray(self.unpack_raw(p0)?),
            VariantType::PackedInt32Array => Variant::PackedInt32Array(self.unpack_raw(p0)?),
            VariantType::PackedInt64Array => Variant::PackedInt64Array(self.unpack_raw(p0)?),
            VariantType::PackedFloat32Array => Variant::PackedFloat32Array(self.unpack_raw(p0)?),
            VariantType::PackedFloat64Array => Variant::PackedFloat64Array(self.unpack_raw(p0)?),
            VariantType::PackedStringArray => Variant::PackedStringArray(self.unpack_raw(p0)?),
            VariantType::PackedVector2Array => Variant::PackedVector2Array(self.unpack_raw(p0)?),
            VariantType::PackedVector3Array => Variant::PackedVector3Array(self.unpack_raw(p0)?),
            VariantType::PackedColorArray => Variant::PackedColorArray(self.unpack_raw(p0)?),
            VariantType::PackedVector4Array => Variant::PackedVector4Array(self.unpack_raw(p0)?),
        };
        Ok(value)
    }

    /// Decode a host array without taking ownership of it
    pub fn read_array(&self, array: RawArray) -> ConversionResult<Vec<Variant>> {
        self.decode_array(array, 0)
    }

    /// Decode a host dictionary without taking ownership of it
    pub fn read_dictionary(&self, dict: RawDictionary) -> ConversionResult<Dictionary> {
        self.decode_dictionary(dict, 0)
    }

    fn decode_array(&self, array: RawArray, depth: usize) -> ConversionResult<Vec<Variant>> {
        let len = self.host.array_size(array);
        let mut items = Vec::with_capacity(len);
        for i in 0..len {
            let element = self.host.array_get(array, i);
            items.push(self.owned(element, depth + 1).map_err(|e| e.at_index(i))?);
        }
        Ok(items)
    }

    fn decode_dictionary(&self, dict: RawDictionary, depth: usize) -> ConversionResult<Dictionary> {
        let len = self.host.dictionary_size(dict);
        let mut out = Dictionary::new();
        for i in 0..len {
            let (k, v) = self.host.dictionary_entry(dict, i);
            let key = self.owned(k, depth + 1);
            let value = self.owned(v, depth + 1);
            let key = key.map_err(|e| e.at_index(i))?;
            let value = value.map_err(|e| e.at_key(key_label(&key)))?;
            out.insert(key, value);
        }
        Ok(out)
    }

    fn unpack_raw<T: PackedCodec>(&self, payload: u64) -> ConversionResult<Vec<T>> {
        T::unpack(self, RawPackedArray::from_addr(payload as usize))
    }
}

fn inline<T: Copy>(ty: VariantType, value: &T) -> RawVariant {
    debug_assert!(size_of::<T>() <= 16);
    let mut payload = [0u64; 2];
    // SAFETY: T fits in the 16-byte payload
    unsafe {
        std::ptr::copy_nonoverlapping(
            value as *const T as *const u8,
            payload.as_mut_ptr() as *mut u8,
            size_of::<T>(),
        );
    }
    RawVariant::new(ty, payload)
}

fn read_inline<T: Copy>(raw: &RawVariant) -> T {
    // SAFETY: the tag says the payload holds a T of at most 16 bytes
    unsafe { std::ptr::read_unaligned(raw.payload.as_ptr() as *const T) }
}

fn read_boxed<T: Copy>(raw: &RawVariant, ty: VariantType) -> ConversionResult<T> {
    let ptr = raw.payload[0] as *const T;
    if ptr.is_null() {
        return Err(ConversionError::new(ConversionErrorKind::NullPayload(ty)));
    }
    // SAFETY: boxed payloads point at host memory holding a T
    Ok(unsafe { std::ptr::read_unaligned(ptr) })
}

fn key_label(key: &Variant) -> String {
    match key {
        Variant::String(s) => s.clone(),
        Variant::StringName(n) => n.as_str().to_string(),
        Variant::Int(i) => i.to_string(),
        other => format!("{:?}", other.kind()),
    }
}

fn element_name(element: PackedElement) -> &'static str {
    match element {
        PackedElement::Byte => "u8",
        PackedElement::Int32 => "i32",
        PackedElement::Int64 => "i64",
        PackedElement::Float32 => "f32",
        PackedElement::Float64 => "f64",
        PackedElement::String => "String",
        PackedElement::Vector2 => "Vector2",
        PackedElement::Vector3 => "Vector3",
        PackedElement::Color => "Color",
        PackedElement::Vector4 => "Vector4",
    }
}

// ============================================================================
// Packed array codecs
// ============================================================================

/// Moves packed array contents across the boundary
pub trait PackedCodec: PackedElementType {
    /// Create a host packed array holding a copy of `values`
    fn pack(bridge: &VariantBridge, values: &[Self]) -> RawPackedArray;

    /// Copy a host packed array out, leaving it owned by the host
    fn unpack(bridge: &VariantBridge, packed: RawPackedArray) -> ConversionResult<Vec<Self>>;
}

fn check_element(found: Option<PackedElement>, expected: PackedElement) -> ConversionResult<()> {
    match found {
        Some(e) if e == expected => Ok(()),
        Some(e) => Err(ConversionError::new(ConversionErrorKind::PackedElementMismatch {
            expected: element_name(expected),
            actual: element_name(e),
        })),
        None => Err(ConversionError::new(ConversionErrorKind::PackedElementMismatch {
            expected: element_name(expected),
            actual: "unknown",
        })),
    }
}

macro_rules! pod_codec {
    ($($ty:ty),*) => {
        $(
            impl PackedCodec for $ty {
                fn pack(bridge: &VariantBridge, values: &[Self]) -> RawPackedArray {
                    // SAFETY: values is a live slice of plain-data elements
                    unsafe {
                        bridge.host.packed_new(
                            Self::ELEMENT,
                            values.as_ptr() as *const c_void,
                            values.len(),
                        )
                    }
                }

                fn unpack(bridge: &VariantBridge, packed: RawPackedArray) -> ConversionResult<Vec<Self>> {
                    let (element, len, data) = bridge.host.packed_data(packed);
                    check_element(element, Self::ELEMENT)?;
                    if len == 0 || data.is_null() {
                        return Ok(Vec::new());
                    }
                    let mut out = Vec::<Self>::with_capacity(len);
                    // SAFETY: host storage holds `len` elements of this type
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            data as *const u8,
                            out.as_mut_ptr() as *mut u8,
                            len * size_of::<Self>(),
                        );
                        out.set_len(len);
                    }
                    Ok(out)
                }
            }
        )*
    };
}

pod_codec!(u8, i32, i64, f32, f64, Vector2, Vector3, Color, Vector4);

impl PackedCodec for String {
    fn pack(bridge: &VariantBridge, values: &[Self]) -> RawPackedArray {
        let handles: Vec<RawString> = values.iter().map(|s| bridge.host.new_string(s)).collect();
        // SAFETY: handles is a live slice of string handles; the host copies them
        let packed = unsafe {
            bridge.host.packed_new(
                PackedElement::String,
                handles.as_ptr() as *const c_void,
                handles.len(),
            )
        };
        for handle in handles {
            bridge.host.destroy_string(handle);
        }
        packed
    }

    fn unpack(bridge: &VariantBridge, packed: RawPackedArray) -> ConversionResult<Vec<Self>> {
        let (element, len, data) = bridge.host.packed_data(packed);
        check_element(element, PackedElement::String)?;
        let handles = data as *const RawString;
        Ok((0..len)
            .map(|i| {
                // SAFETY: host storage holds `len` string handles
                let handle = unsafe { handles.add(i).read_unaligned() };
                bridge.host.read_string(handle)
            })
            .collect())
    }
}

impl Variant {
    /// Encode through a bridge; shorthand for [`VariantBridge::to_raw`]
    pub fn to_raw(&self, bridge: &VariantBridge) -> RawVariant {
        bridge.to_raw(self)
    }
}
