//! Raw variant layout and discriminants

/// Size of a raw variant in bytes
pub const RAW_VARIANT_SIZE: usize = 24;

/// Variant discriminant, in engine order.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum VariantType {
    Nil = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Vector2 = 5,
    Vector2i = 6,
    Rect2 = 7,
    Rect2i = 8,
    Vector3 = 9,
    Vector3i = 10,
    Transform2D = 11,
    Vector4 = 12,
    Vector4i = 13,
    Plane = 14,
    Quaternion = 15,
    Aabb = 16,
    Basis = 17,
    Transform3D = 18,
    Projection = 19,
    Color = 20,
    StringName = 21,
    NodePath = 22,
    Rid = 23,
    Object = 24,
    Callable = 25,
    Signal = 26,
    Dictionary = 27,
    Array = 28,
    PackedByteArray = 29,
    PackedInt32Array = 30,
    PackedInt64Array = 31,
    PackedFloat32Array = 32,
    PackedFloat64Array = 33,
    PackedStringArray = 34,
    PackedVector2Array = 35,
    PackedVector3Array = 36,
    PackedColorArray = 37,
    PackedVector4Array = 38,
}

impl VariantType {
    /// Number of discriminants
    pub const COUNT: u32 = 39;

    /// Decode a raw tag. Returns `None` for tags outside the known range.
    pub fn from_u32(tag: u32) -> Option<Self> {
        if tag < Self::COUNT {
            // SAFETY: repr(u32) with contiguous discriminants 0..COUNT
            Some(unsafe { std::mem::transmute::<u32, VariantType>(tag) })
        } else {
            None
        }
    }

    /// Element type for packed array discriminants
    pub fn packed_element(self) -> Option<PackedElement> {
        Some(match self {
            VariantType::PackedByteArray => PackedElement::Byte,
            VariantType::PackedInt32Array => PackedElement::Int32,
            VariantType::PackedInt64Array => PackedElement::Int64,
            VariantType::PackedFloat32Array => PackedElement::Float32,
            VariantType::PackedFloat64Array => PackedElement::Float64,
            VariantType::PackedStringArray => PackedElement::String,
            VariantType::PackedVector2Array => PackedElement::Vector2,
            VariantType::PackedVector3Array => PackedElement::Vector3,
            VariantType::PackedColorArray => PackedElement::Color,
            VariantType::PackedVector4Array => PackedElement::Vector4,
            _ => return None,
        })
    }

    /// Whether the payload holds a pointer to host memory that
    /// `variant_destroy` must release.
    pub fn is_boxed(self) -> bool {
        matches!(
            self,
            VariantType::Transform2D
                | VariantType::Aabb
                | VariantType::Basis
                | VariantType::Transform3D
                | VariantType::Projection
        )
    }
}

/// Element type of a packed array
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PackedElement {
    Byte = 0,
    Int32 = 1,
    Int64 = 2,
    Float32 = 3,
    Float64 = 4,
    /// Elements are `RawString` handles
    String = 5,
    Vector2 = 6,
    Vector3 = 7,
    Color = 8,
    Vector4 = 9,
}

impl PackedElement {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            PackedElement::Byte => 1,
            PackedElement::Int32 | PackedElement::Float32 => 4,
            PackedElement::Int64 | PackedElement::Float64 => 8,
            PackedElement::String => std::mem::size_of::<*mut std::ffi::c_void>(),
            PackedElement::Vector2 => 8,
            PackedElement::Vector3 => 12,
            PackedElement::Color | PackedElement::Vector4 => 16,
        }
    }

    /// Decode a raw element tag
    pub fn from_u32(tag: u32) -> Option<Self> {
        if tag <= PackedElement::Vector4 as u32 {
            // SAFETY: repr(u32) with contiguous discriminants
            Some(unsafe { std::mem::transmute::<u32, PackedElement>(tag) })
        } else {
            None
        }
    }
}

/// Engine variant: one discriminant plus an inline payload or indirect handle.
///
/// ```text
/// Nil/Bool/Int/Float/Rid       payload[0]
/// Vector2..Color (<= 16 bytes) payload[0..2] inline, little-endian packed
/// Transform2D/Aabb/Basis/
///   Transform3D/Projection     payload[0] = pointer from mem_alloc
/// String/NodePath              payload[0] = RawString
/// StringName                   payload[0] = RawStringName
/// Object                       payload = [RawObject, InstanceId]
/// Callable/Signal              payload = [InstanceId, RawStringName]
/// Dictionary/Array/Packed*     payload[0] = host handle
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawVariant {
    /// `VariantType` discriminant
    pub tag: u32,
    /// Padding, always zero
    pub pad: u32,
    /// Inline payload or handle
    pub payload: [u64; 2],
}

const _: () = assert!(std::mem::size_of::<RawVariant>() == RAW_VARIANT_SIZE);

impl RawVariant {
    /// The nil variant
    pub const NIL: Self = Self {
        tag: VariantType::Nil as u32,
        pad: 0,
        payload: [0, 0],
    };

    /// Build a variant from a discriminant and payload
    #[inline]
    pub const fn new(ty: VariantType, payload: [u64; 2]) -> Self {
        Self {
            tag: ty as u32,
            pad: 0,
            payload,
        }
    }

    /// Decode the discriminant
    #[inline]
    pub fn variant_type(&self) -> Option<VariantType> {
        VariantType::from_u32(self.tag)
    }

    /// Payload bytes, for inline math types
    #[inline]
    pub fn payload_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.payload[0].to_le_bytes());
        out[8..].copy_from_slice(&self.payload[1].to_le_bytes());
        out
    }

    /// Build a payload from up to 16 bytes
    #[inline]
    pub fn payload_from_bytes(bytes: &[u8]) -> [u64; 2] {
        let mut buf = [0u8; 16];
        buf[..bytes.len()].copy_from_slice(bytes);
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&buf[..8]);
        hi.copy_from_slice(&buf[8..]);
        [u64::from_le_bytes(lo), u64::from_le_bytes(hi)]
    }
}

impl Default for RawVariant {
    fn default() -> Self {
        Self::NIL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_type_roundtrip_tags() {
        for tag in 0..VariantType::COUNT {
            let ty = VariantType::from_u32(tag).unwrap();
            assert_eq!(ty as u32, tag);
        }
        assert!(VariantType::from_u32(VariantType::COUNT).is_none());
    }

    #[test]
    fn test_packed_element_mapping() {
        assert_eq!(
            VariantType::PackedStringArray.packed_element(),
            Some(PackedElement::String)
        );
        assert_eq!(VariantType::Array.packed_element(), None);
        assert_eq!(PackedElement::Vector3.size(), 12);
        assert_eq!(PackedElement::from_u32(9), Some(PackedElement::Vector4));
        assert_eq!(PackedElement::from_u32(10), None);
    }

    #[test]
    fn test_payload_bytes() {
        let payload = RawVariant::payload_from_bytes(&[1, 2, 3]);
        let v = RawVariant::new(VariantType::Vector2, payload);
        assert_eq!(&v.payload_bytes()[..4], &[1, 2, 3, 0]);
        assert!(VariantType::Basis.is_boxed());
        assert!(!VariantType::Color.is_boxed());
    }
}
