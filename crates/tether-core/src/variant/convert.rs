//! Conversions between Rust values and `Variant`

use tether_sys::PackedElement;

use super::{
    Aabb, Basis, Callable, Color, Dictionary, NodePath, ObjectRef, Plane, Projection, Quaternion,
    Rect2, Rect2i, Rid, Signal, Transform2D, Transform3D, Variant, VariantKind, Vector2, Vector2i,
    Vector3, Vector3i, Vector4, Vector4i,
};
use crate::error::{ConversionError, ConversionResult};
use crate::name::StringName;

/// Wrap a Rust value in a variant with the matching discriminant
pub trait ToVariant {
    /// Convert to a variant
    fn to_variant(&self) -> Variant;
}

/// Unwrap a variant into a Rust value, failing on a discriminant mismatch
pub trait FromVariant: Sized {
    /// Convert from a variant
    fn from_variant(variant: &Variant) -> ConversionResult<Self>;
}

impl ToVariant for Variant {
    fn to_variant(&self) -> Variant {
        self.clone()
    }
}

impl ToVariant for () {
    fn to_variant(&self) -> Variant {
        Variant::Nil
    }
}

impl FromVariant for Variant {
    fn from_variant(variant: &Variant) -> ConversionResult<Self> {
        Ok(variant.clone())
    }
}

// ============================================================================
// Types that map onto exactly one variant arm
// ============================================================================

macro_rules! direct_variant {
    ($($ty:ty => $arm:ident),* $(,)?) => {
        $(
            impl ToVariant for $ty {
                fn to_variant(&self) -> Variant {
                    Variant::$arm(self.clone())
                }
            }

            impl FromVariant for $ty {
                fn from_variant(variant: &Variant) -> ConversionResult<Self> {
                    match variant {
                        Variant::$arm(v) => Ok(v.clone()),
                        other => Err(ConversionError::mismatch(VariantKind::$arm, other.kind())),
                    }
                }
            }

            impl From<$ty> for Variant {
                fn from(value: $ty) -> Self {
                    Variant::$arm(value)
                }
            }
        )*
    };
}

direct_variant!(
    bool => Bool,
    i64 => Int,
    f64 => Float,
    String => String,
    Vector2 => Vector2,
    Vector2i => Vector2i,
    Rect2 => Rect2,
    Rect2i => Rect2i,
    Vector3 => Vector3,
    Vector3i => Vector3i,
    Transform2D => Transform2D,
    Vector4 => Vector4,
    Vector4i => Vector4i,
    Plane => Plane,
    Quaternion => Quaternion,
    Aabb => Aabb,
    Basis => Basis,
    Transform3D => Transform3D,
    Projection => Projection,
    Color => Color,
    StringName => StringName,
    NodePath => NodePath,
    Rid => Rid,
    ObjectRef => Object,
    Callable => Callable,
    Signal => Signal,
    Dictionary => Dictionary,
    Vec<Variant> => Array,
);

impl ToVariant for str {
    fn to_variant(&self) -> Variant {
        Variant::String(self.to_string())
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::String(value.to_string())
    }
}

// ============================================================================
// Narrower integers and floats, range checked on the way out
// ============================================================================

macro_rules! int_variant {
    ($($ty:ty),*) => {
        $(
            impl ToVariant for $ty {
                fn to_variant(&self) -> Variant {
                    Variant::Int(i64::from(*self))
                }
            }

            impl FromVariant for $ty {
                fn from_variant(variant: &Variant) -> ConversionResult<Self> {
                    match variant {
                        Variant::Int(v) => <$ty>::try_from(*v)
                            .map_err(|_| ConversionError::out_of_range(*v, stringify!($ty))),
                        other => Err(ConversionError::mismatch(VariantKind::Int, other.kind())),
                    }
                }
            }

            impl From<$ty> for Variant {
                fn from(value: $ty) -> Self {
                    Variant::Int(i64::from(value))
                }
            }
        )*
    };
}

int_variant!(i8, i16, i32, u8, u16, u32);

// The engine has no unsigned 64-bit variant; the bits travel unchanged.
impl ToVariant for u64 {
    fn to_variant(&self) -> Variant {
        Variant::Int(*self as i64)
    }
}

impl FromVariant for u64 {
    fn from_variant(variant: &Variant) -> ConversionResult<Self> {
        match variant {
            Variant::Int(v) => Ok(*v as u64),
            other => Err(ConversionError::mismatch(VariantKind::Int, other.kind())),
        }
    }
}

impl ToVariant for f32 {
    fn to_variant(&self) -> Variant {
        Variant::Float(f64::from(*self))
    }
}

impl FromVariant for f32 {
    fn from_variant(variant: &Variant) -> ConversionResult<Self> {
        match variant {
            Variant::Float(v) => Ok(*v as f32),
            other => Err(ConversionError::mismatch(VariantKind::Float, other.kind())),
        }
    }
}

impl From<f32> for Variant {
    fn from(value: f32) -> Self {
        Variant::Float(f64::from(value))
    }
}

// ============================================================================
// Option <-> Nil
// ============================================================================

impl<T: ToVariant> ToVariant for Option<T> {
    fn to_variant(&self) -> Variant {
        match self {
            Some(v) => v.to_variant(),
            None => Variant::Nil,
        }
    }
}

impl<T: FromVariant> FromVariant for Option<T> {
    fn from_variant(variant: &Variant) -> ConversionResult<Self> {
        match variant {
            Variant::Nil => Ok(None),
            other => T::from_variant(other).map(Some),
        }
    }
}

// ============================================================================
// Packed arrays
// ============================================================================

/// Element type of a packed array variant
pub trait PackedElementType: Sized + Clone + 'static {
    /// Raw element discriminant
    const ELEMENT: PackedElement;
    /// Variant discriminant of the packed array
    const KIND: VariantKind;

    /// Wrap a vector
    fn wrap(values: Vec<Self>) -> Variant;

    /// Borrow the vector if the variant holds this packed kind
    fn unwrap(variant: &Variant) -> Option<&Vec<Self>>;
}

macro_rules! packed_element {
    ($($ty:ty => $element:ident, $arm:ident);* $(;)?) => {
        $(
            impl PackedElementType for $ty {
                const ELEMENT: PackedElement = PackedElement::$element;
                const KIND: VariantKind = VariantKind::$arm;

                fn wrap(values: Vec<Self>) -> Variant {
                    Variant::$arm(values)
                }

                fn unwrap(variant: &Variant) -> Option<&Vec<Self>> {
                    match variant {
                        Variant::$arm(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

packed_element!(
    u8 => Byte, PackedByteArray;
    i32 => Int32, PackedInt32Array;
    i64 => Int64, PackedInt64Array;
    f32 => Float32, PackedFloat32Array;
    f64 => Float64, PackedFloat64Array;
    String => String, PackedStringArray;
    Vector2 => Vector2, PackedVector2Array;
    Vector3 => Vector3, PackedVector3Array;
    Color => Color, PackedColorArray;
    Vector4 => Vector4, PackedVector4Array;
);

impl<T: PackedElementType> ToVariant for Vec<T> {
    fn to_variant(&self) -> Variant {
        T::wrap(self.clone())
    }
}

impl<T: PackedElementType> FromVariant for Vec<T> {
    fn from_variant(variant: &Variant) -> ConversionResult<Self> {
        T::unwrap(variant)
            .cloned()
            .ok_or_else(|| ConversionError::mismatch(T::KIND, variant.kind()))
    }
}

impl<T: PackedElementType> From<Vec<T>> for Variant {
    fn from(values: Vec<T>) -> Self {
        T::wrap(values)
    }
}

impl Variant {
    /// Convert an array variant element-wise, reporting the failing index
    pub fn try_to_vec<T: FromVariant>(&self) -> ConversionResult<Vec<T>> {
        match self {
            Variant::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| T::from_variant(item).map_err(|e| e.at_index(i)))
                .collect(),
            other => Err(ConversionError::mismatch(VariantKind::Array, other.kind())),
        }
    }

    /// Build an array variant from Rust values
    pub fn array_of<T: ToVariant>(values: &[T]) -> Variant {
        Variant::Array(values.iter().map(ToVariant::to_variant).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConversionErrorKind;

    #[test]
    fn test_scalar_round_trip() {
        assert_eq!(bool::from_variant(&true.to_variant()), Ok(true));
        assert_eq!(i64::from_variant(&i64::MIN.to_variant()), Ok(i64::MIN));
        assert_eq!(u64::from_variant(&u64::MAX.to_variant()), Ok(u64::MAX));
        assert_eq!(i32::from_variant(&(-7i32).to_variant()), Ok(-7));
        assert_eq!(f64::from_variant(&0.25f64.to_variant()), Ok(0.25));
    }

    #[test]
    fn test_mismatch_reports_kinds() {
        let err = i64::from_variant(&Variant::from("text")).unwrap_err();
        assert_eq!(
            err.kind(),
            &ConversionErrorKind::TypeMismatch {
                expected: VariantKind::Int,
                actual: VariantKind::String,
            }
        );
    }

    #[test]
    fn test_narrowing_is_checked() {
        let err = u8::from_variant(&Variant::Int(256)).unwrap_err();
        assert!(matches!(err.kind(), ConversionErrorKind::OutOfRange { value: 256, .. }));
        assert_eq!(i8::from_variant(&Variant::Int(-128)), Ok(-128));
    }

    #[test]
    fn test_option_maps_nil() {
        assert_eq!(Option::<i64>::from_variant(&Variant::Nil), Ok(None));
        assert_eq!(Some(3i64).to_variant(), Variant::Int(3));
        assert_eq!(None::<i64>.to_variant(), Variant::Nil);
    }

    #[test]
    fn test_packed_vec() {
        let v = vec![1i32, 2, 3].to_variant();
        assert_eq!(v.kind(), VariantKind::PackedInt32Array);
        assert_eq!(Vec::<i32>::from_variant(&v), Ok(vec![1, 2, 3]));
        assert!(Vec::<i64>::from_variant(&v).is_err());
    }

    #[test]
    fn test_try_to_vec_reports_index() {
        let array = Variant::Array(vec![Variant::Int(1), Variant::from("x")]);
        let err = array.try_to_vec::<i64>().unwrap_err();
        assert_eq!(err.path_string(), "[1]");
        assert_eq!(Variant::array_of(&[1i64, 2]).try_to_vec::<i64>(), Ok(vec![1, 2]));
    }
}
