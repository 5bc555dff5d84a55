//! Variant Bridge
//!
//! [`Variant`] is the managed form of the engine's tagged union. Values are
//! converted to and from Rust types through [`ToVariant`] and [`FromVariant`],
//! and to and from the raw 24-byte layout through [`bridge`].
//!
//! Conversion failures are recoverable: a mismatched discriminant comes back
//! as a [`ConversionError`](crate::error::ConversionError) naming the
//! expected and actual kinds and, for nested containers, where in the value
//! the mismatch sits.

pub mod bridge;
mod convert;
mod dictionary;
pub mod math;

use tether_sys::{InstanceId, RawObject};

pub use convert::{FromVariant, PackedElementType, ToVariant};
pub use dictionary::Dictionary;
pub use math::{
    Aabb, Basis, Color, Plane, Projection, Quaternion, Rect2, Rect2i, Rid, Transform2D,
    Transform3D, Vector2, Vector2i, Vector3, Vector3i, Vector4, Vector4i,
};

use crate::error::ConversionError;
use crate::name::StringName;

/// Variant discriminant
pub type VariantKind = tether_sys::VariantType;

/// Object reference carried by a variant: the raw pointer and the id it had
/// when it was wrapped. Carries no ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Engine pointer
    pub raw: RawObject,
    /// Engine id
    pub id: InstanceId,
}

impl ObjectRef {
    /// The null object
    pub const NULL: Self = Self {
        raw: RawObject::NULL,
        id: InstanceId::NONE,
    };

    /// Whether this is the null object
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }
}

/// Method on an engine object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Callable {
    /// Object the method is called on
    pub target: InstanceId,
    /// Method name
    pub method: StringName,
}

/// Signal on an engine object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signal {
    /// Object emitting the signal
    pub source: InstanceId,
    /// Signal name
    pub name: StringName,
}

/// Scene tree path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NodePath(pub String);

impl NodePath {
    /// Path text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodePath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Managed engine variant
#[derive(Debug, Clone, PartialEq, Default)]
#[allow(missing_docs)]
pub enum Variant {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Vector2(Vector2),
    Vector2i(Vector2i),
    Rect2(Rect2),
    Rect2i(Rect2i),
    Vector3(Vector3),
    Vector3i(Vector3i),
    Transform2D(Transform2D),
    Vector4(Vector4),
    Vector4i(Vector4i),
    Plane(Plane),
    Quaternion(Quaternion),
    Aabb(Aabb),
    Basis(Basis),
    Transform3D(Transform3D),
    Projection(Projection),
    Color(Color),
    StringName(StringName),
    NodePath(NodePath),
    Rid(Rid),
    Object(ObjectRef),
    Callable(Callable),
    Signal(Signal),
    Dictionary(Dictionary),
    Array(Vec<Variant>),
    PackedByteArray(Vec<u8>),
    PackedInt32Array(Vec<i32>),
    PackedInt64Array(Vec<i64>),
    PackedFloat32Array(Vec<f32>),
    PackedFloat64Array(Vec<f64>),
    PackedStringArray(Vec<String>),
    PackedVector2Array(Vec<Vector2>),
    PackedVector3Array(Vec<Vector3>),
    PackedColorArray(Vec<Color>),
    PackedVector4Array(Vec<Vector4>),
}

impl Variant {
    /// Discriminant of this value
    pub fn kind(&self) -> VariantKind {
        match self {
            Variant::Nil => VariantKind::Nil,
            Variant::Bool(_) => VariantKind::Bool,
            Variant::Int(_) => VariantKind::Int,
            Variant::Float(_) => VariantKind::Float,
            Variant::String(_) => VariantKind::String,
            Variant::Vector2(_) => VariantKind::Vector2,
            Variant::Vector2i(_) => VariantKind::Vector2i,
            Variant::Rect2(_) => VariantKind::Rect2,
            Variant::Rect2i(_) => VariantKind::Rect2i,
            Variant::Vector3(_) => VariantKind::Vector3,
            Variant::Vector3i(_) => VariantKind::Vector3i,
            Variant::Transform2D(_) => VariantKind::Transform2D,
            Variant::Vector4(_) => VariantKind::Vector4,
            Variant::Vector4i(_) => VariantKind::Vector4i,
            Variant::Plane(_) => VariantKind::Plane,
            Variant::Quaternion(_) => VariantKind::Quaternion,
            Variant::Aabb(_) => VariantKind::Aabb,
            Variant::Basis(_) => VariantKind::Basis,
            Variant::Transform3D(_) => VariantKind::Transform3D,
            Variant::Projection(_) => VariantKind::Projection,
            Variant::Color(_) => VariantKind::Color,
            Variant::StringName(_) => VariantKind::StringName,
            Variant::NodePath(_) => VariantKind::NodePath,
            Variant::Rid(_) => VariantKind::Rid,
            Variant::Object(_) => VariantKind::Object,
            Variant::Callable(_) => VariantKind::Callable,
            Variant::Signal(_) => VariantKind::Signal,
            Variant::Dictionary(_) => VariantKind::Dictionary,
            Variant::Array(_) => VariantKind::Array,
            Variant::PackedByteArray(_) => VariantKind::PackedByteArray,
            Variant::PackedInt32Array(_) => VariantKind::PackedInt32Array,
            Variant::PackedInt64Array(_) => VariantKind::PackedInt64Array,
            Variant::PackedFloat32Array(_) => VariantKind::PackedFloat32Array,
            Variant::PackedFloat64Array(_) => VariantKind::PackedFloat64Array,
            Variant::PackedStringArray(_) => VariantKind::PackedStringArray,
            Variant::PackedVector2Array(_) => VariantKind::PackedVector2Array,
            Variant::PackedVector3Array(_) => VariantKind::PackedVector3Array,
            Variant::PackedColorArray(_) => VariantKind::PackedColorArray,
            Variant::PackedVector4Array(_) => VariantKind::PackedVector4Array,
        }
    }

    /// Whether this is nil
    pub fn is_nil(&self) -> bool {
        matches!(self, Variant::Nil)
    }

    /// Check the discriminant
    pub fn expect_kind(&self, expected: VariantKind) -> Result<&Self, ConversionError> {
        if self.kind() == expected {
            Ok(self)
        } else {
            Err(ConversionError::mismatch(expected, self.kind()))
        }
    }

    /// Convert to a Rust value
    pub fn try_to<T: FromVariant>(&self) -> Result<T, ConversionError> {
        T::from_variant(self)
    }

    /// Wrap a Rust value
    pub fn from_value<T: ToVariant + ?Sized>(value: &T) -> Self {
        value.to_variant()
    }
}

impl<T: ToVariant> FromIterator<T> for Variant {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Variant::Array(iter.into_iter().map(|v| v.to_variant()).collect())
    }
}
