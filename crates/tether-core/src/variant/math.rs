//! Engine math value types
//!
//! Plain `#[repr(C)]` structs with the engine's single-precision layout.
//! They cross the boundary bitwise, both in call frames and inside variants.

#![allow(missing_docs)]

/// 2D vector
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

/// 2D integer vector
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vector2i {
    pub x: i32,
    pub y: i32,
}

/// 3D vector
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// 3D integer vector
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vector3i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// 4D vector
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

/// 4D integer vector
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vector4i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
}

/// Axis-aligned 2D rectangle
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect2 {
    pub position: Vector2,
    pub size: Vector2,
}

/// Axis-aligned integer rectangle
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect2i {
    pub position: Vector2i,
    pub size: Vector2i,
}

/// 2D affine transform: two basis columns and an origin
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform2D {
    pub x: Vector2,
    pub y: Vector2,
    pub origin: Vector2,
}

impl Default for Transform2D {
    fn default() -> Self {
        Self {
            x: Vector2 { x: 1.0, y: 0.0 },
            y: Vector2 { x: 0.0, y: 1.0 },
            origin: Vector2::default(),
        }
    }
}

/// Plane as normal and distance
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Plane {
    pub normal: Vector3,
    pub d: f32,
}

/// Rotation quaternion
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

/// Axis-aligned bounding box
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aabb {
    pub position: Vector3,
    pub size: Vector3,
}

/// 3x3 matrix, row major
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Basis {
    pub rows: [Vector3; 3],
}

impl Default for Basis {
    fn default() -> Self {
        Self {
            rows: [
                Vector3 { x: 1.0, y: 0.0, z: 0.0 },
                Vector3 { x: 0.0, y: 1.0, z: 0.0 },
                Vector3 { x: 0.0, y: 0.0, z: 1.0 },
            ],
        }
    }
}

/// 3D affine transform
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform3D {
    pub basis: Basis,
    pub origin: Vector3,
}

/// 4x4 projection matrix, column major
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub columns: [Vector4; 4],
}

impl Default for Projection {
    fn default() -> Self {
        let mut columns = [Vector4::default(); 4];
        columns[0].x = 1.0;
        columns[1].y = 1.0;
        columns[2].z = 1.0;
        columns[3].w = 1.0;
        Self { columns }
    }
}

/// RGBA color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    /// Opaque color from components
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }
}

/// Server resource id
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rid(pub u64);

const _: () = {
    use std::mem::size_of;
    assert!(size_of::<Vector2>() == 8);
    assert!(size_of::<Vector3>() == 12);
    assert!(size_of::<Rect2i>() == 16);
    assert!(size_of::<Transform2D>() == 24);
    assert!(size_of::<Aabb>() == 24);
    assert!(size_of::<Basis>() == 36);
    assert!(size_of::<Transform3D>() == 48);
    assert!(size_of::<Projection>() == 64);
    assert!(size_of::<Color>() == 16);
};
