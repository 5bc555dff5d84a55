//! Opaque, pointer-sized handles to host-side storage

use std::ffi::c_void;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub *mut c_void);

        impl $name {
            /// The null handle
            pub const NULL: Self = Self(std::ptr::null_mut());

            /// Check if this handle is null
            #[inline]
            pub fn is_null(self) -> bool {
                self.0.is_null()
            }

            /// Address of the handle (for hashing and diagnostics)
            #[inline]
            pub fn addr(self) -> usize {
                self.0 as usize
            }

            /// Rebuild a handle from an address
            #[inline]
            pub fn from_addr(addr: usize) -> Self {
                Self(addr as *mut c_void)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NULL
            }
        }

        // Handles are plain addresses; the host decides which threads may
        // dereference them.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}

opaque_handle!(
    /// Pointer to an object living in the engine's memory space
    RawObject
);
opaque_handle!(
    /// Resolved native method entry point
    RawMethodBind
);
opaque_handle!(
    /// Host string (reference-counted on the host side)
    RawString
);
opaque_handle!(
    /// Host interned name; immortal for the lifetime of the host
    RawStringName
);
opaque_handle!(
    /// Host variant array
    RawArray
);
opaque_handle!(
    /// Host dictionary (insertion ordered)
    RawDictionary
);
opaque_handle!(
    /// Host packed array of a single element type
    RawPackedArray
);
opaque_handle!(
    /// Extension-side instance data bound to an engine object
    RawInstance
);

/// Engine-wide unique object identifier. Zero means "no object".
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InstanceId(pub u64);

impl InstanceId {
    /// The "no object" id
    pub const NONE: Self = Self(0);

    /// Check if this id refers to an object
    #[inline]
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}
