//! Handle/Ownership Registry
//!
//! Raw object pointers carry no type and no ownership. When one crosses from
//! the engine into Rust it is wrapped in a [`ManagedHandle`] that records
//! both:
//!
//! - the class, as a type parameter (`ManagedHandle<'_, Node>`), so upcasts
//!   are checked at compile time and downcasts go through the engine;
//! - the [`Ownership`] tag, which decides what happens on release.
//!
//! ```text
//! Borrowed     lifetime tied to a frame or call scope, release is a no-op
//! Transferred  caller owns the object, release destroys it
//! RefCounted   acquire references, release unreferences (destroy at zero)
//! EngineOwned  engine frees it; release is a no-op, liveness checked by id
//! ```
//!
//! Owned handles release themselves on drop.

mod registry;

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use tether_sys::{InstanceId, RawObject};

pub use registry::{HandleRegistry, HandleStats};

use crate::error::OwnershipError;

// ============================================================================
// Class markers
// ============================================================================

/// Engine class known at compile time
pub trait Class: 'static {
    /// Engine class name
    const NAME: &'static str;
    /// Uses intrusive reference counting
    const REFCOUNTED: bool;
    /// Direct parent; `Object` is its own base
    type Base: Class;
}

/// `Self` may be viewed as `P` without an engine cast
pub trait Inherits<P: Class>: Class {}

impl<C: Class> Inherits<C> for C {}

/// Root of the engine class tree
#[derive(Debug)]
pub enum Object {}

impl Class for Object {
    const NAME: &'static str = "Object";
    const REFCOUNTED: bool = false;
    type Base = Object;
}

/// Root of the reference counted classes
#[derive(Debug)]
pub enum RefCounted {}

impl Class for RefCounted {
    const NAME: &'static str = "RefCounted";
    const REFCOUNTED: bool = true;
    type Base = Object;
}

impl Inherits<Object> for RefCounted {}

/// Declare a class marker with its parent and further ancestors.
///
/// Reference counting is inherited from the parent.
///
/// ```ignore
/// class_marker!(Node: Object);
/// class_marker!(Node2D: Node, Object);
/// class_marker!(Resource: RefCounted, Object);
/// ```
#[macro_export]
macro_rules! class_marker {
    ($name:ident : $base:ty $(, $ancestor:ty)* $(,)?) => {
        #[derive(Debug)]
        pub enum $name {}

        impl $crate::handle::Class for $name {
            const NAME: &'static str = stringify!($name);
            const REFCOUNTED: bool = <$base as $crate::handle::Class>::REFCOUNTED;
            type Base = $base;
        }

        impl $crate::handle::Inherits<$base> for $name {}
        $(impl $crate::handle::Inherits<$ancestor> for $name {})*
    };
}

// ============================================================================
// Ownership
// ============================================================================

/// How a handle relates to the object's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Valid only within the frame or call that produced it
    Borrowed,
    /// The Rust side owns the object and destroys it on release
    Transferred,
    /// Holds one intrusive reference
    RefCounted,
    /// The engine owns the object; Rust never frees it
    EngineOwned,
}

impl Ownership {
    /// Whether releasing a handle with this tag has an effect on the engine
    pub fn is_owning(self) -> bool {
        matches!(self, Ownership::Transferred | Ownership::RefCounted)
    }
}

/// Something a borrowed handle can be tied to.
///
/// Implemented by call frames and [`CallScope`]; a borrowed handle cannot
/// outlive the scope it was borrowed from.
pub trait BorrowScope {}

/// Scope for objects the engine lends for the duration of one callback
pub struct CallScope {
    _not_send: PhantomData<*const ()>,
}

impl CallScope {
    /// Run `f` with a fresh scope; borrows taken from it end with `f`
    pub fn with<R>(f: impl FnOnce(&CallScope) -> R) -> R {
        let scope = CallScope {
            _not_send: PhantomData,
        };
        f(&scope)
    }
}

impl BorrowScope for CallScope {}

// ============================================================================
// Managed handles
// ============================================================================

/// Typed object handle carrying its ownership tag.
///
/// `'a` is `'static` for owned handles and the scope's lifetime for
/// borrowed ones.
pub struct ManagedHandle<'a, C: Class> {
    raw: RawObject,
    id: InstanceId,
    ownership: Ownership,
    registry: Arc<HandleRegistry>,
    _marker: PhantomData<(&'a (), fn() -> C)>,
}

impl<'a, C: Class> ManagedHandle<'a, C> {
    pub(crate) fn new(
        raw: RawObject,
        id: InstanceId,
        ownership: Ownership,
        registry: Arc<HandleRegistry>,
    ) -> Self {
        Self {
            raw,
            id,
            ownership,
            registry,
            _marker: PhantomData,
        }
    }

    /// Raw pointer for passing back into a call. Ownership is unchanged.
    pub fn as_raw(&self) -> RawObject {
        self.raw
    }

    /// Instance id recorded when the handle was created
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    /// Ownership tag
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Whether the engine still has this object under the same id
    pub fn is_alive(&self) -> bool {
        self.registry.is_alive(self.raw, self.id)
    }

    /// Fail with [`OwnershipError::Freed`] if the engine freed the object
    pub fn ensure_alive(&self) -> Result<(), OwnershipError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(OwnershipError::Freed { id: self.id })
        }
    }

    /// View as an ancestor class. The tag moves with the handle.
    pub fn upcast<P: Class>(self) -> ManagedHandle<'a, P>
    where
        C: Inherits<P>,
    {
        let (raw, id, ownership, registry) = self.into_parts();
        ManagedHandle::new(raw, id, ownership, registry)
    }

    /// Downcast through the engine. On failure the original handle comes back.
    pub fn try_cast<D: Class>(self) -> Result<ManagedHandle<'a, D>, Self> {
        match self.registry.cast(self.raw, D::NAME) {
            Some(cast) => {
                let (_, id, ownership, registry) = self.into_parts();
                Ok(ManagedHandle::new(cast, id, ownership, registry))
            }
            None => Err(self),
        }
    }

    /// Owned handle to the same object: a new reference for reference
    /// counted classes, an engine-owned view otherwise
    pub fn to_owned(&self) -> Result<ManagedHandle<'static, C>, OwnershipError> {
        let ownership = if C::REFCOUNTED || self.ownership == Ownership::RefCounted {
            Ownership::RefCounted
        } else {
            Ownership::EngineOwned
        };
        self.registry.acquire(self.raw, ownership)
    }

    /// Hand the object to the engine without releasing it.
    ///
    /// Used when passing a transferred or referenced object to a method
    /// that takes ownership.
    pub fn into_engine(self) -> RawObject {
        let (raw, _, ownership, registry) = self.into_parts();
        if ownership.is_owning() {
            registry.forget(raw);
        }
        raw
    }

    /// Release according to the ownership tag
    pub fn release(self) -> Result<(), OwnershipError> {
        let (raw, id, ownership, registry) = self.into_parts();
        registry.release_parts(raw, id, ownership)
    }

    fn into_parts(self) -> (RawObject, InstanceId, Ownership, Arc<HandleRegistry>) {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the registry is moved out once
        let registry = unsafe { std::ptr::read(&this.registry) };
        (this.raw, this.id, this.ownership, registry)
    }
}

impl<C: Class> Drop for ManagedHandle<'_, C> {
    fn drop(&mut self) {
        if !self.ownership.is_owning() {
            return;
        }
        if let Err(e) = self.registry.release_parts(self.raw, self.id, self.ownership) {
            log::error!("releasing {} handle: {}", C::NAME, e);
        }
    }
}

impl<C: Class> fmt::Debug for ManagedHandle<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedHandle")
            .field("class", &C::NAME)
            .field("raw", &self.raw)
            .field("id", &self.id)
            .field("ownership", &self.ownership)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::class_marker!(Node: Object);
    crate::class_marker!(Node2D: Node, Object);
    crate::class_marker!(Resource: RefCounted, Object);

    fn assert_inherits<C: Inherits<P>, P: Class>() {}

    #[test]
    fn test_marker_chain() {
        assert_inherits::<Node2D, Node>();
        assert_inherits::<Node2D, Object>();
        assert_inherits::<Node2D, Node2D>();
        assert_inherits::<Resource, Object>();
        assert_eq!(Node2D::NAME, "Node2D");
        assert_eq!(<<Node2D as Class>::Base as Class>::NAME, "Node");
    }

    #[test]
    fn test_refcounting_is_inherited() {
        assert!(Resource::REFCOUNTED);
        assert!(!Node2D::REFCOUNTED);
    }

    #[test]
    fn test_owning_tags() {
        assert!(Ownership::Transferred.is_owning());
        assert!(Ownership::RefCounted.is_owning());
        assert!(!Ownership::Borrowed.is_owning());
        assert!(!Ownership::EngineOwned.is_owning());
    }
}
