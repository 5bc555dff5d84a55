//! Acquisition bookkeeping for owned handles
//!
//! The registry is the only place that calls `ref_reference`,
//! `ref_unreference` and `object_destroy` on behalf of handles. It tracks
//! every outstanding owned acquisition by address so that a second release
//! of the same acquisition is reported instead of reaching the engine.
//!
//! Host calls are made outside the map's shard locks: destroying an
//! extension instance runs its Rust destructor, which may release handles
//! of its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_sys::{InstanceId, RawObject};

use super::{BorrowScope, Class, ManagedHandle, Ownership};
use crate::error::OwnershipError;
use crate::host::HostApi;
use crate::name::NameInterner;

#[derive(Debug, Clone, Copy)]
struct LiveEntry {
    ownership: Ownership,
    outstanding: usize,
    id: InstanceId,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleStats {
    /// Owned acquisitions (transferred and reference counted)
    pub acquired: u64,
    /// Owned releases
    pub released: u64,
    /// Owned handles given to the engine with `into_engine`
    pub handed_off: u64,
    /// Acquisitions not yet released or handed off
    pub outstanding: usize,
}

/// Tracks owned handles for one runtime
pub struct HandleRegistry {
    host: Arc<HostApi>,
    names: Arc<NameInterner>,
    live: DashMap<usize, LiveEntry>,
    acquired: AtomicU64,
    released: AtomicU64,
    handed_off: AtomicU64,
}

impl HandleRegistry {
    /// Create an empty registry
    pub fn new(host: Arc<HostApi>, names: Arc<NameInterner>) -> Self {
        Self {
            host,
            names,
            live: DashMap::new(),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            handed_off: AtomicU64::new(0),
        }
    }

    /// Wrap a raw pointer in an owned or engine-owned handle.
    ///
    /// Reference counted acquisitions add one engine reference. A second
    /// transferred acquisition of the same object fails with
    /// [`OwnershipError::AlreadyOwned`]. Borrowed handles must come from
    /// [`HandleRegistry::borrow`].
    pub fn acquire<C: Class>(
        self: &Arc<Self>,
        raw: RawObject,
        ownership: Ownership,
    ) -> Result<ManagedHandle<'static, C>, OwnershipError> {
        if raw.is_null() {
            return Err(OwnershipError::NullHandle);
        }
        let addr = raw.addr();
        let id = self.host.instance_id(raw);

        match ownership {
            Ownership::Borrowed => return Err(OwnershipError::BorrowRequiresScope),
            Ownership::EngineOwned => {}
            Ownership::Transferred => {
                match self.live.entry(addr) {
                    Entry::Occupied(_) => return Err(OwnershipError::AlreadyOwned { addr }),
                    Entry::Vacant(slot) => {
                        slot.insert(LiveEntry {
                            ownership,
                            outstanding: 1,
                            id,
                        });
                    }
                }
                self.acquired.fetch_add(1, Ordering::Relaxed);
            }
            Ownership::RefCounted => {
                if !self.host.reference(raw) {
                    return Err(OwnershipError::NotRefCounted { addr });
                }
                let conflict = {
                    let mut entry = self.live.entry(addr).or_insert(LiveEntry {
                        ownership,
                        outstanding: 0,
                        id,
                    });
                    if entry.ownership == Ownership::RefCounted {
                        entry.outstanding += 1;
                        false
                    } else {
                        true
                    }
                };
                if conflict {
                    self.host.unreference(raw);
                    return Err(OwnershipError::AlreadyOwned { addr });
                }
                self.acquired.fetch_add(1, Ordering::Relaxed);
            }
        }

        log::trace!("acquired {} {:?} as {:?}", C::NAME, id, ownership);
        Ok(ManagedHandle::new(raw, id, ownership, Arc::clone(self)))
    }

    /// Wrap a raw pointer the engine lends for the duration of `scope`
    pub fn borrow<'s, C: Class, S: BorrowScope + ?Sized>(
        self: &Arc<Self>,
        raw: RawObject,
        _scope: &'s S,
    ) -> Result<ManagedHandle<'s, C>, OwnershipError> {
        if raw.is_null() {
            return Err(OwnershipError::NullHandle);
        }
        let id = self.host.instance_id(raw);
        Ok(ManagedHandle::new(raw, id, Ownership::Borrowed, Arc::clone(self)))
    }

    /// Release a handle according to its tag
    pub fn release<C: Class>(&self, handle: ManagedHandle<'_, C>) -> Result<(), OwnershipError> {
        handle.release()
    }

    /// Release the acquisition recorded for `raw` without a handle.
    ///
    /// Fails with [`OwnershipError::DoubleRelease`] when nothing is
    /// outstanding for the object.
    pub fn release_raw(&self, raw: RawObject) -> Result<(), OwnershipError> {
        let entry = self
            .live
            .get(&raw.addr())
            .map(|e| *e)
            .ok_or(OwnershipError::DoubleRelease { addr: raw.addr() })?;
        self.release_parts(raw, entry.id, entry.ownership)
    }

    pub(crate) fn release_parts(
        &self,
        raw: RawObject,
        id: InstanceId,
        ownership: Ownership,
    ) -> Result<(), OwnershipError> {
        let addr = raw.addr();
        match ownership {
            Ownership::Borrowed | Ownership::EngineOwned => return Ok(()),
            Ownership::Transferred => {
                if self
                    .live
                    .remove_if(&addr, |_, e| e.ownership == Ownership::Transferred)
                    .is_none()
                {
                    return Err(OwnershipError::DoubleRelease { addr });
                }
                self.released.fetch_add(1, Ordering::Relaxed);
                self.host.object_destroy(raw);
            }
            Ownership::RefCounted => {
                self.settle_reference(addr)?;
                self.released.fetch_add(1, Ordering::Relaxed);
                if self.host.unreference(raw) {
                    self.host.object_destroy(raw);
                }
            }
        }
        log::trace!("released {:?} ({:?})", id, ownership);
        Ok(())
    }

    /// Stop tracking an owned handle whose ownership moved to the engine
    pub(crate) fn forget(&self, raw: RawObject) {
        let addr = raw.addr();
        let ownership = self.live.get(&addr).map(|e| e.ownership);
        let settled = match ownership {
            Some(Ownership::RefCounted) => self.settle_reference(addr).is_ok(),
            Some(_) => self.live.remove(&addr).is_some(),
            None => false,
        };
        if settled {
            self.handed_off.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn settle_reference(&self, addr: usize) -> Result<(), OwnershipError> {
        match self.live.entry(addr) {
            Entry::Occupied(mut entry)
                if entry.get().ownership == Ownership::RefCounted && entry.get().outstanding > 0 =>
            {
                entry.get_mut().outstanding -= 1;
                if entry.get().outstanding == 0 {
                    entry.remove();
                }
                Ok(())
            }
            _ => Err(OwnershipError::DoubleRelease { addr }),
        }
    }

    /// Whether the engine still maps `id` to `raw`
    pub fn is_alive(&self, raw: RawObject, id: InstanceId) -> bool {
        self.host.object_from_id(id) == Some(raw)
    }

    pub(crate) fn cast(&self, raw: RawObject, class: &str) -> Option<RawObject> {
        let name = self.names.intern(class);
        self.host.cast_to(raw, self.names.to_raw(&name, &self.host))
    }

    /// Outstanding acquisitions for one object
    pub fn outstanding_for(&self, raw: RawObject) -> usize {
        self.live.get(&raw.addr()).map(|e| e.outstanding).unwrap_or(0)
    }

    /// Counter snapshot
    pub fn stats(&self) -> HandleStats {
        HandleStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            handed_off: self.handed_off.load(Ordering::Relaxed),
            outstanding: self.live.iter().map(|e| e.outstanding).sum(),
        }
    }

    /// Log every acquisition still outstanding; returns how many there were
    pub fn report_outstanding(&self) -> usize {
        let mut count = 0;
        for entry in self.live.iter() {
            log::warn!(
                "{:?} handle to object {:?} at {:#x} never released ({} outstanding)",
                entry.ownership,
                entry.id,
                entry.key(),
                entry.outstanding
            );
            count += entry.outstanding;
        }
        count
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}
