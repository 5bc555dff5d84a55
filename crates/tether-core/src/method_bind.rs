//! Method Bind Table
//!
//! Resolves `(class, method)` to the engine's method bind on first use and
//! keeps it for the life of the runtime. Entries are never removed or
//! replaced.
//!
//! Concurrent first resolutions of the same key serialize on the map's
//! entry lock, so the engine is asked exactly once per key and every thread
//! sees the same entry. A miss means the bindings were generated for a
//! different engine build, and is fatal.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_sys::RawMethodBind;

use crate::error::{fatal, AbiViolation};
use crate::handle::Ownership;
use crate::host::HostApi;
use crate::name::{NameInterner, StringName};
use crate::runtime::RuntimeStats;

/// What a method's return value is, as documented by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnOwnership {
    /// A value type (or nothing)
    Value,
    /// An object with the given ownership
    Object(Ownership),
}

/// Static description of one engine method, emitted by the binding
/// generator next to each wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodSpec {
    /// Engine class declaring the method
    pub class: &'static str,
    /// Method name
    pub method: &'static str,
    /// Signature hash the engine checks on lookup
    pub hash: i64,
    /// Ownership of the returned object, if any
    pub returns: ReturnOwnership,
}

impl MethodSpec {
    /// Method returning a value type
    pub const fn new(class: &'static str, method: &'static str, hash: i64) -> Self {
        Self {
            class,
            method,
            hash,
            returns: ReturnOwnership::Value,
        }
    }

    /// Method returning an object with the given ownership
    pub const fn returning(self, ownership: Ownership) -> Self {
        Self {
            returns: ReturnOwnership::Object(ownership),
            ..self
        }
    }
}

/// Resolved method bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodBindEntry {
    raw: RawMethodBind,
    hash: i64,
}

impl MethodBindEntry {
    /// Engine handle for ptrcalls
    pub fn raw(&self) -> RawMethodBind {
        self.raw
    }

    /// Hash the bind was resolved with
    pub fn hash(&self) -> i64 {
        self.hash
    }
}

/// Process-lifetime cache of method binds
pub struct MethodBindTable {
    host: Arc<HostApi>,
    names: Arc<NameInterner>,
    stats: Arc<RuntimeStats>,
    entries: DashMap<(StringName, StringName), MethodBindEntry>,
}

impl MethodBindTable {
    /// Create an empty table
    pub fn new(host: Arc<HostApi>, names: Arc<NameInterner>, stats: Arc<RuntimeStats>) -> Self {
        Self {
            host,
            names,
            stats,
            entries: DashMap::new(),
        }
    }

    /// Bind for `class::method`, asking the engine on first use
    pub fn resolve(&self, class: &StringName, method: &StringName, hash: i64) -> MethodBindEntry {
        let key = (class.clone(), method.clone());
        if let Some(entry) = self.entries.get(&key) {
            return *entry;
        }

        match self.entries.entry(key) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(slot) => {
                let raw_class = self.names.to_raw(class, &self.host);
                let raw_method = self.names.to_raw(method, &self.host);
                let Some(raw) = self.host.method_bind(raw_class, raw_method, hash) else {
                    fatal(AbiViolation::MethodBindMissing {
                        class: class.to_string(),
                        method: method.to_string(),
                        hash,
                    });
                };
                self.stats.record_bind_resolved();
                log::debug!("resolved {}::{} (hash {})", class, method, hash);
                *slot.insert(MethodBindEntry { raw, hash })
            }
        }
    }

    /// Bind for a generated method description
    pub fn resolve_spec(&self, spec: &MethodSpec) -> MethodBindEntry {
        let class = self.names.intern(spec.class);
        let method = self.names.intern(spec.method);
        self.resolve(&class, &method, spec.hash)
    }

    /// Whether `class::method` was already resolved
    pub fn contains(&self, class: &str, method: &str) -> bool {
        let key = (self.names.intern(class), self.names.intern(method));
        self.entries.contains_key(&key)
    }

    /// Number of resolved binds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was resolved yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
