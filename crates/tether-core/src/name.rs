//! Interned names
//!
//! A [`StringName`] is an `Arc` to an interner entry. Two names are equal
//! exactly when they point at the same entry, so comparisons and hashing
//! never touch the text. Each entry caches the host's own interned handle
//! the first time it crosses the boundary; host names are never freed, so
//! the cache lives as long as the interner.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tether_sys::RawStringName;

use crate::host::HostApi;

struct NameEntry {
    text: Box<str>,
    raw: OnceCell<RawStringName>,
}

/// Deduplicated name used as a method and class key
#[derive(Clone)]
pub struct StringName(Arc<NameEntry>);

impl StringName {
    /// Text of the name
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    /// Host handle, if this name already crossed the boundary
    pub fn cached_raw(&self) -> Option<RawStringName> {
        self.0.raw.get().copied()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for StringName {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for StringName {}

impl Hash for StringName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for StringName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{:?}", self.as_str())
    }
}

impl fmt::Display for StringName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name table owned by one runtime
pub struct NameInterner {
    names: DashMap<Box<str>, StringName>,
    by_raw: DashMap<usize, StringName>,
}

impl NameInterner {
    /// Create an empty interner
    pub fn new() -> Self {
        Self {
            names: DashMap::new(),
            by_raw: DashMap::new(),
        }
    }

    /// Intern `text`; the same text always yields an identical name
    pub fn intern(&self, text: &str) -> StringName {
        if let Some(existing) = self.names.get(text) {
            return existing.clone();
        }
        self.names
            .entry(text.into())
            .or_insert_with(|| {
                StringName(Arc::new(NameEntry {
                    text: text.into(),
                    raw: OnceCell::new(),
                }))
            })
            .clone()
    }

    /// Host handle for a name, interning it on the host the first time
    pub fn to_raw(&self, name: &StringName, host: &HostApi) -> RawStringName {
        *name.0.raw.get_or_init(|| {
            let raw = host.new_name(name.as_str());
            self.by_raw.insert(raw.addr(), name.clone());
            raw
        })
    }

    /// Name for a host handle
    pub fn from_raw(&self, raw: RawStringName, host: &HostApi) -> StringName {
        if let Some(name) = self.by_raw.get(&raw.addr()) {
            return name.clone();
        }
        let name = self.intern(&host.read_name(raw));
        if name.0.raw.set(raw).is_ok() {
            self.by_raw.insert(raw.addr(), name.clone());
        }
        name
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether nothing was interned yet
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for NameInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_intern_identity() {
        let interner = NameInterner::new();
        let a = interner.intern("ready");
        let b = interner.intern("ready");
        let c = interner.intern("process");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_separate_interners_do_not_compare_equal() {
        let a = NameInterner::new().intern("ready");
        let b = NameInterner::new().intern("ready");
        assert_ne!(a, b);
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_hash_follows_identity() {
        let interner = NameInterner::new();
        let mut set = HashSet::new();
        set.insert(interner.intern("a"));
        set.insert(interner.intern("a"));
        set.insert(interner.intern("b"));
        assert_eq!(set.len(), 2);
        assert_eq!(format!("{:?}", interner.intern("a")), "&\"a\"");
    }

    #[test]
    fn test_concurrent_intern_converges() {
        let interner = Arc::new(NameInterner::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let interner = interner.clone();
                std::thread::spawn(move || interner.intern("shared"))
            })
            .collect();
        let names: Vec<StringName> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(names.windows(2).all(|w| w[0] == w[1]));
    }
}
