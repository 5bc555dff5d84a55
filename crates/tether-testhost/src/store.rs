//! Host-side object, string and container storage
//!
//! Everything lives behind one mutex in `HostState`. Handles are fake
//! addresses handed out by `next_addr`; the extension never dereferences
//! them, so they only need to be unique and non-null. Memory from
//! `mem_alloc` is real because the extension writes boxed variant payloads
//! into it.

use std::alloc::Layout;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tether_sys::{
    CallableCallFn, CallableFreeFn, CallableIsValidFn, ClassCreationInfo, InstanceId,
    MethodCallFn, MethodFlags, MethodPtrCallFn, PackedElement, RawObject, RawVariant, VariantType,
};

use crate::call::{MethodFn, VarMethodFn};
use crate::HostState;

/// Hash the host expects for `Object.emit_signal`
pub const EMIT_SIGNAL_HASH: i64 = 4047867050;

/// One engine object
#[derive(Debug, Clone)]
pub(crate) struct ObjectRecord {
    pub id: u64,
    pub class: String,
    /// `None` for objects that do not inherit RefCounted
    pub refcount: Option<i64>,
    /// Extension instance data, set by `object_set_instance`
    pub instance: Option<usize>,
    /// Callbacks of the extension class the instance was attached for.
    /// Kept per object so live instances survive class unregistration.
    pub extension: Option<ExtensionInfo>,
    /// Virtual call data already asked for, by method name; 0 when the
    /// class had no override
    pub virtuals: FxHashMap<String, usize>,
}

/// Callback table copied at registration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtensionInfo(pub ClassCreationInfo);

// The extension promises its userdata outlives the registration and is
// usable from any thread.
unsafe impl Send for ExtensionInfo {}

#[derive(Debug, Clone)]
pub(crate) struct ClassRecord {
    pub parent: Option<String>,
    pub extension: Option<ExtensionInfo>,
}

pub(crate) struct MethodRecord {
    pub hash: i64,
    pub bind: usize,
}

/// Native method body behind a bind
#[derive(Clone)]
pub(crate) enum Bind {
    /// Fixed signature, called with a ptrcall frame
    Ptr(Arc<MethodFn>),
    /// Any number of variant arguments
    Var(Arc<VarMethodFn>),
}

/// Method an extension class registered
#[derive(Debug, Clone)]
pub struct ExtensionMethod {
    /// Argument names and types
    pub args: Vec<(String, VariantType)>,
    /// Return type, `None` for methods returning nothing
    pub ret: Option<VariantType>,
    /// Flag bits
    pub flags: MethodFlags,
    pub(crate) userdata: usize,
    pub(crate) call: Option<MethodCallFn>,
    pub(crate) ptrcall: Option<MethodPtrCallFn>,
}

/// Property an extension class registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionProperty {
    /// Declared type
    pub kind: Option<VariantType>,
    /// Getter method name
    pub getter: String,
    /// Setter method name, empty when read-only
    pub setter: String,
}

/// Signal an extension class registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSignal {
    /// Signal name
    pub name: String,
    /// Argument names and types
    pub args: Vec<(String, Option<VariantType>)>,
}

/// Integer constant an extension class registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConstant {
    /// Enum the constant belongs to
    pub enum_name: Option<String>,
    /// Value
    pub value: i64,
    /// Whether the enum is a bitfield
    pub is_bitfield: bool,
}

/// One `emit_signal` the host received, with arguments rendered as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedSignal {
    /// Emitting object
    pub source: InstanceId,
    /// Signal name
    pub signal: String,
    /// Rendered arguments
    pub args: Vec<String>,
}

/// Custom callable created by the extension, reference counted by copies
/// of its variant
#[derive(Debug, Clone)]
pub(crate) struct CallableRecord {
    pub name: String,
    pub userdata: usize,
    pub call: Option<CallableCallFn>,
    pub is_valid: Option<CallableIsValidFn>,
    pub free: Option<CallableFreeFn>,
    pub refs: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct PackedRecord {
    pub element: PackedElement,
    pub len: usize,
    /// Element bytes, stored in u64 words for alignment
    pub words: Vec<u64>,
}

#[derive(Default)]
pub(crate) struct Store {
    next_addr: usize,
    next_id: u64,

    pub objects: FxHashMap<usize, ObjectRecord>,
    pub ids: FxHashMap<u64, usize>,
    pub classes: FxHashMap<String, ClassRecord>,
    pub methods: FxHashMap<(String, String), MethodRecord>,
    pub binds: FxHashMap<usize, Bind>,
    pub bind_lookups: FxHashMap<(String, String), usize>,
    pub strings: FxHashMap<usize, String>,
    pub names: FxHashMap<usize, String>,
    pub name_lookup: FxHashMap<String, usize>,
    pub arrays: FxHashMap<usize, Vec<RawVariant>>,
    pub dictionaries: FxHashMap<usize, Vec<(RawVariant, RawVariant)>>,
    pub packed: FxHashMap<usize, PackedRecord>,
    pub allocations: FxHashMap<usize, Layout>,
    pub singletons: FxHashMap<String, usize>,
    pub ext_methods: FxHashMap<(String, String), ExtensionMethod>,
    pub properties: FxHashMap<(String, String), ExtensionProperty>,
    pub signals: FxHashMap<String, Vec<ExtensionSignal>>,
    pub constants: FxHashMap<(String, String), ExtensionConstant>,
    pub callables: FxHashMap<u64, CallableRecord>,
    /// Callables whose last reference went away, freed once the lock is
    /// released
    pub pending_frees: Vec<(CallableFreeFn, usize)>,
    pub emitted: Vec<EmittedSignal>,
    pub registered: Vec<String>,
    pub unregistered: Vec<String>,
    pub destroyed: Vec<u64>,

    /// Frees of handles the host does not know about
    pub invalid_frees: usize,
    /// Unreference calls on a count already at zero
    pub over_releases: usize,
}

const BUILTIN_CLASSES: &[(&str, Option<&str>)] = &[
    ("Object", None),
    ("RefCounted", Some("Object")),
    ("Resource", Some("RefCounted")),
    ("Node", Some("Object")),
    ("Node2D", Some("Node")),
];

impl Store {
    pub fn new() -> Self {
        let mut store = Store::default();
        store.next_addr = 0x10_0000;
        store.next_id = 1;
        for (name, parent) in BUILTIN_CLASSES {
            store.classes.insert(
                name.to_string(),
                ClassRecord {
                    parent: parent.map(str::to_string),
                    extension: None,
                },
            );
        }
        let bind = store.next_addr();
        let emit: Arc<VarMethodFn> =
            Arc::new(|host: &HostState, receiver: RawObject, args: &[RawVariant]| {
                host.emit_signal(receiver, args)
            });
        store.binds.insert(bind, Bind::Var(emit));
        store.methods.insert(
            ("Object".to_string(), "emit_signal".to_string()),
            MethodRecord {
                hash: EMIT_SIGNAL_HASH,
                bind,
            },
        );
        store
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn next_addr(&mut self) -> usize {
        self.next_addr += 16;
        self.next_addr
    }

    // ========================================================================
    // Classes and objects
    // ========================================================================

    /// Class followed by its ancestors
    pub fn class_chain(&self, class: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            current = self.classes.get(&name).and_then(|c| c.parent.clone());
            chain.push(name);
        }
        chain
    }

    pub fn inherits(&self, class: &str, ancestor: &str) -> bool {
        self.class_chain(class).iter().any(|c| c == ancestor)
    }

    pub fn new_object(&mut self, class: &str) -> usize {
        let addr = self.next_addr();
        let id = self.next_id();
        let refcount = self.inherits(class, "RefCounted").then_some(0);
        self.objects.insert(
            addr,
            ObjectRecord {
                id,
                class: class.to_string(),
                refcount,
                instance: None,
                extension: None,
                virtuals: FxHashMap::default(),
            },
        );
        self.ids.insert(id, addr);
        addr
    }

    /// Remove an object; returns its extension instance and class info, if any
    pub fn remove_object(&mut self, addr: usize) -> Option<(usize, Option<ExtensionInfo>)> {
        let Some(record) = self.objects.remove(&addr) else {
            self.invalid_frees += 1;
            return None;
        };
        self.ids.remove(&record.id);
        self.destroyed.push(record.id);
        let instance = record.instance?;
        Some((instance, record.extension))
    }

    // ========================================================================
    // Strings and names
    // ========================================================================

    pub fn new_string(&mut self, text: &str) -> usize {
        let addr = self.next_addr();
        self.strings.insert(addr, text.to_string());
        addr
    }

    pub fn destroy_string(&mut self, addr: usize) {
        if self.strings.remove(&addr).is_none() {
            self.invalid_frees += 1;
        }
    }

    pub fn intern(&mut self, text: &str) -> usize {
        if let Some(addr) = self.name_lookup.get(text) {
            return *addr;
        }
        let addr = self.next_addr();
        self.names.insert(addr, text.to_string());
        self.name_lookup.insert(text.to_string(), addr);
        addr
    }

    // ========================================================================
    // Memory
    // ========================================================================

    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let Ok(layout) = Layout::from_size_align(size.max(1), 16) else {
            return std::ptr::null_mut();
        };
        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if !ptr.is_null() {
            self.allocations.insert(ptr as usize, layout);
        }
        ptr
    }

    pub fn free(&mut self, ptr: usize) {
        match self.allocations.remove(&ptr) {
            // SAFETY: allocated by `alloc` with this layout
            Some(layout) => unsafe { std::alloc::dealloc(ptr as *mut u8, layout) },
            None => self.invalid_frees += 1,
        }
    }

    // ========================================================================
    // Packed arrays
    // ========================================================================

    /// Copy `len` elements from `data`. String elements are copied into new
    /// host strings owned by the packed array.
    ///
    /// # Safety
    /// `data` must point to `len` elements of kind `element`.
    pub unsafe fn new_packed(
        &mut self,
        element: PackedElement,
        data: *const u8,
        len: usize,
    ) -> usize {
        let bytes = element.size() * len;
        let mut words = vec![0u64; (bytes + 7) / 8];
        if element == PackedElement::String {
            let handles = data as *const usize;
            for i in 0..len {
                let source = handles.add(i).read_unaligned();
                let text = self.strings.get(&source).cloned().unwrap_or_default();
                words[i] = self.new_string(&text) as u64;
            }
        } else if bytes > 0 {
            std::ptr::copy_nonoverlapping(data, words.as_mut_ptr() as *mut u8, bytes);
        }
        let addr = self.next_addr();
        self.packed.insert(
            addr,
            PackedRecord {
                element,
                len,
                words,
            },
        );
        addr
    }

    pub fn destroy_packed(&mut self, addr: usize) {
        let Some(record) = self.packed.remove(&addr) else {
            self.invalid_frees += 1;
            return;
        };
        if record.element == PackedElement::String {
            for word in &record.words[..record.len] {
                self.destroy_string(*word as usize);
            }
        }
    }

    fn copy_packed(&mut self, addr: usize) -> usize {
        let Some(record) = self.packed.get(&addr).cloned() else {
            return 0;
        };
        if record.element == PackedElement::String {
            let handles: Vec<usize> = record.words[..record.len]
                .iter()
                .map(|w| *w as usize)
                .collect();
            // SAFETY: handles is a live buffer of `len` string handles
            unsafe { self.new_packed(record.element, handles.as_ptr() as *const u8, record.len) }
        } else {
            let new_addr = self.next_addr();
            self.packed.insert(new_addr, record);
            new_addr
        }
    }

    // ========================================================================
    // Variants
    // ========================================================================

    /// Deep copy, the way the engine's copy constructor behaves
    pub fn copy_variant(&mut self, src: &RawVariant) -> RawVariant {
        let mut out = *src;
        let Some(ty) = src.variant_type() else {
            return out;
        };
        match ty {
            VariantType::String | VariantType::NodePath => {
                let text = self
                    .strings
                    .get(&(src.payload[0] as usize))
                    .cloned()
                    .unwrap_or_default();
                out.payload[0] = self.new_string(&text) as u64;
            }
            t if t.is_boxed() => {
                let size = boxed_size(t);
                let dst = self.alloc(size);
                // SAFETY: source box was allocated with the same size
                unsafe {
                    std::ptr::copy_nonoverlapping(src.payload[0] as *const u8, dst, size);
                }
                out.payload[0] = dst as u64;
            }
            VariantType::Array => {
                let elements = self
                    .arrays
                    .get(&(src.payload[0] as usize))
                    .cloned()
                    .unwrap_or_default();
                let copies: Vec<RawVariant> =
                    elements.iter().map(|e| self.copy_variant(e)).collect();
                let addr = self.next_addr();
                self.arrays.insert(addr, copies);
                out.payload[0] = addr as u64;
            }
            VariantType::Dictionary => {
                let entries = self
                    .dictionaries
                    .get(&(src.payload[0] as usize))
                    .cloned()
                    .unwrap_or_default();
                let copies: Vec<(RawVariant, RawVariant)> = entries
                    .iter()
                    .map(|(k, v)| (self.copy_variant(k), self.copy_variant(v)))
                    .collect();
                let addr = self.next_addr();
                self.dictionaries.insert(addr, copies);
                out.payload[0] = addr as u64;
            }
            t if t.packed_element().is_some() => {
                out.payload[0] = self.copy_packed(src.payload[0] as usize) as u64;
            }
            VariantType::Callable => {
                if let Some(record) = self.callables.get_mut(&src.payload[0]) {
                    record.refs += 1;
                }
            }
            _ => {}
        }
        out
    }

    /// Release a variant's resources and reset it to nil
    pub fn destroy_variant(&mut self, v: &mut RawVariant) {
        if let Some(ty) = v.variant_type() {
            let addr = v.payload[0] as usize;
            match ty {
                VariantType::String | VariantType::NodePath => self.destroy_string(addr),
                t if t.is_boxed() => self.free(addr),
                VariantType::Array => self.destroy_array(addr),
                VariantType::Dictionary => self.destroy_dictionary(addr),
                t if t.packed_element().is_some() => self.destroy_packed(addr),
                VariantType::Callable => self.release_callable(v.payload[0]),
                _ => {}
            }
        }
        *v = RawVariant::NIL;
    }

    fn release_callable(&mut self, id: u64) {
        let Some(record) = self.callables.get_mut(&id) else {
            return;
        };
        record.refs = record.refs.saturating_sub(1);
        if record.refs == 0 {
            if let Some(record) = self.callables.remove(&id) {
                if let Some(free) = record.free {
                    self.pending_frees.push((free, record.userdata));
                }
            }
        }
    }

    /// Short text form of a variant, for recording what the extension sent
    pub fn describe_variant(&self, v: &RawVariant) -> String {
        let p0 = v.payload[0];
        match v.variant_type() {
            Some(VariantType::Nil) => "null".to_string(),
            Some(VariantType::Bool) => (p0 != 0).to_string(),
            Some(VariantType::Int) => (p0 as i64).to_string(),
            Some(VariantType::Float) => f64::from_bits(p0).to_string(),
            Some(VariantType::String) | Some(VariantType::NodePath) => {
                self.strings.get(&(p0 as usize)).cloned().unwrap_or_default()
            }
            Some(VariantType::StringName) => {
                self.names.get(&(p0 as usize)).cloned().unwrap_or_default()
            }
            Some(other) => format!("{:?}", other),
            None => format!("tag {}", v.tag),
        }
    }

    /// Extension method declared by `class` or its nearest ancestor
    pub fn find_ext_method(&self, class: &str, method: &str) -> Option<ExtensionMethod> {
        self.class_chain(class)
            .into_iter()
            .find_map(|c| self.ext_methods.get(&(c, method.to_string())).cloned())
    }

    /// Drop every member registered for `class`
    pub fn forget_members(&mut self, class: &str) {
        self.ext_methods.retain(|(c, _), _| c != class);
        self.properties.retain(|(c, _), _| c != class);
        self.constants.retain(|(c, _), _| c != class);
        self.signals.remove(class);
    }

    pub fn destroy_array(&mut self, addr: usize) {
        let Some(elements) = self.arrays.remove(&addr) else {
            self.invalid_frees += 1;
            return;
        };
        for mut e in elements {
            self.destroy_variant(&mut e);
        }
    }

    pub fn destroy_dictionary(&mut self, addr: usize) {
        let Some(entries) = self.dictionaries.remove(&addr) else {
            self.invalid_frees += 1;
            return;
        };
        for (mut k, mut v) in entries {
            self.destroy_variant(&mut k);
            self.destroy_variant(&mut v);
        }
    }

    /// Key equality for dictionaries: strings compare by content,
    /// everything else by tag and payload
    pub fn variant_key_eq(&self, a: &RawVariant, b: &RawVariant) -> bool {
        if a.tag != b.tag {
            return false;
        }
        match a.variant_type() {
            Some(VariantType::String) | Some(VariantType::NodePath) => {
                self.strings.get(&(a.payload[0] as usize))
                    == self.strings.get(&(b.payload[0] as usize))
            }
            _ => a.payload == b.payload,
        }
    }
}

/// Size of a boxed variant payload
pub(crate) fn boxed_size(ty: VariantType) -> usize {
    match ty {
        VariantType::Transform2D => 24,
        VariantType::Aabb => 24,
        VariantType::Basis => 36,
        VariantType::Transform3D => 48,
        VariantType::Projection => 64,
        _ => 0,
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        for (ptr, layout) in self.allocations.drain() {
            // SAFETY: allocated by `alloc` with this layout
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        }
    }
}
