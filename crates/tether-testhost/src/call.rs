//! Both directions of a ptrcall, seen from the engine side
//!
//! `HostCall` is what a simulated native method receives when the extension
//! invokes it. `VirtualCall` builds an engine-owned argument frame and calls
//! into an extension class, either an override the way the engine does for
//! virtual methods or a registered method through its ptrcall entry.

use std::ffi::c_void;

use tether_sys::{CallError, RawArgs, RawObject, RawRet, RawString, RawStringName, RawVariant};

use crate::HostState;

/// Body of a simulated native method
pub type MethodFn = dyn Fn(&mut HostCall<'_>) + Send + Sync;

/// Body of a simulated native method taking variant arguments. Arguments are
/// borrowed; the returned variant is owned by the caller.
pub type VarMethodFn =
    dyn Fn(&HostState, RawObject, &[RawVariant]) -> Result<RawVariant, CallError> + Send + Sync;

/// One invocation of a simulated native method
pub struct HostCall<'a> {
    /// Host the call arrived on
    pub host: &'a HostState,
    /// Object the method was invoked on
    pub receiver: RawObject,
    args: RawArgs,
    ret: RawRet,
}

impl<'a> HostCall<'a> {
    pub(crate) fn new(host: &'a HostState, receiver: RawObject, args: RawArgs, ret: RawRet) -> Self {
        Self {
            host,
            receiver,
            args,
            ret,
        }
    }

    fn arg_ptr(&self, index: usize) -> *const c_void {
        // SAFETY: the extension passes one pointer per declared argument
        unsafe { *self.args.add(index) }
    }

    /// Read a plain-data argument
    pub fn arg<T: Copy>(&self, index: usize) -> T {
        // SAFETY: caller names the type the method was declared with
        unsafe { (self.arg_ptr(index) as *const T).read_unaligned() }
    }

    /// Read a String argument (borrowed, the extension keeps ownership)
    pub fn arg_string(&self, index: usize) -> String {
        let raw: RawString = self.arg(index);
        self.host.string_content(raw).unwrap_or_default()
    }

    /// Read a StringName argument
    pub fn arg_name(&self, index: usize) -> String {
        let raw: RawStringName = self.arg(index);
        self.host.name_content(raw).unwrap_or_default()
    }

    /// Read a Variant argument (bitwise, still owned by the extension)
    pub fn arg_variant(&self, index: usize) -> RawVariant {
        self.arg(index)
    }

    /// Write a plain-data return value
    pub fn ret<T: Copy>(&mut self, value: T) {
        // SAFETY: the extension sized the return slot for the declared type
        unsafe { (self.ret as *mut T).write_unaligned(value) }
    }

    /// Return a new host string; the extension takes ownership
    pub fn ret_string(&mut self, text: &str) {
        let raw = self.host.new_string(text);
        self.ret(raw);
    }

    /// Return a deep copy of `value`; the extension takes ownership
    pub fn ret_variant_copy(&mut self, value: &RawVariant) {
        let copy = self.host.copy_variant(value);
        self.ret(copy);
    }
}

/// Whether the extension handled a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualOutcome {
    /// The extension returned call data and the override ran, or the
    /// registered method's ptrcall entry ran
    Overridden,
    /// No override or no such method; the engine would run its own default
    Default,
    /// The object is gone or is not an extension instance
    NotAnInstance,
}

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct HostSlot([u8; 64]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallTarget {
    Virtual,
    Method,
}

/// An engine-built argument frame for one virtual invocation
pub struct VirtualCall<'h> {
    host: &'h HostState,
    object: RawObject,
    method: String,
    target: CallTarget,
    slots: Vec<Box<HostSlot>>,
    strings: Vec<RawString>,
    variants: Vec<RawVariant>,
    ret_fill: u8,
}

impl<'h> VirtualCall<'h> {
    pub(crate) fn new(
        host: &'h HostState,
        object: RawObject,
        method: &str,
        target: CallTarget,
    ) -> Self {
        host.counters.frames_allocated.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Self {
            host,
            object,
            method: method.to_string(),
            target,
            slots: Vec::new(),
            strings: Vec::new(),
            variants: Vec::new(),
            ret_fill: 0,
        }
    }

    /// Append a plain-data argument
    pub fn arg<T: Copy>(mut self, value: T) -> Self {
        assert!(std::mem::size_of::<T>() <= 64);
        let mut slot = Box::new(HostSlot([0; 64]));
        // SAFETY: slot is 64 bytes, 16-aligned
        unsafe { (slot.0.as_mut_ptr() as *mut T).write_unaligned(value) };
        self.slots.push(slot);
        self
    }

    /// Append a String argument owned by the engine for the call
    pub fn arg_string(mut self, text: &str) -> Self {
        let raw = self.host.new_string(text);
        self.strings.push(raw);
        self.arg(raw)
    }

    /// Append a Variant argument owned by the engine for the call
    pub fn arg_variant(mut self, value: RawVariant) -> Self {
        self.variants.push(value);
        self.arg(value)
    }

    /// Fill the return slot with `byte` instead of zeroes before the call,
    /// to see whether the extension wrote it
    pub fn ret_filled(mut self, byte: u8) -> Self {
        self.ret_fill = byte;
        self
    }

    /// Run the call; the frame is released before this returns
    pub fn invoke(self) -> VirtualResult {
        let mut ret = Box::new(HostSlot([self.ret_fill; 64]));
        let args: Vec<*const c_void> = self
            .slots
            .iter()
            .map(|s| s.0.as_ptr() as *const c_void)
            .collect();
        let ret_ptr = ret.0.as_mut_ptr() as RawRet;
        let outcome = match self.target {
            CallTarget::Virtual => {
                self.host
                    .dispatch_virtual(self.object, &self.method, args.as_ptr(), ret_ptr)
            }
            CallTarget::Method => {
                self.host
                    .dispatch_method(self.object, &self.method, args.as_ptr(), ret_ptr)
            }
        };
        drop(self);
        VirtualResult { outcome, ret }
    }
}

impl Drop for VirtualCall<'_> {
    fn drop(&mut self) {
        for s in self.strings.drain(..) {
            self.host.destroy_string(s);
        }
        for mut v in self.variants.drain(..) {
            self.host.destroy_variant(&mut v);
        }
        self.host
            .counters
            .frames_freed
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Return slot of a finished virtual call
pub struct VirtualResult {
    /// What the extension did with the call
    pub outcome: VirtualOutcome,
    ret: Box<HostSlot>,
}

impl VirtualResult {
    /// Read the return slot as plain data
    pub fn ret<T: Copy>(&self) -> T {
        // SAFETY: slot is 64 bytes and initialized
        unsafe { (self.ret.0.as_ptr() as *const T).read_unaligned() }
    }

    /// Take a returned String; the engine destroys it after reading
    pub fn ret_string(&self, host: &HostState) -> Option<String> {
        let raw: RawString = self.ret();
        if raw.is_null() {
            return None;
        }
        let text = host.string_content(raw);
        host.destroy_string(raw);
        text
    }
}
