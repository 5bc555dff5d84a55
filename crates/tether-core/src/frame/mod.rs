//! Call Frame Encoder/Decoder
//!
//! A [`Frame`] is the argument array and return slot for one ptrcall:
//!
//! ```text
//! ptrs:  [*const c_void; arity] ---> slots[0..arity] (64 bytes each, 16-aligned)
//! ret:   *mut c_void           ---> return slot (64 bytes)
//! ```
//!
//! Buffers come from a per-thread pool. The life of a frame is
//! `write_arg* -> invoke -> read_result -> free`; writing after invoke,
//! reading before invoke and reading twice are ABI violations. Dropping the
//! frame frees it, so every exit path frees exactly once. Temporaries made
//! while encoding arguments (strings, containers) are destroyed at free.

mod ptrcall;

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::mem::ManuallyDrop;

use tether_sys::{RawObject, RawRet, RawVariant};

pub use ptrcall::{PtrArg, PtrCall};

use crate::error::{fatal, AbiViolation, ConversionResult, OwnershipError};
use crate::handle::{BorrowScope, Class, ManagedHandle, Ownership};
use crate::method_bind::MethodBindEntry;
use crate::runtime::Runtime;
use crate::variant::ObjectRef;

/// Argument slots per frame
pub const MAX_FRAME_ARGS: usize = 16;

/// Bytes per slot; the largest value passed by value is a 4x4 projection
pub const SLOT_SIZE: usize = 64;

/// One argument or return slot
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct Slot([u8; SLOT_SIZE]);

impl Slot {
    /// A zeroed slot
    pub const ZERO: Slot = Slot([0; SLOT_SIZE]);

    /// Pointer handed to the engine
    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self.0.as_mut_ptr() as *mut c_void
    }

    /// Raw contents
    pub fn bytes(&self) -> &[u8; SLOT_SIZE] {
        &self.0
    }
}

struct FrameBuffer {
    slots: [Slot; MAX_FRAME_ARGS],
    ret: Slot,
    ptrs: [*const c_void; MAX_FRAME_ARGS],
}

impl FrameBuffer {
    fn new() -> Box<Self> {
        Box::new(Self {
            slots: [Slot::ZERO; MAX_FRAME_ARGS],
            ret: Slot::ZERO,
            ptrs: [std::ptr::null(); MAX_FRAME_ARGS],
        })
    }

    fn prepare(&mut self, arity: usize) {
        self.ret = Slot::ZERO;
        for i in 0..arity {
            self.slots[i] = Slot::ZERO;
            self.ptrs[i] = self.slots[i].0.as_ptr() as *const c_void;
        }
        for ptr in &mut self.ptrs[arity..] {
            *ptr = std::ptr::null();
        }
    }
}

thread_local! {
    static POOL: RefCell<Vec<Box<FrameBuffer>>> = RefCell::new(Vec::new());
}

fn take_buffer() -> Box<FrameBuffer> {
    POOL.try_with(|pool| pool.borrow_mut().pop())
        .ok()
        .flatten()
        .unwrap_or_else(FrameBuffer::new)
}

fn return_buffer(buffer: Box<FrameBuffer>, capacity: usize) {
    let _ = POOL.try_with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < capacity {
            pool.push(buffer);
        }
    });
}

/// Buffers currently pooled on this thread
pub fn pooled_buffers() -> usize {
    POOL.try_with(|pool| pool.borrow().len()).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Building,
    Invoked,
    Read,
}

/// Anything a method can be invoked on
pub trait Receiver {
    /// Raw receiver pointer (null for static methods)
    fn receiver(&self) -> RawObject;

    /// Checked before invoke when instance id assertions are on
    fn check_receiver(&self) -> Result<(), OwnershipError> {
        Ok(())
    }
}

impl Receiver for RawObject {
    fn receiver(&self) -> RawObject {
        *self
    }
}

impl Receiver for ObjectRef {
    fn receiver(&self) -> RawObject {
        self.raw
    }
}

impl<C: Class> Receiver for ManagedHandle<'_, C> {
    fn receiver(&self) -> RawObject {
        self.as_raw()
    }

    fn check_receiver(&self) -> Result<(), OwnershipError> {
        if self.ownership() == Ownership::EngineOwned {
            self.ensure_alive()
        } else {
            Ok(())
        }
    }
}

/// Argument and return storage for one method invocation
pub struct Frame<'rt> {
    rt: &'rt Runtime,
    buffer: ManuallyDrop<Box<FrameBuffer>>,
    arity: usize,
    written: u32,
    temporaries: Vec<RawVariant>,
    state: Cell<FrameState>,
}

impl<'rt> Frame<'rt> {
    pub(crate) fn new(rt: &'rt Runtime, arity: usize) -> Self {
        if arity > MAX_FRAME_ARGS {
            fatal(AbiViolation::FrameOverflow {
                requested: arity,
                capacity: MAX_FRAME_ARGS,
            });
        }
        let mut buffer = take_buffer();
        buffer.prepare(arity);
        rt.stats().record_frame_allocated();
        Self {
            rt,
            buffer: ManuallyDrop::new(buffer),
            arity,
            written: 0,
            temporaries: Vec::new(),
            state: Cell::new(FrameState::Building),
        }
    }

    /// Declared argument count
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Encode argument `index`
    pub fn write_arg<T: PtrArg + ?Sized>(&mut self, index: usize, value: &T) {
        if self.state.get() != FrameState::Building {
            fatal(AbiViolation::ResultState("argument written after invoke"));
        }
        if index >= self.arity {
            fatal(AbiViolation::ArgumentIndex {
                index,
                arity: self.arity,
            });
        }
        let slot = self.buffer.slots[index].as_mut_ptr();
        // SAFETY: slot is a live, 16-aligned SLOT_SIZE buffer
        if let Some(temporary) = unsafe { value.write_arg(self.rt.bridge(), slot) } {
            self.temporaries.push(temporary);
        }
        self.written |= 1 << index;
    }

    /// Call the method with the written arguments.
    ///
    /// An engine-owned receiver the engine already freed is a fatal
    /// violation when `assert_instance_ids` is on.
    ///
    /// # Safety
    /// The written argument types and the result type read afterwards must
    /// match the method's native signature.
    pub unsafe fn invoke<R: Receiver + ?Sized>(&mut self, bind: MethodBindEntry, receiver: &R) {
        if self.state.get() != FrameState::Building {
            fatal(AbiViolation::ResultState("invoked twice"));
        }
        if let Some(index) = (0..self.arity).find(|&i| self.written & (1 << i) == 0) {
            fatal(AbiViolation::MissingArgument {
                index,
                arity: self.arity,
            });
        }
        if self.rt.config().assert_instance_ids {
            if let Err(OwnershipError::Freed { id }) = receiver.check_receiver() {
                fatal(AbiViolation::UseAfterFree { id });
            }
        }
        let ret = self.buffer.ret.as_mut_ptr() as RawRet;
        self.rt
            .host()
            .ptrcall(bind.raw(), receiver.receiver(), self.buffer.ptrs.as_ptr(), ret);
        self.state.set(FrameState::Invoked);
    }

    fn take_result(&self) -> *const c_void {
        match self.state.get() {
            FrameState::Building => fatal(AbiViolation::ResultState("read before invoke")),
            FrameState::Read => fatal(AbiViolation::ResultState("read twice")),
            FrameState::Invoked => self.state.set(FrameState::Read),
        }
        self.buffer.ret.0.as_ptr() as *const c_void
    }

    /// Decode the return slot. The caller owns the decoded value.
    pub fn read_result<R: PtrCall>(&self) -> ConversionResult<R> {
        let slot = self.take_result();
        // SAFETY: invoke's contract makes R the method's return type
        unsafe { R::read_ret(self.rt.bridge(), slot) }
    }

    /// Decode an object result with the method's documented ownership.
    ///
    /// Borrowed results live only as long as this frame.
    pub fn read_object<C: Class>(
        &self,
        ownership: Ownership,
    ) -> Result<Option<ManagedHandle<'_, C>>, OwnershipError> {
        let slot = self.take_result();
        // SAFETY: object results are a single pointer
        let raw = unsafe { (slot as *const RawObject).read_unaligned() };
        if raw.is_null() {
            return Ok(None);
        }
        let handles = self.rt.handles();
        match ownership {
            Ownership::Borrowed => handles.borrow(raw, self).map(Some),
            owned => handles.acquire(raw, owned).map(Some),
        }
    }

    /// Release the frame now instead of at end of scope
    pub fn free(self) {
        drop(self);
    }
}

impl BorrowScope for Frame<'_> {}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        for mut temporary in self.temporaries.drain(..) {
            self.rt.bridge().destroy(&mut temporary);
        }
        if self.state.get() == FrameState::Invoked {
            log::warn!("frame freed without reading its result");
        }
        // SAFETY: buffer is not used after this point
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        return_buffer(buffer, self.rt.config().frame_pool_size);
        self.rt.stats().record_frame_freed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_points_at_slots() {
        let mut buffer = FrameBuffer::new();
        buffer.slots[0].0[0] = 7;
        buffer.prepare(2);
        assert_eq!(buffer.slots[0].0[0], 0);
        assert_eq!(buffer.ptrs[1], buffer.slots[1].0.as_ptr() as *const c_void);
        assert!(buffer.ptrs[2].is_null());
    }

    #[test]
    fn test_pool_respects_capacity() {
        let before = pooled_buffers();
        return_buffer(FrameBuffer::new(), before + 1);
        return_buffer(FrameBuffer::new(), before + 1);
        assert_eq!(pooled_buffers(), before + 1);
        let _ = take_buffer();
        assert_eq!(pooled_buffers(), before);
    }

    #[test]
    fn test_slot_alignment() {
        assert_eq!(std::mem::align_of::<Slot>(), 16);
        assert_eq!(std::mem::size_of::<Slot>(), SLOT_SIZE);
    }
}
