//! Engine-Allocated Buffers
//!
//! Every byte run that crosses the boundary is allocated and freed through
//! `jsonnet_realloc` on the VM that owns it. [`NativeBuffer`] is the scoped
//! wrapper: it borrows the allocator of its VM, so it cannot outlive the
//! handle, and it frees itself exactly once unless ownership is handed to
//! the engine.

use crate::error::{CodecError, Error, Result};
use crate::ffi;
use std::cell::Cell;
use std::ffi::{c_char, CStr};
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;
use tracing::{trace, warn};

/// Buffer accounting for one VM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Buffers allocated by the host through the engine allocator
    pub allocated: u64,
    /// Buffers received from the engine (results, error messages)
    pub adopted: u64,
    /// Buffers freed by the host
    pub released: u64,
    /// Buffers whose ownership was handed to the engine
    pub transferred: u64,
    /// Total bytes requested from the allocator
    pub bytes_allocated: u64,
}

impl BufferStats {
    /// Buffers currently owned by the host
    pub fn live(&self) -> u64 {
        (self.allocated + self.adopted).saturating_sub(self.released + self.transferred)
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "Buffers: {} allocated ({} bytes), {} adopted, {} released, {} handed off, {} live",
            self.allocated,
            self.bytes_allocated,
            self.adopted,
            self.released,
            self.transferred,
            self.live()
        )
    }
}

#[derive(Default)]
struct Ledger {
    allocated: Cell<u64>,
    adopted: Cell<u64>,
    released: Cell<u64>,
    transferred: Cell<u64>,
    bytes_allocated: Cell<u64>,
}

fn bump(cell: &Cell<u64>, by: u64) {
    cell.set(cell.get() + by);
}

/// Handle on one VM's allocator
///
/// Cloned into every callback context so bridges allocate through the same
/// allocator as the VM that invoked them.
#[derive(Clone)]
pub(crate) struct EngineAllocator {
    vm: NonNull<ffi::JsonnetVm>,
    ledger: Rc<Ledger>,
}

impl EngineAllocator {
    pub(crate) fn new(vm: NonNull<ffi::JsonnetVm>) -> Self {
        Self {
            vm,
            ledger: Rc::new(Ledger::default()),
        }
    }

    /// Copy `bytes` plus a NUL terminator into a fresh engine buffer
    pub(crate) fn allocate(&self, bytes: &[u8]) -> Result<NativeBuffer<'_>> {
        if let Some(pos) = bytes.iter().position(|&b| b == 0) {
            return Err(CodecError::InteriorNul(pos).into());
        }

        let size = bytes.len() + 1;
        // SAFETY: the VM is live for as long as this allocator is reachable.
        let raw = unsafe { ffi::jsonnet_realloc(self.vm.as_ptr(), std::ptr::null_mut(), size) };
        let Some(ptr) = NonNull::new(raw) else {
            warn!(size, "Engine allocator returned NULL");
            return Err(Error::Allocation { size });
        };

        // SAFETY: `ptr` points to `size` writable bytes we just obtained.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().cast::<u8>(), bytes.len());
            *ptr.as_ptr().add(bytes.len()) = 0;
        }

        bump(&self.ledger.allocated, 1);
        bump(&self.ledger.bytes_allocated, size as u64);
        trace!(size, "Allocated engine buffer");

        Ok(NativeBuffer {
            ptr,
            len: bytes.len(),
            alloc: self,
        })
    }

    /// Take ownership of a NUL-terminated buffer returned by the engine
    ///
    /// # Safety
    ///
    /// `raw` must be NULL or a buffer allocated by this VM's allocator that
    /// nobody else will free.
    pub(crate) unsafe fn adopt(&self, raw: *mut c_char) -> Option<NativeBuffer<'_>> {
        let ptr = NonNull::new(raw)?;
        // SAFETY: engine buffers carrying text are NUL-terminated.
        let len = unsafe { CStr::from_ptr(ptr.as_ptr()) }.to_bytes().len();
        bump(&self.ledger.adopted, 1);
        Some(NativeBuffer {
            ptr,
            len,
            alloc: self,
        })
    }

    fn release(&self, ptr: NonNull<c_char>) {
        // SAFETY: size 0 on an existing buffer frees it; callers guarantee
        // the buffer came from this allocator and is released once.
        unsafe { ffi::jsonnet_realloc(self.vm.as_ptr(), ptr.as_ptr(), 0) };
        bump(&self.ledger.released, 1);
    }

    pub(crate) fn stats(&self) -> BufferStats {
        BufferStats {
            allocated: self.ledger.allocated.get(),
            adopted: self.ledger.adopted.get(),
            released: self.ledger.released.get(),
            transferred: self.ledger.transferred.get(),
            bytes_allocated: self.ledger.bytes_allocated.get(),
        }
    }
}

/// A NUL-terminated byte run owned by an engine allocator
///
/// Released through the same allocator on drop.
pub struct NativeBuffer<'vm> {
    ptr: NonNull<c_char>,
    len: usize,
    alloc: &'vm EngineAllocator,
}

impl NativeBuffer<'_> {
    /// Contents without the terminator
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `len` bytes were written or measured when the buffer was
        // created and the buffer is not mutated afterwards.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    /// Split a buffer laid out as `a\0b\0...\0\0` into its parts
    ///
    /// # Safety
    ///
    /// The buffer must really be terminated by an empty part, as the
    /// engine's multi and stream outputs are.
    pub(crate) unsafe fn nul_separated(&self) -> Vec<&[u8]> {
        let mut parts = Vec::new();
        let mut cursor = self.ptr.as_ptr().cast_const();
        loop {
            // SAFETY: every part, including the final empty one, is
            // NUL-terminated within the allocation.
            let part = unsafe { CStr::from_ptr(cursor) }.to_bytes();
            if part.is_empty() {
                break;
            }
            cursor = unsafe { cursor.add(part.len() + 1) };
            parts.push(part);
        }
        parts
    }

    /// Contents as UTF-8 text
    pub fn to_str(&self) -> std::result::Result<&str, CodecError> {
        std::str::from_utf8(self.as_bytes()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the buffer to its allocator now
    pub fn release(self) {
        drop(self);
    }

    /// Hand ownership to the engine, which frees it
    pub(crate) fn into_raw(self) -> *mut c_char {
        let ptr = self.ptr.as_ptr();
        bump(&self.alloc.ledger.transferred, 1);
        std::mem::forget(self);
        ptr
    }
}

impl Drop for NativeBuffer<'_> {
    fn drop(&mut self) {
        self.alloc.release(self.ptr);
    }
}

impl fmt::Debug for NativeBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("len", &self.len)
            .field("text", &String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}
