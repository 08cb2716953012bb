//! Growth primitives: the one external service a heap relies on.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS to expand the heap.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` hands out a borrowed byte slice, a piece at a time, pretending to
//! be a heap. It is mainly useful for testing, and for running several
//! independent heaps side by side.
//!
//! ### [`SbrkHeapGrower`](struct.SbrkHeapGrower.html)
//!
//! `SbrkHeapGrower` moves the program break with `sbrk`. Requires the
//! `use_libc` feature.

#[cfg(feature = "use_libc")]
use core::convert::TryFrom;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

#[cfg(feature = "use_libc")]
use errno::Errno;
use thiserror::Error;

use crate::block::ALIGNMENT;

/// A source of address space for a heap.
///
/// # Safety
///
/// Implementors promise that:
///
/// - A successful `grow_heap(delta)` returns the previous top of the region,
///   and the `delta` bytes starting there are newly usable, zeroed, and
///   untracked by any other code.
/// - The region is contiguous and never shrinks: each grant starts exactly at
///   the end of the one before, and `top()` is the end of the latest grant
///   (or the start of the region, before the first one).
/// - The first grant starts at an address aligned to `ALIGNMENT`.
pub unsafe trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the region by exactly `delta` bytes, returning the old top.
    fn grow_heap(&mut self, delta: usize) -> Result<NonNull<u8>, Self::Err>;

    /// The current top of the region: one past the last byte granted.
    fn top(&self) -> *mut u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("toy heap exhausted: asked for {requested} bytes with {available} left")]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

/// A growth primitive over a borrowed buffer.
///
/// The usable region starts at the first `ALIGNMENT`-aligned byte of the
/// buffer.
pub struct ToyHeap<'a> {
    base: NonNull<u8>,
    capacity: usize,
    size: usize,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> ToyHeap<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        let offset = buffer.as_ptr().align_offset(ALIGNMENT).min(buffer.len());
        let capacity = buffer.len() - offset;
        let base = unsafe { NonNull::new_unchecked(buffer.as_mut_ptr().add(offset)) };
        ToyHeap {
            base,
            capacity,
            size: 0,
            _buffer: PhantomData,
        }
    }

    /// Bytes granted so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes this heap can grant in total.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
}

unsafe impl HeapGrower for ToyHeap<'_> {
    type Err = ToyHeapOverflowError;

    fn grow_heap(&mut self, delta: usize) -> Result<NonNull<u8>, Self::Err> {
        let available = self.capacity - self.size;
        if delta > available {
            return Err(ToyHeapOverflowError {
                requested: delta,
                available,
            });
        }

        unsafe {
            let old_top = self.base.as_ptr().add(self.size);
            ptr::write_bytes(old_top, 0, delta);
            self.size += delta;
            Ok(NonNull::new_unchecked(old_top))
        }
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.size) }
    }
}

#[cfg(feature = "use_libc")]
#[derive(Debug, Error)]
pub enum SbrkError {
    #[error("sbrk failed: {0:?}")]
    Errno(Errno),
    #[error("the program break moved underneath us: expected {expected:#x}, found {found:#x}")]
    Discontiguous { expected: usize, found: usize },
    #[error("cannot move the program break by {0} bytes")]
    TooLarge(usize),
}

/// SbrkHeapGrower grows the heap by moving the program break.
///
/// Anything else in the process that moves the break (the system `malloc`,
/// for instance) breaks the contiguity a heap relies on. That is detected at
/// the next growth, which then fails with `SbrkError::Discontiguous`.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct SbrkHeapGrower {
    // The end of our last grant, or 0 before the first one
    top: usize,
    // Just for tracking, not really needed
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl SbrkHeapGrower {
    pub const fn new() -> Self {
        SbrkHeapGrower { top: 0, growths: 0 }
    }

    pub fn growths(&self) -> usize {
        self.growths
    }

    fn sbrk(increment: usize) -> Result<usize, SbrkError> {
        let increment = libc::intptr_t::try_from(increment).map_err(|_| SbrkError::TooLarge(increment))?;
        let old = unsafe { libc::sbrk(increment) };
        if old as isize == -1 {
            return Err(SbrkError::Errno(errno::errno()));
        }
        Ok(old as usize)
    }
}

#[cfg(feature = "use_libc")]
unsafe impl HeapGrower for SbrkHeapGrower {
    type Err = SbrkError;

    fn grow_heap(&mut self, delta: usize) -> Result<NonNull<u8>, SbrkError> {
        if self.top == 0 {
            // Pad the break out to our alignment before the first grant
            let current = Self::sbrk(0)?;
            let padding = current.wrapping_neg() & (ALIGNMENT - 1);
            if padding > 0 {
                Self::sbrk(padding)?;
            }
            self.top = current + padding;
        }

        let old = Self::sbrk(delta)?;
        if old != self.top {
            return Err(SbrkError::Discontiguous {
                expected: self.top,
                found: old,
            });
        }

        self.top = old + delta;
        self.growths += 1;
        NonNull::new(old as *mut u8).ok_or(SbrkError::Discontiguous {
            expected: self.top,
            found: 0,
        })
    }

    fn top(&self) -> *mut u8 {
        self.top as *mut u8
    }
}
