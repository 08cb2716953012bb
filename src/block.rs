//! Block headers, and the `Block` handle used to read and relink them.
//!
//! Every block in the heap, free or allocated, starts with a
//! [`BlockHeader`](struct.BlockHeader.html). The payload handed to callers
//! begins immediately after it:
//!
//! ```text
//!   header address                payload address
//!   |                             |
//!   v                             v
//!   +------+------+------+-------+---------------------------+
//!   | prev | next | size | state |  size bytes of payload    |
//!   +------+------+------+-------+---------------------------+
//!   |<-------- HEADER_SIZE ----->|
//! ```
//!
//! A `Block` is only a pointer to a header. It does not own the memory it
//! points to, and copies of it may exist in both links of its neighbours; the
//! chains in [`blocklist`](../blocklist/index.html) are responsible for
//! keeping those links consistent.

use core::fmt;
use core::mem;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// Alignment of every header and every payload, in bytes.
pub const ALIGNMENT: usize = 8;

/// The largest payload a single request may ask for.
///
/// This is aligned, so rounding a request up to `ALIGNMENT` never takes it
/// past the bound.
pub const MAX_BLOCK_SIZE: usize = (i32::MAX as usize) & !(ALIGNMENT - 1);

/// Which chain a block currently belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Free,
    Allocated,
}

/// The header written in front of every block.
///
/// `prev` and `next` belong to whichever chain currently holds the block.
/// `size` counts payload bytes only.
#[repr(C, align(8))]
pub struct BlockHeader {
    prev: Option<Block>,
    next: Option<Block>,
    size: usize,
    state: BlockState,
}

/// Bytes taken by a header; payloads start this far past their header.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(mem::align_of::<BlockHeader>() <= ALIGNMENT);
const_assert!(MAX_BLOCK_SIZE % ALIGNMENT == 0);

/// Round value up to the nearest multiple of increment
pub fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// A handle to a header living somewhere in the heap.
///
/// Accessors read and write the header through the raw pointer, never through
/// a long-lived reference, so any number of handles to the same block may be
/// held at once.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// A Block is sendable - the heap it points into moves between threads with
// whoever owns the allocator. It is not Sync; access must be serialized.
unsafe impl Send for Block {}

impl Block {
    /// Write a fresh, unlinked header at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `ALIGNMENT`, and the `HEADER_SIZE + size`
    /// bytes starting there must belong to the heap and must not be reachable
    /// from either chain.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn write(ptr: NonNull<u8>, size: usize, state: BlockState) -> Block {
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        let header: NonNull<BlockHeader> = ptr.cast();
        header.as_ptr().write(BlockHeader {
            prev: None,
            next: None,
            size,
            state,
        });
        Block { header }
    }

    /// View an existing header at `ptr`.
    ///
    /// # Safety
    ///
    /// A header must have been written at `ptr` by [`Block::write`].
    pub unsafe fn from_header(ptr: NonNull<u8>) -> Block {
        Block { header: ptr.cast() }
    }

    /// Recover the block that owns `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must have come from [`Block::payload`] on a block of this
    /// heap.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        Block::from_header(NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)))
    }

    /// Address of the header.
    pub fn addr(self) -> usize {
        self.header.as_ptr() as usize
    }

    /// Address one past the last payload byte.
    pub fn end(self) -> usize {
        self.addr() + self.span()
    }

    /// Bytes this block occupies, header included.
    pub fn span(self) -> usize {
        HEADER_SIZE + self.size()
    }

    pub fn start(self) -> NonNull<u8> {
        self.header.cast()
    }

    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.start().as_ptr().add(HEADER_SIZE)) }
    }

    pub fn size(self) -> usize {
        unsafe { (*self.header.as_ptr()).size }
    }

    pub fn state(self) -> BlockState {
        unsafe { (*self.header.as_ptr()).state }
    }

    pub fn prev(self) -> Option<Block> {
        unsafe { (*self.header.as_ptr()).prev }
    }

    pub fn next(self) -> Option<Block> {
        unsafe { (*self.header.as_ptr()).next }
    }

    pub(crate) fn set_size(self, size: usize) {
        unsafe { (*self.header.as_ptr()).size = size }
    }

    pub(crate) fn set_state(self, state: BlockState) {
        unsafe { (*self.header.as_ptr()).state = state }
    }

    pub(crate) fn set_prev(self, prev: Option<Block>) {
        unsafe { (*self.header.as_ptr()).prev = prev }
    }

    pub(crate) fn set_next(self, next: Option<Block>) {
        unsafe { (*self.header.as_ptr()).next = next }
    }

    /// Whether `self` ends exactly where `upper` begins.
    pub fn is_adjacent_below(self, upper: Block) -> bool {
        self.end() == upper.addr()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:?}, {}, {:?})", self.header, self.size(), self.state())
    }
}
