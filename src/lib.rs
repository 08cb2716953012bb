#![cfg_attr(not(test), no_std)]

//! A first-fit heap allocator over a growable region.
//!
//! The heap is one contiguous region, obtained a piece at a time from a
//! [`HeapGrower`](grower/trait.HeapGrower.html) and carved into blocks. Each
//! block carries a header, and sits in exactly one of two chains: the free
//! chain, kept in address order and headed by a zero-sized sentinel at the top
//! of the region, or the allocation chain, in allocation order.
//!
//! [`RawAlloc`](allocators/struct.RawAlloc.html) is the heap itself;
//! [`GenericAllocator`](allocators/struct.GenericAllocator.html) puts it
//! behind a spin lock so it can serve as the `#[global_allocator]`.
//!
//! ```
//! use linked_heap::{RawAlloc, ToyHeap};
//!
//! let mut buffer = vec![0u8; 4096];
//! let mut heap = RawAlloc::new(ToyHeap::new(&mut buffer));
//!
//! let p = heap.allocate(100).unwrap();
//! let q = heap.zero_allocate(4, 16).unwrap();
//! unsafe { heap.release(p.as_ptr()) };
//!
//! let report = heap.snapshot().unwrap();
//! assert_eq!(report.live_count(), 1);
//! assert_eq!(report.pointers(), &[q]);
//! ```

// Heaps serving as the global allocator stay quiet: a logger that allocates
// would re-enter the lock they are called under.
macro_rules! heap_log {
    ($quiet:expr, $level:ident, $($arg:tt)+) => {
        if !$quiet {
            log::$level!($($arg)+);
        }
    };
}

pub mod allocators;
pub mod block;
pub mod blocklist;
pub mod config;
pub mod error;
pub mod grower;
pub mod report;

#[cfg(feature = "use_libc")]
pub use crate::allocators::UnixAllocator;
pub use crate::allocators::{GenericAllocator, RawAlloc, Stats};
pub use crate::block::{ALIGNMENT, HEADER_SIZE, MAX_BLOCK_SIZE};
pub use crate::blocklist::Validity;
pub use crate::config::HeapConfig;
pub use crate::error::AllocError;
#[cfg(feature = "use_libc")]
pub use crate::grower::SbrkHeapGrower;
pub use crate::grower::{HeapGrower, ToyHeap};
pub use crate::report::HeapReport;
