//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe heap: it grows a region
//! through a [`HeapGrower`](../grower/trait.HeapGrower.html), hands out blocks
//! from it first-fit, and tracks free and live blocks in two chains. Every
//! operation assumes exclusive access for its duration.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, allowing it to be used as the global allocator.
//!
//! ### [`UnixAllocator`](type.UnixAllocator.html)
//!
//! A `GenericAllocator` growing the program break with `sbrk`. Requires the
//! `use_libc` feature.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut, NonNull};

use spin::Mutex;

use crate::block::{round_up, Block, BlockState, ALIGNMENT, HEADER_SIZE, MAX_BLOCK_SIZE};
use crate::blocklist::{AllocList, ChainIter, FreeList, Validity};
use crate::config::HeapConfig;
use crate::error::AllocError;
#[cfg(feature = "use_libc")]
use crate::grower::SbrkHeapGrower;
use crate::grower::HeapGrower;

/// Combined figures for both chains and the region.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Free blocks, not counting the sentinel.
    pub free_blocks: usize,
    /// Header plus payload over the free chain, sentinel included.
    pub free_bytes: usize,
    pub largest_free: usize,
    /// Pairs of free blocks a defragment would merge.
    pub adjacent_free: usize,
    pub live_count: usize,
    /// Payload bytes over every live allocation.
    pub live_bytes: usize,
    /// Bytes granted by the grower.
    pub heap_size: usize,
}

impl Stats {
    /// Every byte granted is in exactly one block: free, live or the
    /// sentinel.
    pub fn is_balanced(&self) -> bool {
        self.free_bytes + self.live_bytes + self.live_count * HEADER_SIZE == self.heap_size
    }
}

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Note: It never returns memory to the grower; that is not implemented.
///
/// The heap is laid out as a run of blocks, each a header and its payload,
/// topped by the sentinel:
///
/// ```text
///   base                                                  top
///   |                                                       |
///   v                                                       v
///   +-----+---------+-----+------+-----+-------+-----------+
///   | hdr | payload | hdr | free | hdr | payload | sentinel |
///   +-----+---------+-----+------+-----+-------+-----------+
/// ```
///
/// The sentinel is always the last `HEADER_SIZE` bytes of the region, so it is
/// found from the grower's top rather than stored.
pub struct RawAlloc<G> {
    grower: G,
    config: HeapConfig,
    initialized: bool,
    base: usize,
    // Set when behind a GenericAllocator; suppresses all logging
    pub(crate) quiet: bool,
    pub(crate) allocs: AllocList,
}

/// How a block was found for an allocation, and so how to give it back
/// exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// A free block, taken whole.
    Whole,
    /// The low end of a free block, leaving the rest free.
    Split,
    /// The old sentinel, after growing the region.
    Grown,
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc`
    pub fn new(grower: G) -> Self {
        RawAlloc::with_config(grower, HeapConfig::default())
    }

    pub fn with_config(grower: G, config: HeapConfig) -> Self {
        RawAlloc {
            grower,
            config,
            initialized: false,
            base: 0,
            quiet: false,
            allocs: AllocList::default(),
        }
    }

    pub fn grower(&self) -> &G {
        &self.grower
    }

    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// Bytes obtained from the grower so far.
    pub fn heap_size(&self) -> usize {
        if !self.initialized {
            return 0;
        }
        self.grower.top() as usize - self.base
    }

    /// The free chain, or `None` before the first allocation.
    pub(crate) fn free_list(&self) -> Option<FreeList> {
        if !self.initialized {
            return None;
        }
        unsafe {
            let top = self.grower.top();
            let sentinel = Block::from_header(NonNull::new_unchecked(top.sub(HEADER_SIZE)));
            Some(FreeList::from_sentinel(sentinel))
        }
    }

    /// Write the first sentinel, if that has not happened yet.
    ///
    /// A failure here is reported to the current caller only; the next call
    /// tries again.
    fn initialize(&mut self) -> Result<FreeList, AllocError> {
        if !self.initialized {
            let quiet = self.quiet;
            let base = self.grower.grow_heap(HEADER_SIZE).map_err(|err| {
                heap_log!(quiet, debug, "Initializing the heap failed: {:?}", err);
                AllocError::OutOfMemory {
                    requested: HEADER_SIZE,
                }
            })?;
            unsafe { Block::write(base, 0, BlockState::Free) };
            self.base = base.as_ptr() as usize;
            self.initialized = true;
            heap_log!(self.quiet, debug, "Heap initialized at {:?}", base);
        }

        // Initialized just above
        self.free_list().ok_or(AllocError::OutOfMemory {
            requested: HEADER_SIZE,
        })
    }

    /// Extend the region by a block of `size` bytes.
    ///
    /// The old sentinel becomes the new block, and a new sentinel is written
    /// at the new top. Nothing is touched if the grower fails.
    fn grow(&mut self, mut free: FreeList, size: usize) -> Result<Block, AllocError> {
        let delta = HEADER_SIZE + size;
        let quiet = self.quiet;
        let old_top = self.grower.grow_heap(delta).map_err(|err| {
            heap_log!(quiet, debug, "Growing the heap by {} bytes failed: {:?}", delta, err);
            AllocError::OutOfMemory { requested: delta }
        })?;

        let block = free.sentinel();
        debug_assert_eq!(old_top.as_ptr() as usize, block.end());
        unsafe {
            let sentinel_ptr = NonNull::new_unchecked(old_top.as_ptr().add(size));
            let sentinel = Block::write(sentinel_ptr, 0, BlockState::Free);
            free.replace(block, sentinel);
        }
        block.set_size(size);
        heap_log!(self.quiet, debug, "Grew the heap by {} bytes for {:?}", delta, block);

        Ok(block)
    }

    ////////////////////////////////////////////////////////////
    // The allocation engine

    /// Allocate `size` bytes, aligned to `ALIGNMENT`.
    ///
    /// The first free block large enough, scanning down from the top of the
    /// heap, is used; if it is much larger than needed it is split, and the
    /// rest stays free. With no block large enough, the heap grows.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.claim(size).map(|(block, _)| block.payload())
    }

    /// The allocation engine behind `allocate`, also reporting how the block
    /// was found.
    pub(crate) fn claim(&mut self, size: usize) -> Result<(Block, Claim), AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if size > MAX_BLOCK_SIZE {
            return Err(AllocError::TooLarge {
                requested: size,
                max: MAX_BLOCK_SIZE,
            });
        }
        let size = round_up(size, ALIGNMENT);

        let mut free = self.initialize()?;
        let (block, claim) = match free.first_fit(size) {
            Some(found) if FreeList::would_split(found, size) => {
                heap_log!(self.quiet, trace, "Splitting {} bytes off {:?}", size, found);
                (unsafe { free.take(found, size) }, Claim::Split)
            }
            Some(found) => {
                heap_log!(self.quiet, trace, "Claiming all of {:?} for {} bytes", found, size);
                (unsafe { free.take(found, size) }, Claim::Whole)
            }
            None => (self.grow(free, size)?, Claim::Grown),
        };

        unsafe { self.allocs.push(block) };
        Ok((block, claim))
    }

    /// Give back a block from `claim`, leaving the chains as they were before
    /// it was made. A grown region cannot shrink, so a `Grown` block is left
    /// free just below the sentinel.
    ///
    /// # Safety
    ///
    /// `block` and `claim` must come from the most recent `claim` on this heap
    /// not yet given back, and the chains must not have changed since.
    pub(crate) unsafe fn unclaim(&mut self, block: Block, claim: Claim) {
        let mut free = match self.free_list() {
            Some(free) => free,
            None => return,
        };
        self.allocs.remove(block);
        match claim {
            Claim::Split => free.rejoin(block),
            Claim::Whole | Claim::Grown => free.insert(block),
        }
        heap_log!(self.quiet, trace, "Gave back {:?} ({:?})", block, claim);
    }

    /// Release (or "free") an allocation.
    ///
    /// The block moves to the free chain at its address-ordered position. It
    /// is only merged with its neighbours when the heap is configured to
    /// coalesce on release.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or a pointer returned by this heap and not
    /// released since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let payload = match NonNull::new(ptr) {
            None => return,
            Some(payload) => payload,
        };
        let mut free = match self.free_list() {
            Some(free) => free,
            None => {
                heap_log!(self.quiet, error, "Ignoring release of {:?}: nothing was ever allocated", ptr);
                return;
            }
        };

        let block = Block::from_payload(payload);
        if self.config.check_release && block.state() != BlockState::Allocated {
            heap_log!(self.quiet, error, "Ignoring release of {:?}: {:?} is not allocated", ptr, block);
            return;
        }

        self.allocs.remove(block);
        free.insert(block);
        heap_log!(self.quiet, trace, "Released {:?} into the free chain", block);
        if self.config.coalesce_on_release {
            let merges = free.merge_around(block);
            heap_log!(self.quiet, trace, "Released {:?} with {} merges", ptr, merges);
        }
    }

    /// Allocate `count * unit_size` bytes, all zero.
    pub fn zero_allocate(&mut self, count: usize, unit_size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = count
            .checked_mul(unit_size)
            .ok_or(AllocError::Overflow { count, unit_size })?;
        let ptr = self.allocate(size)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Move an allocation to a block of `new_size` bytes, keeping the first
    /// `min(old size, new_size)` bytes.
    ///
    /// A null `ptr` allocates. A `new_size` of 0 releases `ptr` and returns
    /// `None`. If the new block cannot be allocated, `ptr` is left live and
    /// untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or a pointer returned by this heap and not
    /// released since.
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let old = match NonNull::new(ptr) {
            None => return self.allocate(new_size).map(Some),
            Some(old) => old,
        };
        if new_size == 0 {
            self.release(ptr);
            return Ok(None);
        }

        let old_size = Block::from_payload(old).size();
        // The old block must stay live until its bytes are copied, or this
        // allocation could hand it straight back.
        let new = self.allocate(new_size)?;
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
        self.release(ptr);

        Ok(Some(new))
    }

    /// Merge every run of address-adjacent free blocks.
    ///
    /// Returns the number of merges.
    pub fn defragment(&mut self) -> usize {
        let mut free = match self.free_list() {
            None => return 0,
            Some(free) => free,
        };

        let merges = free.coalesce();
        heap_log!(self.quiet, debug, "Defragmenting merged {} free blocks", merges);
        merges
    }

    ////////////////////////////////////////////////////////////
    // Inspection

    /// Live allocations as `(pointer, size)`, newest first.
    pub fn allocations(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        self.allocs.iter().map(|block| (block.payload(), block.size()))
    }

    /// Free blocks below the sentinel, highest address first.
    pub fn free_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        let first = self.free_list().and_then(|free| free.sentinel().prev());
        ChainIter::starting_at(first)
    }

    /// Get statistics on this allocator, and verify validity of both chains
    pub fn stats(&self) -> (Validity, Stats) {
        let (alloc_validity, alloc_stats) = self.allocs.stats();
        let mut stats = Stats {
            live_count: alloc_stats.length,
            live_bytes: alloc_stats.size,
            heap_size: self.heap_size(),
            ..Stats::default()
        };

        let validity = match self.free_list() {
            None => alloc_validity,
            Some(free) => {
                let (free_validity, free_stats) = free.stats();
                stats.free_blocks = free_stats.length;
                stats.free_bytes = free_stats.size;
                stats.largest_free = free_stats.largest;
                stats.adjacent_free = free_stats.adjacents;
                alloc_validity.combine(free_validity)
            }
        };

        (validity, stats)
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// The `RawAlloc` is built on first use, from `G::default()`.
pub struct GenericAllocator<G> {
    config: HeapConfig,
    raw: Mutex<Option<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        Self::with_config(HeapConfig::new())
    }

    pub const fn with_config(config: HeapConfig) -> Self {
        GenericAllocator {
            config,
            raw: Mutex::new(None),
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Run `f` with exclusive access to the underlying RawAlloc.
    ///
    /// Allocating through this same `GenericAllocator` inside `f` deadlocks.
    pub fn with_raw<R, F: FnOnce(&mut RawAlloc<G>) -> R>(&self, f: F) -> R {
        let mut guard = self.raw.lock();
        let config = self.config;
        let raw = guard.get_or_insert_with(|| {
            let mut raw = RawAlloc::with_config(G::default(), config);
            raw.quiet = true;
            raw
        });
        f(raw)
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.with_raw(|raw| raw.stats())
    }
}

unsafe impl<G: HeapGrower + Default> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.with_raw(|raw| raw.allocate(layout.size()))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.with_raw(|raw| raw.release(ptr))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.with_raw(|raw| raw.zero_allocate(1, layout.size()))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        match self.with_raw(|raw| raw.reallocate(ptr, new_size)) {
            Ok(Some(new)) => new.as_ptr(),
            _ => null_mut(),
        }
    }
}

/// A global allocator backed by the program break.
#[cfg(feature = "use_libc")]
pub type UnixAllocator = GenericAllocator<SbrkHeapGrower>;
