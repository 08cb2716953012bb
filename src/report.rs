//! Heap snapshots.
//!
//! A [`HeapReport`](struct.HeapReport.html) describes free space and every
//! live allocation, largest first. Its lists live in buffers allocated from
//! the heap being described, and go back to it when the report is dropped.

use core::fmt;
use core::mem;
use core::ptr::NonNull;
use core::slice;

use crate::allocators::{Claim, RawAlloc};
use crate::block::Block;
use crate::blocklist::ChainIter;
use crate::error::AllocError;
use crate::grower::HeapGrower;

// One live allocation, as gathered for sorting.
#[derive(Clone, Copy)]
struct LiveEntry {
    size: usize,
    ptr: NonNull<u8>,
}

/// A snapshot of heap occupancy.
///
/// All figures describe the heap as it was when
/// [`RawAlloc::snapshot`](../allocators/struct.RawAlloc.html#method.snapshot)
/// was called, before the report's own buffers were allocated.
///
/// The report borrows its heap until dropped, at which point its buffers are
/// released.
pub struct HeapReport<'heap, G: HeapGrower> {
    heap: &'heap mut RawAlloc<G>,
    free_bytes: usize,
    largest_free_chunk: usize,
    live_count: usize,
    // Present whenever live_count > 0; each holds live_count elements
    sizes: Option<NonNull<usize>>,
    pointers: Option<NonNull<NonNull<u8>>>,
}

impl<G: HeapGrower> HeapReport<'_, G> {
    /// Header plus payload bytes over every free block, the sentinel
    /// included.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Payload size of the largest free block.
    pub fn largest_free_chunk(&self) -> usize {
        self.largest_free_chunk
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Sizes of the live allocations, largest first.
    pub fn sizes(&self) -> &[usize] {
        match self.sizes {
            None => &[],
            Some(sizes) => unsafe { slice::from_raw_parts(sizes.as_ptr(), self.live_count) },
        }
    }

    /// Pointers to the live allocations, in the same order as `sizes`.
    pub fn pointers(&self) -> &[NonNull<u8>] {
        match self.pointers {
            None => &[],
            Some(pointers) => unsafe { slice::from_raw_parts(pointers.as_ptr(), self.live_count) },
        }
    }

    /// `(pointer, size)` for each live allocation, largest first.
    pub fn entries(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        self.pointers().iter().copied().zip(self.sizes().iter().copied())
    }
}

impl<G: HeapGrower> Drop for HeapReport<'_, G> {
    fn drop(&mut self) {
        // Both buffers came from this heap and nothing else has seen them.
        unsafe {
            if let Some(sizes) = self.sizes.take() {
                self.heap.release(sizes.as_ptr() as *mut u8);
            }
            if let Some(pointers) = self.pointers.take() {
                self.heap.release(pointers.as_ptr() as *mut u8);
            }
        }
    }
}

impl<G: HeapGrower> fmt::Display for HeapReport<'_, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "free: {} bytes, largest free chunk: {} bytes, live allocations: {}",
            self.free_bytes, self.largest_free_chunk, self.live_count
        )?;
        for (i, (ptr, size)) in self.entries().enumerate() {
            writeln!(f, "  {:>4}: {:>10} bytes at {:?}", i, size, ptr)?;
        }
        Ok(())
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Take a snapshot of free space and live allocations.
    ///
    /// Three buffers are allocated from this heap to build the report: one for
    /// sorting, given back before returning, and the two lists the report
    /// holds. If any of them cannot be allocated, those already obtained are
    /// given back and the error is returned, leaving both chains exactly as
    /// they were. The one lasting trace a failure can leave is growth: a
    /// region that grew for an earlier buffer keeps the new space as a free
    /// block below the sentinel.
    pub fn snapshot(&mut self) -> Result<HeapReport<'_, G>, AllocError> {
        let (free_bytes, largest_free_chunk) = match self.free_list() {
            None => (0, 0),
            Some(free) => free
                .iter()
                .fold((0, 0), |(bytes, largest), block| (bytes + block.span(), largest.max(block.size()))),
        };

        // Captured before our own buffers join the chain
        let live_count = self.allocs.len();
        let newest = self.allocs.tail();

        if live_count == 0 {
            return Ok(HeapReport {
                heap: self,
                free_bytes,
                largest_free_chunk,
                live_count,
                sizes: None,
                pointers: None,
            });
        }

        let requests = [
            live_count * mem::size_of::<usize>(),
            live_count * mem::size_of::<NonNull<u8>>(),
            live_count * mem::size_of::<LiveEntry>(),
        ];
        let mut claims: [Option<(Block, Claim)>; 3] = [None; 3];
        let mut failure = None;
        for (&request, claimed) in requests.iter().zip(claims.iter_mut()) {
            match self.claim(request) {
                Ok(found) => *claimed = Some(found),
                Err(err) => {
                    heap_log!(self.quiet, debug, "Snapshot buffer of {} bytes failed: {}", request, err);
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            // Newest first, so each split is rejoined onto the block it came from
            for &(block, claim) in claims.iter().rev().flatten() {
                unsafe { self.unclaim(block, claim) };
            }
            return Err(err);
        }

        let (sizes, pointers, (scratch_block, scratch_claim)) = match claims {
            [Some((sizes, _)), Some((pointers, _)), Some(scratch)] => (
                sizes.payload().cast::<usize>(),
                pointers.payload().cast::<NonNull<u8>>(),
                scratch,
            ),
            _ => unreachable!("every buffer was claimed above"),
        };
        let scratch = scratch_block.payload().cast::<LiveEntry>();

        unsafe {
            let mut filled = 0;
            for (i, block) in ChainIter::starting_at(newest).take(live_count).enumerate() {
                scratch.as_ptr().add(i).write(LiveEntry {
                    size: block.size(),
                    ptr: block.payload(),
                });
                filled += 1;
            }
            debug_assert_eq!(filled, live_count);

            let entries = slice::from_raw_parts_mut(scratch.as_ptr(), filled);
            entries.sort_unstable_by(|a, b| b.size.cmp(&a.size));

            for (i, entry) in entries.iter().enumerate() {
                sizes.as_ptr().add(i).write(entry.size);
                pointers.as_ptr().add(i).write(entry.ptr);
            }

            self.unclaim(scratch_block, scratch_claim);
        }

        Ok(HeapReport {
            heap: self,
            free_bytes,
            largest_free_chunk,
            live_count,
            sizes: Some(sizes),
            pointers: Some(pointers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    use crate::block::{ALIGNMENT, HEADER_SIZE};
    use crate::grower::ToyHeap;

    #[test]
    fn test_empty_heap() {
        let mut buffer = vec![0u8; 256];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer));

        let report = allocator.snapshot().unwrap();
        assert_eq!(report.free_bytes(), 0);
        assert_eq!(report.largest_free_chunk(), 0);
        assert_eq!(report.live_count(), 0);
        assert!(report.sizes().is_empty());
        assert!(report.pointers().is_empty());
    }

    #[test]
    fn test_sorted_descending() {
        let mut buffer = vec![0u8; 8192];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer));

        let sizes = [24, 400, 8, 96, 400, 160];
        let pointers: Vec<NonNull<u8>> = sizes.iter().map(|&s| allocator.allocate(s).unwrap()).collect();
        unsafe { allocator.release(pointers[3].as_ptr()) };
        let heap_size = allocator.heap_size();

        let report = allocator.snapshot().unwrap();
        log::info!("{}", report);
        assert_eq!(report.live_count(), 5);
        assert_eq!(report.sizes(), &[400, 400, 160, 24, 8]);
        for (ptr, size) in report.entries() {
            let i = pointers.iter().position(|&p| p == ptr).unwrap();
            assert_eq!(sizes[i], size);
        }
        assert_eq!(report.largest_free_chunk(), 96);

        let live: usize = report.sizes().iter().sum();
        assert_eq!(
            report.free_bytes() + live + report.live_count() * HEADER_SIZE,
            heap_size
        );
    }

    #[test]
    fn test_buffers_return_to_the_heap() {
        let mut buffer = vec![0u8; 8192];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer));
        for size in 1..=4 {
            allocator.allocate(size * 16).unwrap();
        }

        {
            let report = allocator.snapshot().unwrap();
            assert_eq!(report.live_count(), 4);
        }

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert!(stats.is_balanced());
        assert_eq!(stats.live_count, 4);
        assert_eq!(allocator.allocations().count(), 4);
    }

    #[test]
    fn test_partial_failure_releases_everything() {
        // Laid out to fill the toy heap exactly: the sentinel, a 16 byte block
        // and a 512 byte block.
        let capacity = HEADER_SIZE + (HEADER_SIZE + 16) + (HEADER_SIZE + 512);
        let mut buffer = vec![0u8; capacity + ALIGNMENT - 1];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer));

        let small = allocator.allocate(16).unwrap();
        let big = allocator.allocate(512).unwrap();
        unsafe { allocator.release(small.as_ptr()) };

        let free_before: Vec<(usize, usize)> = allocator.free_blocks().map(|b| (b.addr(), b.size())).collect();
        let (_, stats_before) = allocator.stats();

        // The first buffer fits in the freed 16 bytes; the second cannot be
        // found anywhere.
        let err = allocator.snapshot().err().unwrap();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));

        let free_after: Vec<(usize, usize)> = allocator.free_blocks().map(|b| (b.addr(), b.size())).collect();
        let (validity, stats_after) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(free_after, free_before);
        assert_eq!(stats_after, stats_before);
        assert_eq!(allocator.allocations().collect::<Vec<_>>(), vec![(big, 512)]);
    }

    fn free_layout<G: HeapGrower>(allocator: &RawAlloc<G>) -> Vec<(usize, usize)> {
        allocator.free_blocks().map(|b| (b.addr(), b.size())).collect()
    }

    #[test]
    fn test_partial_failure_rejoins_split_blocks() {
        // One 56 byte free block below two live 8 byte blocks, with no room
        // left to grow
        let capacity = HEADER_SIZE + (HEADER_SIZE + 56) + 2 * (HEADER_SIZE + 8);
        let mut buffer = vec![0u8; capacity + ALIGNMENT - 1];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer));

        let hole = allocator.allocate(56).unwrap();
        let a = allocator.allocate(8).unwrap();
        let b = allocator.allocate(8).unwrap();
        unsafe { allocator.release(hole.as_ptr()) };

        let free_before = free_layout(&allocator);
        assert_eq!(free_before.len(), 1);
        assert_eq!(free_before[0].1, 56);
        let (_, stats_before) = allocator.stats();

        // The first buffer is split off the hole; a later one finds nothing
        let err = allocator.snapshot().err().unwrap();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));

        let (validity, stats_after) = allocator.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(free_layout(&allocator), free_before);
        assert_eq!(stats_after, stats_before);
        assert_eq!(allocator.allocations().collect::<Vec<_>>(), vec![(b, 8), (a, 8)]);
    }

    #[test]
    fn test_partial_failure_keeps_only_growth() {
        // Room for one more 8 byte block and nothing else
        let capacity = HEADER_SIZE + 2 * (HEADER_SIZE + 8);
        let mut buffer = vec![0u8; capacity + ALIGNMENT - 1];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer));

        let p = allocator.allocate(8).unwrap();
        let heap_size = allocator.heap_size();
        assert!(free_layout(&allocator).is_empty());

        let err = allocator.snapshot().err().unwrap();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));

        // The region grew for the first buffer, and that space is now free
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert!(stats.is_balanced());
        assert_eq!(allocator.heap_size(), heap_size + HEADER_SIZE + 8);
        let free: Vec<Block> = allocator.free_blocks().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size(), 8);
        assert_eq!(free[0].next(), allocator.free_list().map(|f| f.sentinel()));
        assert_eq!(allocator.allocations().collect::<Vec<_>>(), vec![(p, 8)]);
    }

    #[test]
    fn test_success_leaves_only_the_report_buffers() {
        let mut buffer = vec![0u8; 8192];
        let mut allocator = RawAlloc::new(ToyHeap::new(&mut buffer));

        let hole = allocator.allocate(512).unwrap();
        let _live = allocator.allocate(64).unwrap();
        unsafe { allocator.release(hole.as_ptr()) };
        let free_before = free_layout(&allocator);

        {
            let report = allocator.snapshot().unwrap();
            assert_eq!(report.sizes(), &[64]);
            assert_eq!(report.largest_free_chunk(), 512);
        }

        // The scratch buffer was rejoined; the two report buffers were
        // released as ordinary blocks
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.live_count, 1);
        assert_eq!(allocator.defragment(), 2);
        assert_eq!(free_layout(&allocator), free_before);
    }
}
