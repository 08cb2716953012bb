use core::fmt;
use core::ptr::NonNull;

use crate::block::{Block, BlockState, ALIGNMENT, HEADER_SIZE};

/// Walks a chain through `prev` links.
///
/// For the free chain that means descending addresses starting at the
/// sentinel; for the allocation chain, newest allocation first.
pub struct ChainIter {
    next: Option<Block>,
}

impl ChainIter {
    pub fn starting_at(first: Option<Block>) -> Self {
        ChainIter { next: first }
    }
}

impl Iterator for ChainIter {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;

        self.next = block.prev();

        Some(block)
    }
}

/// Validity contains a representation of all invalid states found in the two
/// chains.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Number of free blocks whose span runs into the block above them.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of free blocks that do not have an address less than the block
    /// before them in the chain.
    pub out_of_orders: usize,
    /// Number of links whose target does not link back.
    pub broken_links: usize,
    /// Number of blocks whose state tag disagrees with the chain holding them.
    pub mistagged: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.out_of_orders == 0
            && self.broken_links == 0
            && self.mistagged == 0
    }

    pub(crate) fn combine(self, other: Validity) -> Validity {
        Validity {
            overlaps: self.overlaps + other.overlaps,
            out_of_orders: self.out_of_orders + other.out_of_orders,
            broken_links: self.broken_links + other.broken_links,
            mistagged: self.mistagged + other.mistagged,
        }
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeStats {
    /// Free blocks, not counting the sentinel.
    pub length: usize,
    /// Header plus payload over every entry, sentinel included.
    pub size: usize,
    pub largest: usize,
    /// Pairs of free blocks that touch and could be merged by a defragment.
    pub adjacents: usize,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub length: usize,
    /// Payload bytes over every live allocation.
    pub size: usize,
}

/// The chain of free blocks, anchored at the sentinel.
///
/// The sentinel is the zero-size header sitting at the very top of the grown
/// region. From it, `prev` links run strictly downward in address through
/// every free block; `next` links run back up. The sentinel is never handed
/// out, and is never merged.
///
/// A `FreeList` is a view: it holds nothing but the sentinel, and is rebuilt
/// from the region's top whenever the allocator needs one.
pub struct FreeList {
    sentinel: Block,
}

impl FreeList {
    /// # Safety
    ///
    /// `sentinel` must be the current sentinel of an initialized heap, whose
    /// chain satisfies the invariants above.
    pub unsafe fn from_sentinel(sentinel: Block) -> Self {
        FreeList { sentinel }
    }

    pub fn sentinel(&self) -> Block {
        self.sentinel
    }

    /// Every entry, sentinel first, in descending address order.
    pub fn iter(&self) -> ChainIter {
        ChainIter::starting_at(Some(self.sentinel))
    }

    /// The free blocks below the sentinel, in descending address order.
    pub fn blocks(&self) -> ChainIter {
        ChainIter::starting_at(self.sentinel.prev())
    }

    /// The first block, scanning down from the sentinel, with room for `size`
    /// payload bytes.
    pub fn first_fit(&self, size: usize) -> Option<Block> {
        self.iter().find(|block| block.size() >= size)
    }

    /// Whether `take(block, size)` leaves a free remainder behind.
    pub fn would_split(block: Block, size: usize) -> bool {
        block.size() >= size + HEADER_SIZE + ALIGNMENT
    }

    /// Claim `size` bytes of `block` for an allocation.
    ///
    /// If enough is left over for a header and at least `ALIGNMENT` bytes, the
    /// remainder is written as a new free block just past the claimed bytes
    /// and takes `block`'s place in the chain. Otherwise all of `block` is
    /// claimed. The returned block is unlinked and tagged `Allocated`.
    ///
    /// # Safety
    ///
    /// `block` must be in this chain, must not be the sentinel, and must hold
    /// at least `size` bytes. `size` must be a multiple of `ALIGNMENT`.
    pub(crate) unsafe fn take(&mut self, block: Block, size: usize) -> Block {
        debug_assert!(block != self.sentinel);
        debug_assert!(block.size() >= size);

        if FreeList::would_split(block, size) {
            let rest_ptr = NonNull::new_unchecked(block.payload().as_ptr().add(size));
            let rest_size = block.size() - size - HEADER_SIZE;
            let rest = Block::write(rest_ptr, rest_size, BlockState::Free);
            self.replace(block, rest);
            block.set_size(size);
        } else {
            self.unlink(block);
        }

        block.set_state(BlockState::Allocated);
        block
    }

    /// Undo a `take` that split `block`: the remainder is absorbed back and
    /// `block` takes its place in the chain, as it was before the take.
    ///
    /// # Safety
    ///
    /// `block` must have been split by `take`, must be in neither chain, and
    /// the remainder must be in this chain, as `take` left it.
    pub(crate) unsafe fn rejoin(&mut self, block: Block) {
        let rest_ptr = NonNull::new_unchecked(block.payload().as_ptr().add(block.size()));
        let rest = Block::from_header(rest_ptr);
        debug_assert_eq!(rest.state(), BlockState::Free);
        self.replace(rest, block);
        block.set_size(block.size() + rest.span());
        block.set_state(BlockState::Free);
    }

    /// Put `new` where `old` is in the chain, with the same neighbours.
    ///
    /// # Safety
    ///
    /// `old` must be in this chain; `new` must be in neither chain.
    pub(crate) unsafe fn replace(&mut self, old: Block, new: Block) {
        let (prev, next) = (old.prev(), old.next());
        new.set_prev(prev);
        new.set_next(next);
        if let Some(lower) = prev {
            lower.set_next(Some(new));
        }
        if let Some(upper) = next {
            upper.set_prev(Some(new));
        }
        old.set_prev(None);
        old.set_next(None);
    }

    /// Cut `block` out of the chain, joining its neighbours to each other.
    ///
    /// # Safety
    ///
    /// `block` must be in this chain and must not be the sentinel.
    pub(crate) unsafe fn unlink(&mut self, block: Block) {
        let (prev, next) = (block.prev(), block.next());
        if let Some(lower) = prev {
            lower.set_next(next);
        }
        if let Some(upper) = next {
            upper.set_prev(prev);
        }
        block.set_prev(None);
        block.set_next(None);
    }

    /// Add `block` to the chain at its address-ordered position.
    ///
    /// # Safety
    ///
    /// `block` must lie inside this heap, below the sentinel, and must be in
    /// neither chain.
    pub(crate) unsafe fn insert(&mut self, block: Block) {
        let mut upper = self.sentinel;
        while let Some(lower) = upper.prev() {
            if lower.addr() < block.addr() {
                break;
            }
            upper = lower;
        }

        let lower = upper.prev();
        block.set_state(BlockState::Free);
        block.set_next(Some(upper));
        block.set_prev(lower);
        upper.set_prev(Some(block));
        if let Some(lower) = lower {
            lower.set_next(Some(block));
        }
    }

    /// `lower` swallows `upper`, its header and payload, and takes over its
    /// link upward.
    fn absorb(lower: Block, upper: Block) {
        lower.set_size(lower.size() + upper.span());
        let above = upper.next();
        lower.set_next(above);
        if let Some(above) = above {
            above.set_prev(Some(lower));
        }
    }

    /// Merge every run of address-adjacent free blocks into one block.
    ///
    /// Returns the number of merges performed.
    pub fn coalesce(&mut self) -> usize {
        let mut merges = 0;
        let mut upper = match self.sentinel.prev() {
            None => return 0,
            Some(block) => block,
        };

        while let Some(lower) = upper.prev() {
            if lower.is_adjacent_below(upper) {
                FreeList::absorb(lower, upper);
                merges += 1;
            }
            // Either way, lower is the next block to compare against; after a
            // merge it is the enlarged block.
            upper = lower;
        }

        merges
    }

    /// Merge a just-inserted `block` with whichever free neighbours touch it.
    ///
    /// Returns the number of merges performed (0, 1 or 2).
    ///
    /// # Safety
    ///
    /// `block` must be in this chain.
    pub(crate) unsafe fn merge_around(&mut self, block: Block) -> usize {
        let mut merges = 0;
        if let Some(upper) = block.next() {
            if upper != self.sentinel && block.is_adjacent_below(upper) {
                FreeList::absorb(block, upper);
                merges += 1;
            }
        }
        if let Some(lower) = block.prev() {
            if lower.is_adjacent_below(block) {
                FreeList::absorb(lower, block);
                merges += 1;
            }
        }
        merges
    }

    /// Check ordering, links and tags, and total up the chain.
    pub fn stats(&self) -> (Validity, FreeStats) {
        let mut validity: Validity = Default::default();
        let mut stats: FreeStats = Default::default();

        if self.sentinel.next().is_some() {
            validity.broken_links += 1;
        }
        if self.sentinel.size() != 0 {
            validity.mistagged += 1;
        }

        let mut upper: Option<Block> = None;
        for block in self.iter() {
            if block.state() != BlockState::Free {
                validity.mistagged += 1;
            }

            if let Some(upper) = upper {
                if block.next() != Some(upper) {
                    validity.broken_links += 1;
                }

                if block.addr() >= upper.addr() {
                    // Wrong order.
                    validity.out_of_orders += 1;
                } else if block.end() > upper.addr() {
                    // This is really bad.
                    validity.overlaps += 1;
                } else if block.is_adjacent_below(upper) && upper != self.sentinel {
                    // Valid, but a defragment would merge these.
                    stats.adjacents += 1;
                }
            }

            if block != self.sentinel {
                stats.length += 1;
            }
            stats.size += block.span();
            stats.largest = stats.largest.max(block.size());
            upper = Some(block);
        }

        (validity, stats)
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList(")?;
        let mut start = true;
        for block in self.iter() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

/// The chain of live allocations, in the order they were made.
///
/// Only the tail is stored; `prev` links run back to older allocations, and
/// `next` links forward to newer ones. Removal only touches the removed
/// block's neighbours, so it costs O(1).
#[derive(Default)]
pub struct AllocList {
    tail: Option<Block>,
    len: usize,
}

impl AllocList {
    /// The most recent allocation still live.
    pub fn tail(&self) -> Option<Block> {
        self.tail
    }

    /// Newest first.
    pub fn iter(&self) -> ChainIter {
        ChainIter::starting_at(self.tail)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    /// Append `block` at the tail.
    ///
    /// # Safety
    ///
    /// `block` must be in neither chain.
    pub(crate) unsafe fn push(&mut self, block: Block) {
        block.set_state(BlockState::Allocated);
        block.set_prev(self.tail);
        block.set_next(None);
        if let Some(tail) = self.tail {
            tail.set_next(Some(block));
        }
        self.tail = Some(block);
        self.len += 1;
    }

    /// Remove `block` from the chain.
    ///
    /// # Safety
    ///
    /// `block` must be in this chain.
    pub(crate) unsafe fn remove(&mut self, block: Block) {
        let (prev, next) = (block.prev(), block.next());
        if let Some(older) = prev {
            older.set_next(next);
        }
        if let Some(newer) = next {
            newer.set_prev(prev);
        }
        if self.tail == Some(block) {
            self.tail = prev;
        }
        block.set_prev(None);
        block.set_next(None);
        self.len -= 1;
    }

    pub fn stats(&self) -> (Validity, AllocStats) {
        let mut validity: Validity = Default::default();
        let mut stats: AllocStats = Default::default();

        if let Some(tail) = self.tail {
            if tail.next().is_some() {
                validity.broken_links += 1;
            }
        }

        let mut newer: Option<Block> = None;
        for block in self.iter() {
            if block.state() != BlockState::Allocated {
                validity.mistagged += 1;
            }
            if let Some(newer) = newer {
                if block.next() != Some(newer) {
                    validity.broken_links += 1;
                }
            }
            stats.length += 1;
            stats.size += block.size();
            newer = Some(block);
        }

        if stats.length != self.len {
            validity.broken_links += 1;
        }

        (validity, stats)
    }
}

impl fmt::Display for AllocList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocList(")?;
        let mut start = true;
        for block in self.iter() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    const ARENA: usize = 1024;

    #[repr(C, align(8))]
    struct Arena([u8; ARENA]);

    impl Arena {
        fn new() -> Self {
            Arena([0; ARENA])
        }

        // Write a header `offset` bytes in.
        fn block(&mut self, offset: usize, size: usize, state: BlockState) -> Block {
            assert!(offset + HEADER_SIZE + size <= ARENA);
            unsafe {
                let ptr = NonNull::new(self.0.as_mut_ptr().add(offset)).unwrap();
                Block::write(ptr, size, state)
            }
        }

        // A free list whose sentinel is the last header in the arena.
        fn free_list(&mut self) -> FreeList {
            let sentinel = self.block(ARENA - HEADER_SIZE, 0, BlockState::Free);
            unsafe { FreeList::from_sentinel(sentinel) }
        }
    }

    fn addrs(iter: ChainIter) -> Vec<usize> {
        iter.map(|b| b.addr()).collect()
    }

    #[test]
    fn test_insert_keeps_descending_order() {
        let mut arena = Arena::new();
        let mut free = arena.free_list();
        let a = arena.block(0, 32, BlockState::Allocated);
        let b = arena.block(128, 32, BlockState::Allocated);
        let c = arena.block(256, 32, BlockState::Allocated);

        unsafe {
            free.insert(b);
            free.insert(a);
            free.insert(c);
        }

        assert_eq!(addrs(free.blocks()), vec![c.addr(), b.addr(), a.addr()]);
        assert!(free.blocks().all(|b| b.state() == BlockState::Free));
        let (validity, stats) = free.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.length, 3);
        assert_eq!(stats.adjacents, 0);
        log::info!("{}", free);
    }

    #[test]
    fn test_take_splits_large_blocks() {
        let mut arena = Arena::new();
        let mut free = arena.free_list();
        let big = arena.block(0, 256, BlockState::Free);
        unsafe { free.insert(big) };

        let claimed = unsafe { free.take(big, 64) };
        assert_eq!(claimed, big);
        assert_eq!(claimed.size(), 64);
        assert_eq!(claimed.state(), BlockState::Allocated);

        let rest: Vec<Block> = free.blocks().collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].addr(), claimed.end());
        assert_eq!(rest[0].size(), 256 - 64 - HEADER_SIZE);
        assert_eq!(rest[0].next(), Some(free.sentinel()));
        assert!(free.stats().0.is_valid());
    }

    #[test]
    fn test_rejoin_undoes_a_split() {
        let mut arena = Arena::new();
        let mut free = arena.free_list();
        let low = arena.block(0, 32, BlockState::Free);
        let big = arena.block(256, 256, BlockState::Free);
        unsafe {
            free.insert(low);
            free.insert(big);
        }
        let before = addrs(free.iter());

        let claimed = unsafe { free.take(big, 64) };
        assert_eq!(claimed.size(), 64);
        assert_ne!(addrs(free.iter()), before);

        unsafe { free.rejoin(claimed) };
        assert_eq!(addrs(free.iter()), before);
        assert_eq!(big.size(), 256);
        assert_eq!(big.state(), BlockState::Free);
        assert_eq!(big.prev(), Some(low));
        assert_eq!(low.next(), Some(big));
        let (validity, stats) = free.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.length, 2);
    }

    #[test]
    fn test_take_consumes_small_remainders() {
        let mut arena = Arena::new();
        let mut free = arena.free_list();
        // Just short of a header plus an alignment unit left over
        let size = 64 + HEADER_SIZE;
        let low = arena.block(0, 16, BlockState::Free);
        let snug = arena.block(128, size, BlockState::Free);
        unsafe {
            free.insert(low);
            free.insert(snug);
        }

        let claimed = unsafe { free.take(snug, 64) };
        assert_eq!(claimed.size(), size);
        assert_eq!(addrs(free.blocks()), vec![low.addr()]);
        assert_eq!(low.next(), Some(free.sentinel()));
        assert!(free.stats().0.is_valid());
    }

    #[test]
    fn test_coalesce_collapses_runs() {
        let mut arena = Arena::new();
        let mut free = arena.free_list();
        let span = HEADER_SIZE + 32;
        let a = arena.block(0, 32, BlockState::Allocated);
        let b = arena.block(span, 32, BlockState::Allocated);
        let c = arena.block(2 * span, 32, BlockState::Allocated);
        // A gap, then a lone block
        let d = arena.block(4 * span, 32, BlockState::Allocated);
        unsafe {
            for &block in &[a, b, c, d] {
                free.insert(block);
            }
        }
        assert_eq!(free.stats().1.adjacents, 2);

        assert_eq!(free.coalesce(), 2);

        assert_eq!(addrs(free.blocks()), vec![d.addr(), a.addr()]);
        assert_eq!(a.size(), 3 * 32 + 2 * HEADER_SIZE);
        assert_eq!(a.next(), Some(d));
        let (validity, stats) = free.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.adjacents, 0);

        // Nothing left to do
        assert_eq!(free.coalesce(), 0);
    }

    #[test]
    fn test_coalesce_leaves_sentinel_alone() {
        let mut arena = Arena::new();
        let mut free = arena.free_list();
        let size = ARENA - 2 * HEADER_SIZE;
        let top = arena.block(0, size, BlockState::Allocated);
        unsafe { free.insert(top) };
        assert!(top.is_adjacent_below(free.sentinel()));

        assert_eq!(free.coalesce(), 0);
        assert_eq!(addrs(free.blocks()), vec![top.addr()]);
        assert_eq!(free.sentinel().size(), 0);
    }

    #[test]
    fn test_merge_around() {
        let mut arena = Arena::new();
        let mut free = arena.free_list();
        let span = HEADER_SIZE + 16;
        let a = arena.block(0, 16, BlockState::Allocated);
        let b = arena.block(span, 16, BlockState::Allocated);
        let c = arena.block(2 * span, 16, BlockState::Allocated);
        unsafe {
            free.insert(a);
            free.insert(c);
            free.insert(b);
            assert_eq!(free.merge_around(b), 2);
        }
        assert_eq!(addrs(free.blocks()), vec![a.addr()]);
        assert_eq!(a.size(), 3 * 16 + 2 * HEADER_SIZE);
        assert!(free.stats().0.is_valid());
    }

    #[test]
    fn test_alloc_list_removal() {
        let mut arena = Arena::new();
        let mut allocs = AllocList::default();
        let a = arena.block(0, 8, BlockState::Free);
        let b = arena.block(64, 8, BlockState::Free);
        let c = arena.block(128, 8, BlockState::Free);

        unsafe {
            allocs.push(a);
            allocs.push(b);
            allocs.push(c);
        }
        assert_eq!(allocs.len(), 3);
        assert_eq!(addrs(allocs.iter()), vec![c.addr(), b.addr(), a.addr()]);

        // Middle
        unsafe { allocs.remove(b) };
        assert_eq!(addrs(allocs.iter()), vec![c.addr(), a.addr()]);
        assert_eq!(a.next(), Some(c));
        assert_eq!(c.prev(), Some(a));

        // Tail: the anchor retreats
        unsafe { allocs.remove(c) };
        assert_eq!(allocs.tail(), Some(a));
        assert_eq!(a.next(), None);

        unsafe { allocs.remove(a) };
        assert!(allocs.is_empty());
        assert_eq!(allocs.len(), 0);

        let (validity, stats) = allocs.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.length, 0);
        log::info!("{}", allocs);
    }

    #[test]
    fn test_stats_spot_disorder() {
        let mut arena = Arena::new();
        let free = arena.free_list();
        let a = arena.block(0, 16, BlockState::Free);
        let b = arena.block(256, 16, BlockState::Allocated);
        // Link them the wrong way round by hand.
        let sentinel = free.sentinel();
        sentinel.set_prev(Some(a));
        a.set_next(Some(sentinel));
        a.set_prev(Some(b));
        b.set_next(Some(a));

        let (validity, _) = free.stats();
        assert_eq!(validity.out_of_orders, 1);
        assert_eq!(validity.mistagged, 1);
        assert!(!validity.is_valid());
    }
}
