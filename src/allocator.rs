//! The default best-fit block allocator.
//!
//! Free space is tracked as a set of `Extent`s (contiguous block runs) in
//! two B+ trees: one keyed by starting block (`by_position`, used to find
//! and merge adjacent extents) and one keyed by `(size, position)`
//! (`by_size`, used for best-fit lookups). Both trees allocate their own
//! node blocks through a small grow-only allocator rather than through
//! `DefaultAllocator` itself, breaking the recursion that would otherwise
//! follow from an allocator needing to allocate blocks for its own
//! bookkeeping structures (mirrors the "meta free list" in the original
//! design).

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::address::BlockIndex;
use crate::binary_format;
use crate::btree::{BTree, BTreeAnchor, BTreeSpec, BlockAllocator};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::serialize::{CustomLayout, StaticLayout};

/// The smallest region size (in blocks) the allocator will grow by.
pub const MIN_REGION_BLOCKS: u64 = 16;

/// A contiguous run of free (or, for the allocator's own bookkeeping,
/// meta) blocks. Encoded by hand rather than via [`binary_format!`] since
/// the `is_meta` flag is packed into the high bit of the size field
/// instead of occupying a field of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First block of the run.
    pub start: BlockIndex,
    /// Number of blocks in the run. Limited to 63 bits; see `is_meta`.
    pub block_count: u64,
    /// Whether this run belongs to the allocator's own meta free list
    /// rather than to user-visible free space.
    pub is_meta: bool,
}

const META_FLAG: u64 = 1 << 63;

impl StaticLayout for Extent {
    const SIZE: usize = 8 + 8;

    fn write_layout(&self, buf: &mut [u8]) {
        debug_assert!(self.block_count & META_FLAG == 0, "block count overflow");
        self.start.write_layout(&mut buf[0..8]);
        let packed = self.block_count | if self.is_meta { META_FLAG } else { 0 };
        packed.write_layout(&mut buf[8..16]);
    }

    fn read_layout(buf: &[u8]) -> Self {
        let start = BlockIndex::read_layout(&buf[0..8]);
        let packed = u64::read_layout(&buf[8..16]);
        Extent {
            start,
            block_count: packed & !META_FLAG,
            is_meta: packed & META_FLAG != 0,
        }
    }
}

impl CustomLayout for Extent {}

struct ByPositionSpec;

impl BTreeSpec for ByPositionSpec {
    type Value = Extent;
    type Key = BlockIndex;

    fn key_of(value: &Extent) -> BlockIndex {
        value.start
    }
}

struct BySizeSpec;

impl BTreeSpec for BySizeSpec {
    type Value = Extent;
    type Key = (u64, u64);

    fn key_of(value: &Extent) -> (u64, u64) {
        (value.block_count, value.start.value())
    }
}

/// A bootstrap allocator that only ever grows the file, used to back the
/// two free-extent trees' own node blocks. Freed blocks are cached
/// in-memory for reuse within the lifetime of the allocator; they are not
/// persisted, so a process restart loses reuse of (but not space
/// accounted for by) previously freed meta blocks. Noted as a scope
/// reduction in `DESIGN.md`.
pub struct GrowOnlyAllocator<E: Engine> {
    engine: Rc<RefCell<E>>,
    freed: Vec<BlockIndex>,
    allocated: u64,
}

impl<E: Engine> GrowOnlyAllocator<E> {
    fn new(engine: Rc<RefCell<E>>) -> Self {
        GrowOnlyAllocator {
            engine,
            freed: Vec::new(),
            allocated: 0,
        }
    }

    /// Number of meta blocks currently checked out (allocated minus
    /// returned-but-unreused).
    pub fn blocks_in_use(&self) -> u64 {
        self.allocated - self.freed.len() as u64
    }
}

impl<E: Engine> BlockAllocator for GrowOnlyAllocator<E> {
    fn allocate_block(&mut self) -> Result<BlockIndex> {
        if let Some(index) = self.freed.pop() {
            return Ok(index);
        }
        let mut engine = self.engine.borrow_mut();
        let next = engine.size()?;
        engine.grow(1)?;
        self.allocated += 1;
        Ok(BlockIndex::new(next))
    }

    fn free_block(&mut self, index: BlockIndex) -> Result<()> {
        self.freed.push(index);
        Ok(())
    }
}

binary_format! {
    /// Persistent state of a [`DefaultAllocator`]: region size and the
    /// anchors of its two bookkeeping trees.
    pub struct AllocatorAnchor {
        total: u64,
        used: u64,
        free: u64,
        by_position: BTreeAnchor,
        by_size: BTreeAnchor,
    }
}

impl AllocatorAnchor {
    /// The anchor of a freshly created allocator with no regions yet.
    pub fn empty() -> Self {
        AllocatorAnchor {
            total: 0,
            used: 0,
            free: 0,
            by_position: BTreeAnchor::empty(),
            by_size: BTreeAnchor::empty(),
        }
    }
}

/// Usage counters returned by [`DefaultAllocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Total blocks under management, user and meta combined.
    pub total: u64,
    /// Blocks handed out via `allocate` and not yet `free`d.
    pub used: u64,
    /// Blocks available for `allocate`.
    pub free: u64,
    /// Blocks consumed by the allocator's own bookkeeping trees.
    pub meta_used: u64,
}

/// A best-fit block allocator over two bookkeeping B+ trees of free
/// extents.
pub struct DefaultAllocator<E: Engine> {
    engine: Rc<RefCell<E>>,
    total: u64,
    used: u64,
    by_position: BTree<ByPositionSpec, E, GrowOnlyAllocator<E>>,
    by_size: BTree<BySizeSpec, E, GrowOnlyAllocator<E>>,
}

impl<E: Engine> DefaultAllocator<E> {
    /// Attaches to a previously persisted allocator state.
    pub fn open(engine: Rc<RefCell<E>>, anchor: AllocatorAnchor) -> Self {
        let by_position = BTree::new(
            engine.clone(),
            GrowOnlyAllocator::new(engine.clone()),
            anchor.by_position,
        );
        let by_size = BTree::new(
            engine.clone(),
            GrowOnlyAllocator::new(engine.clone()),
            anchor.by_size,
        );
        DefaultAllocator {
            engine,
            total: anchor.total,
            used: anchor.used,
            by_position,
            by_size,
        }
    }

    /// Creates a fresh allocator with no regions; the first `allocate`
    /// call will grow the file.
    pub fn create(engine: Rc<RefCell<E>>) -> Self {
        Self::open(engine, AllocatorAnchor::empty())
    }

    /// Snapshots the current state for persistence.
    pub fn anchor(&self) -> AllocatorAnchor {
        AllocatorAnchor {
            total: self.total,
            used: self.used,
            free: self.total - self.used,
            by_position: self.by_position.anchor(),
            by_size: self.by_size.anchor(),
        }
    }

    fn meta_used(&self) -> u64 {
        self.by_position.allocator().blocks_in_use() + self.by_size.allocator().blocks_in_use()
    }

    /// Current usage counters. `total`/`used`/`free` describe the
    /// user-visible region managed by `allocate`/`free`; `meta_used`
    /// describes blocks consumed by this allocator's own bookkeeping
    /// trees, which live past the end of that region and are not part of
    /// `total`.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            total: self.total,
            used: self.used,
            free: self.total - self.used,
            meta_used: self.meta_used(),
        }
    }

    /// The allocator always grows by at least this many blocks.
    pub fn min_chunk(&self) -> u64 {
        MIN_REGION_BLOCKS
    }

    /// Whether the allocator is allowed to grow the file when it runs out
    /// of free space. Always `true`; growth failures surface as the
    /// underlying engine's I/O errors instead.
    pub fn can_grow(&self) -> bool {
        true
    }

    /// Registers `n` blocks starting at `start`, already present in the
    /// file, as free space under this allocator's management (used when
    /// bootstrapping a fresh file format around pre-reserved blocks).
    pub fn add_region(&mut self, start: BlockIndex, n: u64) -> Result<()> {
        self.total += n;
        self.insert_free_extent(Extent {
            start,
            block_count: n,
            is_meta: false,
        })
    }

    /// Allocates a run of `n` contiguous blocks, growing the file if no
    /// free extent is large enough.
    pub fn allocate(&mut self, n: u64) -> Result<BlockIndex> {
        if n == 0 {
            return Err(Error::bad_argument("cannot allocate zero blocks"));
        }
        loop {
            if let Some(extent) = self.by_size.lower_bound((n, 0))? {
                debug_assert!(extent.block_count >= n);
                self.by_size
                    .remove((extent.block_count, extent.start.value()))?;
                self.by_position.remove(extent.start)?;
                self.used += n;
                if extent.block_count > n {
                    let remainder = Extent {
                        start: extent.start + n,
                        block_count: extent.block_count - n,
                        is_meta: false,
                    };
                    self.insert_free_extent(remainder)?;
                } else {
                    self.by_position_free_adjust(extent.block_count, n);
                }
                return Ok(extent.start);
            }
            self.grow_region(n)?;
        }
    }

    // The `free` side of the ledger (total - used - meta) is derived, not
    // stored, so an exact-fit allocation needs no bookkeeping beyond
    // `used`; kept as a named no-op to document that case at the call
    // site above.
    fn by_position_free_adjust(&self, _taken: u64, _n: u64) {}

    /// Returns `n` contiguous blocks starting at `start` to the free
    /// pool, merging with whichever adjacent extents (left, right, or
    /// both) immediately border the freed run.
    pub fn free(&mut self, start: BlockIndex, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.used -= n;
        self.insert_free_extent(Extent {
            start,
            block_count: n,
            is_meta: false,
        })
    }

    /// Grows or shrinks an allocation in place when possible. Growing tries,
    /// in order: consuming a free extent starting right after the
    /// allocation, then consuming a free extent ending right before it
    /// (which moves the allocation's start), and only then falls back to
    /// allocating a fresh run, copying the block contents over, and freeing
    /// the old one.
    pub fn reallocate(&mut self, start: BlockIndex, old_n: u64, new_n: u64) -> Result<BlockIndex> {
        use std::cmp::Ordering;
        match new_n.cmp(&old_n) {
            Ordering::Equal => Ok(start),
            Ordering::Less => {
                self.free(start + new_n, old_n - new_n)?;
                Ok(start)
            }
            Ordering::Greater => {
                let extra = new_n - old_n;
                let right_start = start + old_n;
                if let Some(right) = self.by_position.find(right_start)? {
                    if !right.is_meta && right.block_count >= extra {
                        self.by_position
                            .remove(right.start)?;
                        self.by_size
                            .remove((right.block_count, right.start.value()))?;
                        self.used += extra;
                        if right.block_count > extra {
                            let remainder = Extent {
                                start: right.start + extra,
                                block_count: right.block_count - extra,
                                is_meta: false,
                            };
                            self.insert_free_extent(remainder)?;
                        }
                        return Ok(start);
                    }
                }
                if let Some(left) = self.by_position.predecessor(start)? {
                    if !left.is_meta && left.start + left.block_count == start && left.block_count >= extra {
                        self.by_position.remove(left.start)?;
                        self.by_size
                            .remove((left.block_count, left.start.value()))?;
                        self.used += extra;
                        let new_start = start - extra;
                        if left.block_count > extra {
                            let remainder = Extent {
                                start: left.start,
                                block_count: left.block_count - extra,
                                is_meta: false,
                            };
                            self.insert_free_extent(remainder)?;
                        }
                        // The allocation's start moves left by `extra`
                        // blocks; copy low-to-high so no block is
                        // overwritten before it has been read, since
                        // `new_start + i < start + i` for every `i`.
                        for i in 0..old_n {
                            let bytes = {
                                let handle = self.engine.borrow_mut().read(start + i)?;
                                handle.data().to_vec()
                            };
                            self.engine.borrow_mut().overwrite(new_start + i, &bytes)?;
                        }
                        return Ok(new_start);
                    }
                }
                let new_start = self.allocate(new_n)?;
                for i in 0..old_n {
                    let bytes = {
                        let handle = self.engine.borrow_mut().read(start + i)?;
                        handle.data().to_vec()
                    };
                    self.engine.borrow_mut().overwrite(new_start + i, &bytes)?;
                }
                self.free(start, old_n)?;
                Ok(new_start)
            }
        }
    }

    /// Walks the position tree and checks that the free extents it holds
    /// sum to exactly `total - used`, and that no two stored extents
    /// overlap. `insert_free_extent` merges both neighbors on every
    /// insertion, so no two stored extents should ever be adjacent either,
    /// but that stronger property isn't re-verified here.
    pub fn validate(&mut self) -> Result<()> {
        let mut cursor = self.by_position.cursor_at_min()?;
        let mut sum = 0u64;
        let mut prev_end: Option<BlockIndex> = None;
        while cursor.is_valid() {
            let extent = self.by_position.get(&cursor)?;
            if let Some(end) = prev_end {
                if extent.start < end {
                    return Err(Error::corruption("free extents overlap"));
                }
            }
            sum += extent.block_count;
            prev_end = Some(extent.start + extent.block_count);
            self.by_position.move_next(&cursor)?;
        }
        let expected = self.total - self.used;
        if sum != expected {
            return Err(Error::corruption(format!(
                "free extent sum {} does not match total-used {}",
                sum, expected
            )));
        }
        Ok(())
    }

    fn grow_region(&mut self, min: u64) -> Result<()> {
        let needed = self.total.max(1) + min;
        let mut new_total = self.total.max(MIN_REGION_BLOCKS);
        while new_total < needed {
            new_total *= 2;
        }
        let add = new_total - self.total;
        let old_size = {
            let mut engine = self.engine.borrow_mut();
            let old_size = engine.size()?;
            engine.grow(add)?;
            old_size
        };
        debug!("growing allocator region by {} blocks to {} total", add, new_total);
        self.total = new_total;
        self.insert_free_extent(Extent {
            start: BlockIndex::new(old_size),
            block_count: add,
            is_meta: false,
        })
    }

    fn insert_free_extent(&mut self, mut extent: Extent) -> Result<()> {
        loop {
            let right_start = extent.start + extent.block_count;
            let right = self.by_position.find(right_start)?;
            match right {
                Some(right) if !right.is_meta => {
                    self.by_position.remove(right.start)?;
                    self.by_size
                        .remove((right.block_count, right.start.value()))?;
                    extent.block_count += right.block_count;
                }
                _ => break,
            }
        }
        loop {
            let left = self.by_position.predecessor(extent.start)?;
            match left {
                Some(left) if !left.is_meta && left.start + left.block_count == extent.start => {
                    self.by_position.remove(left.start)?;
                    self.by_size
                        .remove((left.block_count, left.start.value()))?;
                    extent.start = left.start;
                    extent.block_count += left.block_count;
                }
                _ => break,
            }
        }
        self.by_position.insert(extent)?;
        self.by_size.insert(extent)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BufferedEngine;
    use crate::vfs::MemoryFile;

    fn new_allocator(block_size: u32) -> DefaultAllocator<BufferedEngine<MemoryFile>> {
        let file = MemoryFile::new();
        let engine = Rc::new(RefCell::new(BufferedEngine::new(file, block_size, 64).unwrap()));
        DefaultAllocator::create(engine)
    }

    #[test]
    fn allocate_grows_file_then_reuses_freed_space() {
        let mut alloc = new_allocator(128);
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(4).unwrap();
        assert_ne!(a, b);
        alloc.free(a, 4).unwrap();
        let c = alloc.allocate(4).unwrap();
        assert_eq!(c, a, "best fit should reuse the freed extent");
        alloc.validate().unwrap();
    }

    #[test]
    fn free_merges_adjacent_extents_left_then_right() {
        let mut alloc = new_allocator(128);
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(4).unwrap();
        assert_eq!(b, a + 4);
        // Free the left extent first: with only right-neighbor merging
        // this would leave `a` and `b` as two unmerged adjacent extents.
        alloc.free(a, 4).unwrap();
        alloc.free(b, 4).unwrap();
        let big = alloc.allocate(8).unwrap();
        assert_eq!(big, a, "adjacent free extents should merge regardless of free order");
        alloc.validate().unwrap();
    }

    #[test]
    fn free_merges_adjacent_extents_right_then_left() {
        let mut alloc = new_allocator(128);
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(4).unwrap();
        assert_eq!(b, a + 4);
        alloc.free(b, 4).unwrap();
        alloc.free(a, 4).unwrap();
        let big = alloc.allocate(8).unwrap();
        assert_eq!(big, a, "adjacent free extents should merge regardless of free order");
        alloc.validate().unwrap();
    }

    #[test]
    fn reallocate_grows_in_place_when_possible() {
        let mut alloc = new_allocator(128);
        let a = alloc.allocate(4).unwrap();
        let _b = alloc.allocate(4).unwrap();
        // Free b immediately so a can grow into it.
        alloc.free(a + 4, 4).unwrap();
        let grown = alloc.reallocate(a, 4, 8).unwrap();
        assert_eq!(grown, a);
        alloc.validate().unwrap();
    }

    #[test]
    fn reallocate_extends_left_when_right_neighbor_is_unavailable() {
        let mut alloc = new_allocator(128);
        let _guard = alloc.allocate(4).unwrap();
        let a = alloc.allocate(4).unwrap();
        let _after = alloc.allocate(4).unwrap();

        {
            let mut engine = alloc.engine.borrow_mut();
            for i in 0..4u64 {
                let handle = engine.overwrite_zero(a + i).unwrap();
                handle.writable_data()[0] = i as u8 + 1;
            }
        }

        alloc.free(_guard, 4).unwrap();
        let grown = alloc.reallocate(a, 4, 8).unwrap();
        assert_eq!(grown, _guard, "should have extended left into the freed run");

        {
            let mut engine = alloc.engine.borrow_mut();
            for i in 0..4u64 {
                let handle = engine.read(grown + 4 + i).unwrap();
                assert_eq!(handle.data()[0], i as u8 + 1, "moved data must land at the new offset");
            }
        }
        alloc.validate().unwrap();
    }
}
