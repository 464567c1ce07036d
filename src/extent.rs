//! A contiguous run of blocks allocated through a [`DefaultAllocator`],
//! addressed by position within the run rather than by absolute block
//! index. The building block `Array<T>` and the secondary containers
//! layer fixed-size values on top of.

use std::cell::RefCell;
use std::rc::Rc;

use crate::address::BlockIndex;
use crate::allocator::DefaultAllocator;
use crate::binary_format;
use crate::engine::{BlockHandle, Engine};
use crate::error::{Error, Result};

binary_format! {
    /// Persistent state of an [`Extent`]: its starting block and length.
    pub struct ExtentAnchor {
        start: BlockIndex,
        block_count: u64,
    }
}

impl ExtentAnchor {
    /// The anchor of an extent holding no blocks.
    pub fn empty() -> Self {
        ExtentAnchor {
            start: BlockIndex::INVALID,
            block_count: 0,
        }
    }
}

/// A run of `block_count` contiguous blocks starting at `start`, owned
/// through a [`DefaultAllocator`]. Indices passed to its accessors are
/// relative to the start of the run, not absolute block indices.
pub struct Extent<E: Engine> {
    engine: Rc<RefCell<E>>,
    anchor: ExtentAnchor,
}

impl<E: Engine> Extent<E> {
    /// Attaches to a previously persisted extent.
    pub fn open(engine: Rc<RefCell<E>>, anchor: ExtentAnchor) -> Self {
        Extent { engine, anchor }
    }

    /// Allocates a fresh run of `block_count` blocks.
    pub fn create(
        engine: Rc<RefCell<E>>,
        alloc: &mut DefaultAllocator<E>,
        block_count: u64,
    ) -> Result<Self> {
        let start = if block_count == 0 {
            BlockIndex::INVALID
        } else {
            alloc.allocate(block_count)?
        };
        Ok(Extent {
            engine,
            anchor: ExtentAnchor {
                start,
                block_count,
            },
        })
    }

    /// The extent's persistent anchor, to be saved by the caller.
    pub fn anchor(&self) -> ExtentAnchor {
        self.anchor
    }

    /// Number of blocks in the run.
    pub fn block_count(&self) -> u64 {
        self.anchor.block_count
    }

    fn check_index(&self, index: u64) -> Result<BlockIndex> {
        if index >= self.anchor.block_count {
            return Err(Error::bad_argument(format!(
                "index {} out of bounds for extent of {} blocks",
                index, self.anchor.block_count
            )));
        }
        Ok(self.anchor.start + index)
    }

    /// Reads the block at `index` within this extent.
    pub fn read(&mut self, index: u64) -> Result<BlockHandle> {
        let block = self.check_index(index)?;
        self.engine.borrow_mut().read(block)
    }

    /// Returns a zeroed, already-dirty handle for the block at `index`.
    pub fn overwrite_zero(&mut self, index: u64) -> Result<BlockHandle> {
        let block = self.check_index(index)?;
        self.engine.borrow_mut().overwrite_zero(block)
    }

    /// Overwrites the block at `index` with `data`.
    pub fn overwrite(&mut self, index: u64, data: &[u8]) -> Result<BlockHandle> {
        let block = self.check_index(index)?;
        self.engine.borrow_mut().overwrite(block, data)
    }

    /// Grows or shrinks the extent to `new_block_count`, moving its
    /// contents if the allocator could not extend it in place.
    pub fn resize(&mut self, alloc: &mut DefaultAllocator<E>, new_block_count: u64) -> Result<()> {
        if new_block_count == self.anchor.block_count {
            return Ok(());
        }
        if self.anchor.block_count == 0 {
            self.anchor.start = alloc.allocate(new_block_count)?;
        } else if new_block_count == 0 {
            alloc.free(self.anchor.start, self.anchor.block_count)?;
            self.anchor.start = BlockIndex::INVALID;
        } else {
            self.anchor.start =
                alloc.reallocate(self.anchor.start, self.anchor.block_count, new_block_count)?;
        }
        self.anchor.block_count = new_block_count;
        Ok(())
    }

    /// Frees the extent's blocks and resets it to empty.
    pub fn reset(&mut self, alloc: &mut DefaultAllocator<E>) -> Result<()> {
        self.resize(alloc, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BufferedEngine;
    use crate::vfs::MemoryFile;

    fn new_pair(block_size: u32) -> (Rc<RefCell<BufferedEngine<MemoryFile>>>, DefaultAllocator<BufferedEngine<MemoryFile>>) {
        let file = MemoryFile::new();
        let engine = Rc::new(RefCell::new(BufferedEngine::new(file, block_size, 64).unwrap()));
        let alloc = DefaultAllocator::create(engine.clone());
        (engine, alloc)
    }

    #[test]
    fn create_read_write_round_trip() {
        let (engine, mut alloc) = new_pair(64);
        let mut extent = Extent::create(engine, &mut alloc, 4).unwrap();
        let h = extent.overwrite_zero(2).unwrap();
        h.writable_data()[0] = 42;
        drop(h);
        assert_eq!(extent.read(2).unwrap().data()[0], 42);
    }

    #[test]
    fn out_of_bounds_index_errors() {
        let (engine, mut alloc) = new_pair(64);
        let mut extent = Extent::create(engine, &mut alloc, 2).unwrap();
        assert!(extent.read(5).is_err());
    }

    #[test]
    fn resize_grows_and_preserves_contents() {
        let (engine, mut alloc) = new_pair(64);
        let mut extent = Extent::create(engine, &mut alloc, 2).unwrap();
        let h = extent.overwrite_zero(1).unwrap();
        h.writable_data()[0] = 7;
        drop(h);
        extent.resize(&mut alloc, 5).unwrap();
        assert_eq!(extent.block_count(), 5);
        assert_eq!(extent.read(1).unwrap().data()[0], 7);
        alloc.validate().unwrap();
    }

    #[test]
    fn reset_frees_all_blocks() {
        let (engine, mut alloc) = new_pair(64);
        let mut extent = Extent::create(engine, &mut alloc, 3).unwrap();
        extent.reset(&mut alloc).unwrap();
        assert_eq!(extent.block_count(), 0);
        alloc.validate().unwrap();
    }
}
