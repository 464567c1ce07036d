//! A growable sequence of fixed-size values stored in an [`Extent`],
//! distinguishing the extent's physical capacity (in blocks) from the
//! array's logical length (in values).

use std::cell::RefCell;
use std::rc::Rc;

use crate::allocator::DefaultAllocator;
use crate::binary_format;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentAnchor};
use crate::serialize::StaticLayout;

/// How an [`Array`] grows its backing extent when it runs out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Grows by a fixed number of blocks at a time.
    Linear {
        /// Blocks added per growth step.
        chunk: u64,
    },
    /// Doubles the backing extent's block count (at least one block).
    Exponential,
}

binary_format! {
    /// Persistent state of an [`Array`]: its backing extent and logical
    /// length.
    pub struct ArrayAnchor {
        extent: ExtentAnchor,
        len: u64,
    }
}

impl ArrayAnchor {
    /// The anchor of an empty array with no backing storage.
    pub fn empty() -> Self {
        ArrayAnchor {
            extent: ExtentAnchor::empty(),
            len: 0,
        }
    }
}

/// A sequence of fixed-size `T` values packed into an [`Extent`]'s blocks,
/// growing the extent as needed and never splitting a value across a
/// block boundary.
pub struct Array<T: StaticLayout + Copy, E: Engine> {
    extent: Extent<E>,
    len: u64,
    values_per_block: usize,
    block_size: u32,
    growth: GrowthPolicy,
    _marker: std::marker::PhantomData<T>,
}

impl<T: StaticLayout + Copy, E: Engine> Array<T, E> {
    /// Attaches to a previously persisted array.
    pub fn open(engine: Rc<RefCell<E>>, anchor: ArrayAnchor, growth: GrowthPolicy) -> Self {
        let block_size = engine.borrow().block_size();
        let values_per_block = Self::values_per_block(block_size);
        Array {
            extent: Extent::open(engine, anchor.extent),
            len: anchor.len,
            values_per_block,
            block_size,
            growth,
            _marker: std::marker::PhantomData,
        }
    }

    /// Creates a fresh, empty array with no backing storage yet.
    pub fn create(engine: Rc<RefCell<E>>, growth: GrowthPolicy) -> Self {
        Self::open(engine, ArrayAnchor::empty(), growth)
    }

    fn values_per_block(block_size: u32) -> usize {
        let per = block_size as usize / T::SIZE;
        assert!(per >= 1, "block too small to hold a single value");
        per
    }

    /// The array's persistent anchor, to be saved by the caller.
    pub fn anchor(&self) -> ArrayAnchor {
        ArrayAnchor {
            extent: self.extent.anchor(),
            len: self.len,
        }
    }

    /// Number of values stored.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the array holds no values.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of values the current backing extent can hold without
    /// growing.
    pub fn capacity(&self) -> u64 {
        self.extent.block_count() * self.values_per_block as u64
    }

    fn locate(&self, index: u64) -> (u64, usize) {
        (
            index / self.values_per_block as u64,
            (index % self.values_per_block as u64) as usize,
        )
    }

    fn byte_range(&self, slot: usize) -> (usize, usize) {
        let off = slot * T::SIZE;
        (off, off + T::SIZE)
    }

    /// Reads the value at `index`.
    pub fn get(&mut self, index: u64) -> Result<T> {
        if index >= self.len {
            return Err(Error::bad_argument(format!(
                "index {} out of bounds for array of length {}",
                index, self.len
            )));
        }
        let (block, slot) = self.locate(index);
        let handle = self.extent.read(block)?;
        let (start, end) = self.byte_range(slot);
        Ok(T::read_layout(&handle.data()[start..end]))
    }

    /// Overwrites the value at `index`.
    pub fn set(&mut self, index: u64, value: &T) -> Result<()> {
        if index >= self.len {
            return Err(Error::bad_argument(format!(
                "index {} out of bounds for array of length {}",
                index, self.len
            )));
        }
        let (block, slot) = self.locate(index);
        let handle = self.extent.read(block)?;
        let (start, end) = self.byte_range(slot);
        value.write_layout(&mut handle.writable_data()[start..end]);
        Ok(())
    }

    /// Ensures the backing extent can hold at least `min_capacity`
    /// values without growing again.
    pub fn reserve(&mut self, alloc: &mut DefaultAllocator<E>, min_capacity: u64) -> Result<()> {
        if self.capacity() >= min_capacity {
            return Ok(());
        }
        let needed_blocks = (min_capacity + self.values_per_block as u64 - 1)
            / self.values_per_block as u64;
        let new_blocks = match self.growth {
            GrowthPolicy::Linear { chunk } => {
                let mut blocks = self.extent.block_count().max(chunk);
                while blocks < needed_blocks {
                    blocks += chunk.max(1);
                }
                blocks
            }
            GrowthPolicy::Exponential => {
                let mut blocks = self.extent.block_count().max(1);
                while blocks < needed_blocks {
                    blocks *= 2;
                }
                blocks
            }
        };
        self.extent.resize(alloc, new_blocks)
    }

    /// Appends `value` to the end of the array, growing the backing
    /// extent first if necessary.
    pub fn push_back(&mut self, alloc: &mut DefaultAllocator<E>, value: T) -> Result<()> {
        self.reserve(alloc, self.len + 1)?;
        self.len += 1;
        self.set(self.len - 1, &value)
    }

    /// Removes and returns the last value, if any.
    pub fn pop_back(&mut self) -> Result<Option<T>> {
        if self.len == 0 {
            return Ok(None);
        }
        let value = self.get(self.len - 1)?;
        self.len -= 1;
        Ok(Some(value))
    }

    /// Sets the logical length to `new_len`, growing the backing extent
    /// (new slots hold unspecified bytes until written) or simply
    /// truncating the logical view without releasing storage.
    pub fn resize(&mut self, alloc: &mut DefaultAllocator<E>, new_len: u64) -> Result<()> {
        if new_len > self.len {
            self.reserve(alloc, new_len)?;
        }
        self.len = new_len;
        Ok(())
    }

    /// Empties the array without releasing its backing storage.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Empties the array and releases its backing storage entirely.
    pub fn reset(&mut self, alloc: &mut DefaultAllocator<E>) -> Result<()> {
        self.len = 0;
        self.extent.reset(alloc)
    }

    /// The engine's block size this array was constructed against,
    /// exposed for diagnostics.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BufferedEngine;
    use crate::vfs::MemoryFile;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn new_pair(block_size: u32) -> (Rc<RefCell<BufferedEngine<MemoryFile>>>, DefaultAllocator<BufferedEngine<MemoryFile>>) {
        let file = MemoryFile::new();
        let engine = Rc::new(RefCell::new(BufferedEngine::new(file, block_size, 64).unwrap()));
        let alloc = DefaultAllocator::create(engine.clone());
        (engine, alloc)
    }

    #[test]
    fn push_pop_round_trip() {
        let (engine, mut alloc) = new_pair(64);
        let mut arr: Array<u32, _> = Array::create(engine, GrowthPolicy::Linear { chunk: 1 });
        for i in 0..50u32 {
            arr.push_back(&mut alloc, i).unwrap();
        }
        assert_eq!(arr.len(), 50);
        for i in 0..50u32 {
            assert_eq!(arr.get(i as u64).unwrap(), i);
        }
        for i in (0..50u32).rev() {
            assert_eq!(arr.pop_back().unwrap(), Some(i));
        }
        assert_eq!(arr.pop_back().unwrap(), None);
    }

    #[test]
    fn exponential_growth_reaches_capacity() {
        let (engine, mut alloc) = new_pair(64);
        let mut arr: Array<u64, _> = Array::create(engine, GrowthPolicy::Exponential);
        for i in 0..200u64 {
            arr.push_back(&mut alloc, i).unwrap();
        }
        assert_eq!(arr.len(), 200);
        assert!(arr.capacity() >= 200);
        alloc.validate().unwrap();
    }

    #[test]
    fn resize_then_set_new_slots() {
        let (engine, mut alloc) = new_pair(64);
        let mut arr: Array<u32, _> = Array::create(engine, GrowthPolicy::Linear { chunk: 2 });
        arr.resize(&mut alloc, 10).unwrap();
        assert_eq!(arr.len(), 10);
        arr.set(9, &99).unwrap();
        assert_eq!(arr.get(9).unwrap(), 99);
    }

    #[test]
    fn reset_releases_storage() {
        let (engine, mut alloc) = new_pair(64);
        let mut arr: Array<u32, _> = Array::create(engine, GrowthPolicy::Linear { chunk: 1 });
        arr.push_back(&mut alloc, 1).unwrap();
        arr.reset(&mut alloc).unwrap();
        assert_eq!(arr.len(), 0);
        assert_eq!(arr.capacity(), 0);
        alloc.validate().unwrap();
    }
}
