//! A LIFO stack over a singly linked chain of blocks, each holding
//! several values so a push only allocates when its chunk fills up.

use std::cell::RefCell;
use std::rc::Rc;

use crate::address::BlockIndex;
use crate::allocator::DefaultAllocator;
use crate::binary_format;
use crate::engine::Engine;
use crate::error::Result;
use crate::serialize::StaticLayout;

const HEADER_SIZE: usize = 8 + 4; // next, count

binary_format! {
    /// Persistent state of a [`Stack`]: value count and the chunk
    /// currently at the top.
    pub struct StackAnchor {
        size: u64,
        top: BlockIndex,
    }
}

impl StackAnchor {
    /// The anchor of an empty stack.
    pub fn empty() -> Self {
        StackAnchor {
            size: 0,
            top: BlockIndex::INVALID,
        }
    }
}

struct Chunk<T> {
    next: BlockIndex,
    values: Vec<T>,
}

/// A stack of `T` values chunked into blocks linked from top to bottom.
pub struct Stack<T: StaticLayout + Copy, E: Engine> {
    engine: Rc<RefCell<E>>,
    anchor: StackAnchor,
    capacity: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: StaticLayout + Copy, E: Engine> Stack<T, E> {
    /// Attaches to a previously persisted stack.
    pub fn open(engine: Rc<RefCell<E>>, anchor: StackAnchor) -> Self {
        let block_size = engine.borrow().block_size() as usize;
        let capacity = (block_size - HEADER_SIZE) / T::SIZE;
        assert!(capacity >= 1, "block too small to hold a single value");
        Stack {
            engine,
            anchor,
            capacity,
            _marker: std::marker::PhantomData,
        }
    }

    /// Creates a fresh, empty stack.
    pub fn create(engine: Rc<RefCell<E>>) -> Self {
        Self::open(engine, StackAnchor::empty())
    }

    /// The stack's persistent anchor, to be saved by the caller.
    pub fn anchor(&self) -> StackAnchor {
        self.anchor
    }

    /// Number of values stored.
    pub fn len(&self) -> u64 {
        self.anchor.size
    }

    /// Whether the stack holds no values.
    pub fn is_empty(&self) -> bool {
        self.anchor.size == 0
    }

    fn read_chunk(&self, index: BlockIndex) -> Result<Chunk<T>> {
        let handle = self.engine.borrow_mut().read(index)?;
        let data = handle.data();
        let next = BlockIndex::read_layout(&data[0..8]);
        let count = u32::read_layout(&data[8..12]) as usize;
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let off = HEADER_SIZE + i * T::SIZE;
            values.push(T::read_layout(&data[off..off + T::SIZE]));
        }
        Ok(Chunk { next, values })
    }

    fn write_chunk(&self, index: BlockIndex, chunk: &Chunk<T>) -> Result<()> {
        let handle = self.engine.borrow_mut().overwrite_zero(index)?;
        let mut data = handle.writable_data();
        chunk.next.write_layout(&mut data[0..8]);
        (chunk.values.len() as u32).write_layout(&mut data[8..12]);
        for (i, value) in chunk.values.iter().enumerate() {
            let off = HEADER_SIZE + i * T::SIZE;
            value.write_layout(&mut data[off..off + T::SIZE]);
        }
        Ok(())
    }

    /// Pushes `value` onto the top of the stack.
    pub fn push(&mut self, alloc: &mut DefaultAllocator<E>, value: T) -> Result<()> {
        if self.anchor.top == BlockIndex::INVALID {
            let block = alloc.allocate(1)?;
            self.write_chunk(
                block,
                &Chunk {
                    next: BlockIndex::INVALID,
                    values: vec![value],
                },
            )?;
            self.anchor.top = block;
        } else {
            let top = self.anchor.top;
            let mut chunk = self.read_chunk(top)?;
            if chunk.values.len() < self.capacity {
                chunk.values.push(value);
                self.write_chunk(top, &chunk)?;
            } else {
                let block = alloc.allocate(1)?;
                self.write_chunk(
                    block,
                    &Chunk {
                        next: top,
                        values: vec![value],
                    },
                )?;
                self.anchor.top = block;
            }
        }
        self.anchor.size += 1;
        Ok(())
    }

    /// Removes and returns the top value, if any.
    pub fn pop(&mut self, alloc: &mut DefaultAllocator<E>) -> Result<Option<T>> {
        if self.anchor.top == BlockIndex::INVALID {
            return Ok(None);
        }
        let top = self.anchor.top;
        let mut chunk = self.read_chunk(top)?;
        let value = chunk.values.pop().unwrap();
        if chunk.values.is_empty() {
            self.anchor.top = chunk.next;
            alloc.free(top, 1)?;
        } else {
            self.write_chunk(top, &chunk)?;
        }
        self.anchor.size -= 1;
        Ok(Some(value))
    }

    /// Reads the top value without removing it.
    pub fn peek(&self) -> Result<Option<T>> {
        if self.anchor.top == BlockIndex::INVALID {
            return Ok(None);
        }
        let chunk = self.read_chunk(self.anchor.top)?;
        Ok(chunk.values.last().copied())
    }

    /// Frees every chunk and resets the stack to empty.
    pub fn clear(&mut self, alloc: &mut DefaultAllocator<E>) -> Result<()> {
        let mut current = self.anchor.top;
        while current != BlockIndex::INVALID {
            let chunk = self.read_chunk(current)?;
            let next = chunk.next;
            alloc.free(current, 1)?;
            current = next;
        }
        self.anchor = StackAnchor::empty();
        Ok(())
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
    fn push_pop_is_lifo() {
        let (engine, mut alloc) = new_pair(64);
        let mut stack: Stack<u32, _> = Stack::create(engine);
        for i in 0..30u32 {
            stack.push(&mut alloc, i).unwrap();
        }
        assert_eq!(stack.peek().unwrap(), Some(29));
        for i in (0..30u32).rev() {
            assert_eq!(stack.pop(&mut alloc).unwrap(), Some(i));
        }
        assert_eq!(stack.pop(&mut alloc).unwrap(), None);
    }

    #[test]
    fn clear_frees_all_chunks() {
        let (engine, mut alloc) = new_pair(64);
        let mut stack: Stack<u32, _> = Stack::create(engine);
        for i in 0..15u32 {
            stack.push(&mut alloc, i).unwrap();
        }
        stack.clear(&mut alloc).unwrap();
        assert_eq!(stack.len(), 0);
        alloc.validate().unwrap();
    }
}
