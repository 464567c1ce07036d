//! A doubly linked list of fixed-size values, chunked into blocks so that
//! a single push doesn't always cost a fresh allocation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::address::BlockIndex;
use crate::allocator::DefaultAllocator;
use crate::binary_format;
use crate::engine::Engine;
use crate::error::Result;
use crate::serialize::StaticLayout;

const HEADER_SIZE: usize = 8 + 8 + 4; // prev, next, count

binary_format! {
    /// Persistent state of a [`List`]: value count and the blocks at
    /// either end of the chain.
    pub struct ListAnchor {
        size: u64,
        first: BlockIndex,
        last: BlockIndex,
    }
}

impl ListAnchor {
    /// The anchor of an empty list.
    pub fn empty() -> Self {
        ListAnchor {
            size: 0,
            first: BlockIndex::INVALID,
            last: BlockIndex::INVALID,
        }
    }
}

struct Node<T> {
    prev: BlockIndex,
    next: BlockIndex,
    values: Vec<T>,
}

/// A doubly linked list of `T` values, each node holding up to
/// `capacity` values plus links to its neighbors.
pub struct List<T: StaticLayout + Copy, E: Engine> {
    engine: Rc<RefCell<E>>,
    anchor: ListAnchor,
    capacity: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: StaticLayout + Copy, E: Engine> List<T, E> {
    /// Attaches to a previously persisted list.
    pub fn open(engine: Rc<RefCell<E>>, anchor: ListAnchor) -> Self {
        let block_size = engine.borrow().block_size() as usize;
        let capacity = (block_size - HEADER_SIZE) / T::SIZE;
        assert!(capacity >= 1, "block too small to hold a single value");
        List {
            engine,
            anchor,
            capacity,
            _marker: std::marker::PhantomData,
        }
    }

    /// Creates a fresh, empty list.
    pub fn create(engine: Rc<RefCell<E>>) -> Self {
        Self::open(engine, ListAnchor::empty())
    }

    /// The list's persistent anchor, to be saved by the caller.
    pub fn anchor(&self) -> ListAnchor {
        self.anchor
    }

    /// Number of values stored.
    pub fn len(&self) -> u64 {
        self.anchor.size
    }

    /// Whether the list holds no values.
    pub fn is_empty(&self) -> bool {
        self.anchor.size == 0
    }

    fn read_node(&self, index: BlockIndex) -> Result<Node<T>> {
        let handle = self.engine.borrow_mut().read(index)?;
        let data = handle.data();
        let prev = BlockIndex::read_layout(&data[0..8]);
        let next = BlockIndex::read_layout(&data[8..16]);
        let count = u32::read_layout(&data[16..20]) as usize;
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let off = HEADER_SIZE + i * T::SIZE;
            values.push(T::read_layout(&data[off..off + T::SIZE]));
        }
        Ok(Node { prev, next, values })
    }

    fn write_node(&self, index: BlockIndex, node: &Node<T>) -> Result<()> {
        let handle = self.engine.borrow_mut().overwrite_zero(index)?;
        let mut data = handle.writable_data();
        node.prev.write_layout(&mut data[0..8]);
        node.next.write_layout(&mut data[8..16]);
        (node.values.len() as u32).write_layout(&mut data[16..20]);
        for (i, value) in node.values.iter().enumerate() {
            let off = HEADER_SIZE + i * T::SIZE;
            value.write_layout(&mut data[off..off + T::SIZE]);
        }
        Ok(())
    }

    /// Appends `value` to the end of the list.
    pub fn push_back(&mut self, alloc: &mut DefaultAllocator<E>, value: T) -> Result<()> {
        if self.anchor.last == BlockIndex::INVALID {
            let block = alloc.allocate(1)?;
            self.write_node(
                block,
                &Node {
                    prev: BlockIndex::INVALID,
                    next: BlockIndex::INVALID,
                    values: vec![value],
                },
            )?;
            self.anchor.first = block;
            self.anchor.last = block;
        } else {
            let last = self.anchor.last;
            let mut node = self.read_node(last)?;
            if node.values.len() < self.capacity {
                node.values.push(value);
                self.write_node(last, &node)?;
            } else {
                let block = alloc.allocate(1)?;
                self.write_node(
                    block,
                    &Node {
                        prev: last,
                        next: BlockIndex::INVALID,
                        values: vec![value],
                    },
                )?;
                node.next = block;
                self.write_node(last, &node)?;
                self.anchor.last = block;
            }
        }
        self.anchor.size += 1;
        Ok(())
    }

    /// Prepends `value` to the front of the list.
    pub fn push_front(&mut self, alloc: &mut DefaultAllocator<E>, value: T) -> Result<()> {
        if self.anchor.first == BlockIndex::INVALID {
            return self.push_back(alloc, value);
        }
        let first = self.anchor.first;
        let mut node = self.read_node(first)?;
        if node.values.len() < self.capacity {
            node.values.insert(0, value);
            self.write_node(first, &node)?;
        } else {
            let block = alloc.allocate(1)?;
            self.write_node(
                block,
                &Node {
                    prev: BlockIndex::INVALID,
                    next: first,
                    values: vec![value],
                },
            )?;
            node.prev = block;
            self.write_node(first, &node)?;
            self.anchor.first = block;
        }
        self.anchor.size += 1;
        Ok(())
    }

    /// Removes and returns the last value, if any.
    pub fn pop_back(&mut self, alloc: &mut DefaultAllocator<E>) -> Result<Option<T>> {
        if self.anchor.last == BlockIndex::INVALID {
            return Ok(None);
        }
        let last = self.anchor.last;
        let mut node = self.read_node(last)?;
        let value = node.values.pop().unwrap();
        if node.values.is_empty() {
            let prev = node.prev;
            if prev == BlockIndex::INVALID {
                self.anchor.first = BlockIndex::INVALID;
                self.anchor.last = BlockIndex::INVALID;
            } else {
                let mut prev_node = self.read_node(prev)?;
                prev_node.next = BlockIndex::INVALID;
                self.write_node(prev, &prev_node)?;
                self.anchor.last = prev;
            }
            alloc.free(last, 1)?;
        } else {
            self.write_node(last, &node)?;
        }
        self.anchor.size -= 1;
        Ok(Some(value))
    }

    /// Removes and returns the first value, if any.
    pub fn pop_front(&mut self, alloc: &mut DefaultAllocator<E>) -> Result<Option<T>> {
        if self.anchor.first == BlockIndex::INVALID {
            return Ok(None);
        }
        let first = self.anchor.first;
        let mut node = self.read_node(first)?;
        let value = node.values.remove(0);
        if node.values.is_empty() {
            let next = node.next;
            if next == BlockIndex::INVALID {
                self.anchor.first = BlockIndex::INVALID;
                self.anchor.last = BlockIndex::INVALID;
            } else {
                let mut next_node = self.read_node(next)?;
                next_node.prev = BlockIndex::INVALID;
                self.write_node(next, &next_node)?;
                self.anchor.first = next;
            }
            alloc.free(first, 1)?;
        } else {
            self.write_node(first, &node)?;
        }
        self.anchor.size -= 1;
        Ok(Some(value))
    }

    /// Collects every value from front to back. Intended for tests and
    /// diagnostics, not hot-path traversal.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(self.anchor.size as usize);
        let mut current = self.anchor.first;
        while current != BlockIndex::INVALID {
            let node = self.read_node(current)?;
            out.extend(node.values.iter().copied());
            current = node.next;
        }
        Ok(out)
    }

    /// Frees every node and resets the list to empty.
    pub fn clear(&mut self, alloc: &mut DefaultAllocator<E>) -> Result<()> {
        let mut current = self.anchor.first;
        while current != BlockIndex::INVALID {
            let node = self.read_node(current)?;
            let next = node.next;
            alloc.free(current, 1)?;
            current = next;
        }
        self.anchor = ListAnchor::empty();
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
    fn push_back_pop_front_is_fifo_order() {
        let (engine, mut alloc) = new_pair(64);
        let mut list: List<u32, _> = List::create(engine);
        for i in 0..40u32 {
            list.push_back(&mut alloc, i).unwrap();
        }
        assert_eq!(list.len(), 40);
        for i in 0..40u32 {
            assert_eq!(list.pop_front(&mut alloc).unwrap(), Some(i));
        }
        assert_eq!(list.pop_front(&mut alloc).unwrap(), None);
    }

    #[test]
    fn push_front_pop_back_is_lifo_from_front() {
        let (engine, mut alloc) = new_pair(64);
        let mut list: List<u32, _> = List::create(engine);
        for i in 0..10u32 {
            list.push_front(&mut alloc, i).unwrap();
        }
        let collected = list.to_vec().unwrap();
        assert_eq!(collected, (0..10u32).rev().collect::<Vec<_>>());
    }

    #[test]
    fn clear_frees_all_nodes() {
        let (engine, mut alloc) = new_pair(64);
        let mut list: List<u32, _> = List::create(engine);
        for i in 0..20u32 {
            list.push_back(&mut alloc, i).unwrap();
        }
        list.clear(&mut alloc).unwrap();
        assert_eq!(list.len(), 0);
        alloc.validate().unwrap();
    }
}
