//! Variable-size object storage over a segregated free list keyed by
//! power-of-two size classes.
//!
//! Each size class hands out slots carved from dedicated blocks: when a
//! class's free list runs dry, a fresh block is allocated and diced
//! entirely into same-class slots, which are chained onto the free list
//! before one is handed back to the caller. This is a single-chunk
//! simplification of the generational, compacting design the heap is
//! grounded on; freed slots are never coalesced across classes or
//! returned to the block allocator, so a heap that churns many
//! differently sized objects will not reclaim block-level space. Noted
//! in `DESIGN.md`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::address::RawAddress;
use crate::allocator::DefaultAllocator;
use crate::binary_format;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::serialize::StaticLayout;

const NUM_CLASSES: usize = 24;
const MIN_CLASS_SIZE: usize = 16;
const LEN_HEADER: usize = 4;

fn class_size(class: usize) -> usize {
    MIN_CLASS_SIZE << class
}

fn class_for_len(len: usize) -> Option<usize> {
    (0..NUM_CLASSES).find(|&c| class_size(c) - LEN_HEADER >= len)
}

binary_format! {
    /// Persistent state of a [`Heap`]: live object count, one free-list
    /// head per size class, and the most recently carved slab block
    /// (kept for diagnostics; carving always allocates fresh blocks, it
    /// never revisits this one).
    pub struct HeapAnchor {
        object_count: u64,
        free_lists: [RawAddress; NUM_CLASSES],
        top_chunk: crate::address::BlockIndex,
    }
}

impl HeapAnchor {
    /// The anchor of a heap with no live objects.
    pub fn empty() -> Self {
        HeapAnchor {
            object_count: 0,
            free_lists: [RawAddress::INVALID; NUM_CLASSES],
            top_chunk: crate::address::BlockIndex::INVALID,
        }
    }
}

/// Names a variable-length object stored in a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference(RawAddress);

/// A heap of variable-length byte objects, each no larger than
/// `block_size - 4` bytes (the length header plus payload must fit in a
/// single block).
pub struct Heap<E: Engine> {
    engine: Rc<RefCell<E>>,
    anchor: HeapAnchor,
    block_size: u32,
}

impl<E: Engine> Heap<E> {
    /// Attaches to a previously persisted heap.
    pub fn open(engine: Rc<RefCell<E>>, anchor: HeapAnchor) -> Self {
        let block_size = engine.borrow().block_size();
        Heap {
            engine,
            anchor,
            block_size,
        }
    }

    /// Creates a fresh, empty heap.
    pub fn create(engine: Rc<RefCell<E>>) -> Self {
        Self::open(engine, HeapAnchor::empty())
    }

    /// The heap's persistent anchor, to be saved by the caller.
    pub fn anchor(&self) -> HeapAnchor {
        self.anchor
    }

    /// Number of live objects.
    pub fn len(&self) -> u64 {
        self.anchor.object_count
    }

    /// Whether the heap holds no live objects.
    pub fn is_empty(&self) -> bool {
        self.anchor.object_count == 0
    }

    fn read_at(&self, addr: RawAddress, len: usize) -> Result<Vec<u8>> {
        let (block, offset) = addr.split(self.block_size);
        let handle = self.engine.borrow_mut().read(block)?;
        let off = offset as usize;
        Ok(handle.data()[off..off + len].to_vec())
    }

    fn write_at(&self, addr: RawAddress, bytes: &[u8]) -> Result<()> {
        let (block, offset) = addr.split(self.block_size);
        let handle = self.engine.borrow_mut().read(block)?;
        let off = offset as usize;
        handle.writable_data()[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn carve_new_slab(&mut self, alloc: &mut DefaultAllocator<E>, class: usize) -> Result<()> {
        let block = alloc.allocate(1)?;
        let size = class_size(class);
        let per_block = self.block_size as usize / size;
        let handle = self.engine.borrow_mut().overwrite_zero(block)?;
        let base = block.to_address(self.block_size);
        {
            let mut data = handle.writable_data();
            for i in 0..per_block {
                let slot_off = i * size;
                let next = if i + 1 < per_block {
                    base + ((i + 1) * size) as u64
                } else {
                    RawAddress::INVALID
                };
                next.write_layout(&mut data[slot_off..slot_off + 8]);
            }
        }
        self.anchor.free_lists[class] = base;
        self.anchor.top_chunk = block;
        Ok(())
    }

    /// Stores `bytes` as a new object, returning a reference to it.
    /// Fails with `Unsupported` if `bytes` is too large for the largest
    /// size class this heap carves.
    pub fn allocate(&mut self, alloc: &mut DefaultAllocator<E>, bytes: &[u8]) -> Result<Reference> {
        let class = class_for_len(bytes.len()).ok_or_else(|| {
            Error::unsupported(format!(
                "object of {} bytes exceeds the largest heap size class",
                bytes.len()
            ))
        })?;
        if class_size(class) > self.block_size as usize {
            return Err(Error::unsupported(format!(
                "object of {} bytes does not fit in a single block",
                bytes.len()
            )));
        }
        if self.anchor.free_lists[class] == RawAddress::INVALID {
            self.carve_new_slab(alloc, class)?;
        }
        let addr = self.anchor.free_lists[class];
        let next = RawAddress::read_layout(&self.read_at(addr, 8)?);
        self.anchor.free_lists[class] = next;

        let mut slot = vec![0u8; LEN_HEADER + bytes.len()];
        (bytes.len() as u32).write_layout(&mut slot[0..LEN_HEADER]);
        slot[LEN_HEADER..].copy_from_slice(bytes);
        self.write_at(addr, &slot)?;

        self.anchor.object_count += 1;
        Ok(Reference(addr))
    }

    /// Reads the bytes of a live object.
    pub fn get(&self, reference: Reference) -> Result<Vec<u8>> {
        let len = u32::read_layout(&self.read_at(reference.0, LEN_HEADER)?) as usize;
        self.read_at(reference.0 + LEN_HEADER as u64, len)
    }

    /// Overwrites a live object's bytes in place. The new length must fit
    /// within the size class the object was originally allocated from.
    pub fn set(&mut self, reference: Reference, bytes: &[u8]) -> Result<()> {
        let old_len = u32::read_layout(&self.read_at(reference.0, LEN_HEADER)?) as usize;
        let class = class_for_len(old_len).expect("previously allocated length must have a class");
        if LEN_HEADER + bytes.len() > class_size(class) {
            return Err(Error::bad_argument(
                "replacement value does not fit in the object's original size class",
            ));
        }
        let mut slot = vec![0u8; LEN_HEADER + bytes.len()];
        (bytes.len() as u32).write_layout(&mut slot[0..LEN_HEADER]);
        slot[LEN_HEADER..].copy_from_slice(bytes);
        self.write_at(reference.0, &slot)
    }

    /// Returns an object's storage to its size class's free list.
    pub fn free(&mut self, reference: Reference) -> Result<()> {
        let len = u32::read_layout(&self.read_at(reference.0, LEN_HEADER)?) as usize;
        let class = class_for_len(len).expect("previously allocated length must have a class");
        let next = self.anchor.free_lists[class];
        let mut link = vec![0u8; 8];
        next.write_layout(&mut link);
        self.write_at(reference.0, &link)?;
        self.anchor.free_lists[class] = reference.0;
        self.anchor.object_count -= 1;
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
    fn allocate_get_round_trip() {
        let (engine, mut alloc) = new_pair(256);
        let mut heap = Heap::create(engine);
        let r = heap.allocate(&mut alloc, b"hello world").unwrap();
        assert_eq!(heap.get(r).unwrap(), b"hello world");
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn free_then_reuse_slot() {
        let (engine, mut alloc) = new_pair(256);
        let mut heap = Heap::create(engine);
        let r1 = heap.allocate(&mut alloc, b"first").unwrap();
        heap.free(r1).unwrap();
        let r2 = heap.allocate(&mut alloc, b"second").unwrap();
        assert_eq!(r1, r2, "freed slot in the same class should be reused");
        assert_eq!(heap.get(r2).unwrap(), b"second");
    }

    #[test]
    fn many_objects_across_slabs() {
        let (engine, mut alloc) = new_pair(128);
        let mut heap = Heap::create(engine);
        let mut refs = Vec::new();
        for i in 0..100u32 {
            let bytes = format!("object-{}", i).into_bytes();
            refs.push((i, heap.allocate(&mut alloc, &bytes).unwrap()));
        }
        for (i, r) in refs {
            assert_eq!(heap.get(r).unwrap(), format!("object-{}", i).into_bytes());
        }
    }

    #[test]
    fn oversized_object_is_rejected() {
        let (engine, mut alloc) = new_pair(64);
        let mut heap = Heap::create(engine);
        let huge = vec![0u8; 1000];
        assert!(heap.allocate(&mut alloc, &huge).is_err());
    }
}
