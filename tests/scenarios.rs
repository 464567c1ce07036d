//! End-to-end scenarios exercising the crate through real, OS-backed
//! files rather than the in-memory mock used by the unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use prequel::allocator::DefaultAllocator;
use prequel::binary_format;
use prequel::btree::{BTree, BTreeSpec, BulkLoader};
use prequel::engine::BufferedEngine;
use prequel::format::Format;
use prequel::serialize::StaticLayout;
use prequel::vfs::{OpenMode, OsVfs, Vfs};

binary_format! {
    struct CounterAnchor {
        counter: u64,
    }
}

fn open_engine(
    path: &std::path::Path,
    block_size: u32,
    cache_size: usize,
) -> Rc<RefCell<BufferedEngine<prequel::vfs::OsFile>>> {
    let file = OsVfs.open(path, OpenMode::ReadWrite).unwrap();
    Rc::new(RefCell::new(BufferedEngine::new(file, block_size, cache_size).unwrap()))
}

/// Scenario 1: a fresh file's anchor round-trips across a reopen.
#[test]
fn fresh_file_anchor_round_trips_through_reopen() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();

    {
        let engine = open_engine(&path, 4096, 64);
        let mut format = Format::create(engine, b"scenario-1", CounterAnchor::SIZE as u32).unwrap();
        format.set_user_data(&CounterAnchor { counter: 0 }.to_bytes()).unwrap();
        format.flush().unwrap();
    }
    {
        let engine = open_engine(&path, 4096, 64);
        let format = Format::open(engine, b"scenario-1").unwrap();
        let anchor = CounterAnchor::read_layout(format.user_data());
        assert_eq!(anchor.counter, 0);
    }
}

/// Scenario 2: best-fit reuse of an exactly-sized freed extent.
#[test]
fn allocator_best_fit_reuses_freed_extent() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let engine = open_engine(tmp.path(), 256, 64);
    let mut format = Format::create(engine, b"scenario-2", 0).unwrap();
    let alloc = format.allocator();

    let _a = alloc.allocate(1).unwrap();
    let b = alloc.allocate(4).unwrap();
    let _c = alloc.allocate(1).unwrap();
    alloc.free(b, 4).unwrap();
    let d = alloc.allocate(4).unwrap();

    assert_eq!(d, b, "freed extent should be reused exactly");
    assert_eq!(alloc.stats().used, 6, "three live allocations of sizes 1, 1, 4");
    alloc.validate().unwrap();
}

#[derive(Clone, Copy)]
struct I32Spec;

impl BTreeSpec for I32Spec {
    type Value = i32;
    type Key = i32;

    fn key_of(value: &i32) -> i32 {
        *value
    }
}

struct TreeAllocator<'a> {
    alloc: &'a mut DefaultAllocator<BufferedEngine<prequel::vfs::OsFile>>,
}

impl<'a> prequel::btree::BlockAllocator for TreeAllocator<'a> {
    fn allocate_block(&mut self) -> prequel::Result<prequel::address::BlockIndex> {
        self.alloc.allocate(1)
    }

    fn free_block(&mut self, index: prequel::address::BlockIndex) -> prequel::Result<()> {
        self.alloc.free(index, 1)
    }
}

/// Scenario 3: a small tree's insertions and in-order traversal.
#[test]
fn small_btree_insert_and_traverse() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let engine = open_engine(tmp.path(), 512, 64);
    let mut format = Format::create(engine.clone(), b"scenario-3", 0).unwrap();

    let mut tree = {
        let alloc = TreeAllocator { alloc: format.allocator() };
        BTree::<I32Spec, _, _>::new(engine, alloc, prequel::btree::BTreeAnchor::empty())
    };

    let input = [5, 2, 9, 1, 5, 7];
    let inserted: Vec<bool> = input.iter().map(|&v| tree.insert(v).unwrap()).collect();
    assert_eq!(inserted, vec![true, true, true, true, false, true]);
    assert_eq!(tree.len(), 5);

    let mut cursor = tree.cursor_at_min().unwrap();
    let mut seen = Vec::new();
    while cursor.is_valid() {
        seen.push(tree.get(&cursor).unwrap());
        tree.move_next(&cursor).unwrap();
    }
    assert_eq!(seen, vec![1, 2, 5, 7, 9]);
}

/// Scenario 4: a tree with height >= 3, erase every third value.
#[test]
fn large_btree_erase_every_third() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let engine = open_engine(tmp.path(), 96, 256);
    let mut format = Format::create(engine.clone(), b"scenario-4", 0).unwrap();

    let n = 10_000i32;
    let mut tree = {
        let alloc = TreeAllocator { alloc: format.allocator() };
        BTree::<I32Spec, _, _>::new(engine, alloc, prequel::btree::BTreeAnchor::empty())
    };
    for i in 0..n {
        tree.insert(i).unwrap();
    }

    for i in (0..n).step_by(3) {
        assert!(tree.remove(i).unwrap());
    }

    let expected_size = (0..n).filter(|i| i % 3 != 0).count() as u64;
    assert_eq!(tree.len(), expected_size);

    let mut cursor = tree.cursor_at_min().unwrap();
    let mut seen = Vec::new();
    while cursor.is_valid() {
        seen.push(tree.get(&cursor).unwrap());
        tree.move_next(&cursor).unwrap();
    }
    let expected: Vec<i32> = (0..n).filter(|i| i % 3 != 0).collect();
    assert_eq!(seen, expected);
}

/// Scenario 5: the buffered engine with a small cache keeps each block's
/// contents durable through a flush and through eviction pressure.
#[test]
fn buffered_engine_small_cache_preserves_every_block() {
    use prequel::address::BlockIndex;
    use prequel::engine::Engine;

    let tmp = tempfile::NamedTempFile::new().unwrap();
    {
        let mut engine = BufferedEngine::new(
            OsVfs.open(tmp.path(), OpenMode::ReadWrite).unwrap(),
            256,
            2,
        )
        .unwrap();
        engine.grow(10).unwrap();
        for i in 0..10u64 {
            let handle = engine.overwrite_zero(BlockIndex::new(i)).unwrap();
            handle.writable_data()[0] = i as u8;
        }
        engine.flush().unwrap();
    }
    {
        let mut engine = BufferedEngine::new(
            OsVfs.open(tmp.path(), OpenMode::ReadWrite).unwrap(),
            256,
            2,
        )
        .unwrap();
        for i in 0..10u64 {
            let handle = engine.read(BlockIndex::new(i)).unwrap();
            assert_eq!(handle.data()[0], i as u8);
        }
    }
}

/// Scenario 6: bulk-loading a large pre-sorted run produces a valid tree
/// whose traversal matches the input exactly.
#[test]
fn bulk_load_one_hundred_thousand_values() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let engine = open_engine(tmp.path(), 4096, 256);
    let mut format = Format::create(engine.clone(), b"scenario-6", 0).unwrap();

    let n = 100_000i32;
    let anchor = {
        let alloc = TreeAllocator { alloc: format.allocator() };
        let mut loader: BulkLoader<I32Spec, _, _> = BulkLoader::new(engine.clone(), alloc);
        for i in 0..n {
            loader.push(i);
        }
        loader.finish().unwrap()
    };
    assert_eq!(anchor.size(), n as u64);

    let mut tree = {
        let alloc = TreeAllocator { alloc: format.allocator() };
        BTree::<I32Spec, _, _>::new(engine, alloc, anchor)
    };
    assert_eq!(tree.len(), n as u64);

    let mut cursor = tree.cursor_at_min().unwrap();
    let mut seen = Vec::with_capacity(n as usize);
    while cursor.is_valid() {
        seen.push(tree.get(&cursor).unwrap());
        tree.move_next(&cursor).unwrap();
    }
    assert_eq!(seen, (0..n).collect::<Vec<_>>());
}
