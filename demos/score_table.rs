//! Tracks per-player high scores in an on-disk Robin Hood hash table,
//! demonstrating growth, lookup and removal against a real file.
//!
//! Run with `cargo run --example score_table`.

use std::cell::RefCell;
use std::rc::Rc;

use prequel::container::HashTable;
use prequel::container::hash_table::HashTableAnchor;
use prequel::engine::BufferedEngine;
use prequel::format::Format;
use prequel::serialize::StaticLayout;
use prequel::vfs::{OpenMode, OsVfs, Vfs};

const MAGIC: &[u8] = b"prequel-scores";

fn main() -> prequel::Result<()> {
    let path = std::env::temp_dir().join("prequel-score-table-demo.bin");
    let file = OsVfs.open(&path, OpenMode::ReadWrite)?;
    let engine = Rc::new(RefCell::new(BufferedEngine::new(file, 4096, 64)?));
    let mut format = Format::create(engine.clone(), MAGIC, HashTableAnchor::SIZE as u32)?;

    let mut scores: HashTable<u32, u32, _> = HashTable::create(engine);
    for player in 0..200u32 {
        scores.insert(format.allocator(), player, player * 7 % 1000)?;
    }

    let previous = scores.insert(format.allocator(), 42, 9999)?;
    println!("player 42's previous score was {:?}, now 9999", previous);

    scores.remove(&7)?;
    assert_eq!(scores.get(&7)?, None);
    assert_eq!(scores.len(), 199);

    format.set_user_data(&scores.anchor().to_bytes())?;
    format.flush()?;
    println!("persisted {} scores to {}", scores.len(), path.display());

    std::fs::remove_file(&path).ok();
    Ok(())
}
