//! Appends a run of integers to a growable on-disk array, closes the
//! store, reopens it through a fresh engine, and reads them back.
//!
//! Run with `cargo run --example append_log`.

use std::cell::RefCell;
use std::rc::Rc;

use prequel::array::{Array, ArrayAnchor, GrowthPolicy};
use prequel::engine::BufferedEngine;
use prequel::format::Format;
use prequel::serialize::StaticLayout;
use prequel::vfs::{OpenMode, OsVfs, Vfs};

const MAGIC: &[u8] = b"prequel-log";

fn main() -> prequel::Result<()> {
    let path = std::env::temp_dir().join("prequel-append-log-demo.bin");

    {
        let file = OsVfs.open(&path, OpenMode::ReadWrite)?;
        let engine = Rc::new(RefCell::new(BufferedEngine::new(file, 4096, 64)?));
        let mut format = Format::create(engine.clone(), MAGIC, ArrayAnchor::SIZE as u32)?;

        let mut log: Array<u64, _> = Array::create(engine, GrowthPolicy::Exponential);
        for i in 0..1000u64 {
            log.push_back(format.allocator(), i * i)?;
        }
        format.set_user_data(&log.anchor().to_bytes())?;
        format.flush()?;
        println!("wrote {} values to {}", log.len(), path.display());
    }

    {
        let file = OsVfs.open(&path, OpenMode::ReadWrite)?;
        let engine = Rc::new(RefCell::new(BufferedEngine::new(file, 4096, 64)?));
        let format = Format::open(engine.clone(), MAGIC)?;
        let anchor = ArrayAnchor::read_layout(format.user_data());
        let mut log: Array<u64, _> = Array::open(engine, anchor, GrowthPolicy::Exponential);

        assert_eq!(log.len(), 1000);
        println!("log[500] = {}", log.get(500)?);
    }

    std::fs::remove_file(&path).ok();
    Ok(())
}
