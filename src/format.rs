//! The file's master block: a fixed-size header occupying block 0,
//! carrying the format version, block size, a caller-chosen magic tag,
//! the default allocator's anchor, and a caller-sized slab of opaque
//! root bytes every other container's anchor ultimately lives in.

use std::cell::RefCell;
use std::rc::Rc;

use crate::address::BlockIndex;
use crate::allocator::{AllocatorAnchor, DefaultAllocator};
use crate::binary_format;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::serialize::StaticLayout;

/// Maximum length of the user-supplied magic tag.
pub const MAGIC_SIZE: usize = 20;

/// Current on-disk format version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

const MASTER_BLOCK: BlockIndex = BlockIndex::new(0);

binary_format! {
    /// Fixed-size prefix of the master block, immediately followed by
    /// `user_data_size` bytes of caller-defined root state.
    pub struct FormatHeader {
        magic: [u8; MAGIC_SIZE],
        version: u32,
        flags: u8,
        block_size: u32,
        user_data_size: u32,
        allocator: AllocatorAnchor,
    }
}

fn pad_magic(magic: &[u8]) -> Result<[u8; MAGIC_SIZE]> {
    if magic.len() > MAGIC_SIZE {
        return Err(Error::bad_argument(format!(
            "magic tag of {} bytes exceeds the {}-byte limit",
            magic.len(),
            MAGIC_SIZE
        )));
    }
    let mut padded = [0u8; MAGIC_SIZE];
    padded[..magic.len()].copy_from_slice(magic);
    Ok(padded)
}

/// Owns the file's master block (block 0): the format header, the
/// default allocator every other container's blocks are drawn from, and
/// a slab of opaque user root bytes (typically another container's own
/// anchor, serialized by the caller).
pub struct Format<E: Engine> {
    engine: Rc<RefCell<E>>,
    magic: [u8; MAGIC_SIZE],
    flags: u8,
    user_data_size: u32,
    allocator: DefaultAllocator<E>,
    user_data: Vec<u8>,
}

impl<E: Engine> Format<E> {
    /// Initializes a fresh master block, growing the file by one block if
    /// it is currently empty. `user_data_size` bytes are reserved after
    /// the header for caller-defined root state, initially zeroed.
    pub fn create(engine: Rc<RefCell<E>>, magic: &[u8], user_data_size: u32) -> Result<Self> {
        let padded_magic = pad_magic(magic)?;
        let block_size = engine.borrow().block_size();
        let header_size = FormatHeader::SIZE as u32;
        if header_size + user_data_size > block_size {
            return Err(Error::bad_argument(format!(
                "header ({} bytes) plus user data ({} bytes) does not fit in a {}-byte block",
                header_size, user_data_size, block_size
            )));
        }
        let needs_growth = engine.borrow().size()? == 0;
        if needs_growth {
            engine.borrow_mut().grow(1)?;
        }
        let allocator = DefaultAllocator::create(engine.clone());
        let mut format = Format {
            engine,
            magic: padded_magic,
            flags: 0,
            user_data_size,
            allocator,
            user_data: vec![0u8; user_data_size as usize],
        };
        format.write_header()?;
        Ok(format)
    }

    /// Reads the master block of a previously created file, validating
    /// the magic tag and block size.
    pub fn open(engine: Rc<RefCell<E>>, expected_magic: &[u8]) -> Result<Self> {
        let expected = pad_magic(expected_magic)?;
        let block_size = engine.borrow().block_size();
        let header = {
            let handle = engine.borrow_mut().read(MASTER_BLOCK)?;
            let data = handle.data();
            FormatHeader::read_layout(&data[0..FormatHeader::SIZE])
        };
        if header.magic != expected {
            return Err(Error::corruption("master block magic tag does not match"));
        }
        if header.block_size != block_size {
            return Err(Error::corruption(format!(
                "file block size {} does not match engine block size {}",
                header.block_size, block_size
            )));
        }
        let user_data = {
            let handle = engine.borrow_mut().read(MASTER_BLOCK)?;
            let data = handle.data();
            let start = FormatHeader::SIZE;
            let end = start + header.user_data_size as usize;
            data[start..end].to_vec()
        };
        let allocator = DefaultAllocator::open(engine.clone(), header.allocator);
        Ok(Format {
            engine,
            magic: header.magic,
            flags: header.flags,
            user_data_size: header.user_data_size,
            allocator,
            user_data,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let header = FormatHeader {
            magic: self.magic,
            version: FORMAT_VERSION,
            flags: self.flags,
            block_size: self.engine.borrow().block_size(),
            user_data_size: self.user_data_size,
            allocator: self.allocator.anchor(),
        };
        let handle = self.engine.borrow_mut().overwrite_zero(MASTER_BLOCK)?;
        let mut data = handle.writable_data();
        header.write_layout(&mut data[0..FormatHeader::SIZE]);
        let start = FormatHeader::SIZE;
        data[start..start + self.user_data.len()].copy_from_slice(&self.user_data);
        Ok(())
    }

    /// Persists the current allocator state and user root bytes to the
    /// master block and asks the engine to make them durable.
    pub fn flush(&mut self) -> Result<()> {
        self.write_header()?;
        self.engine.borrow_mut().flush()
    }

    /// Mutable access to the default allocator backing every other
    /// container reachable from this format.
    pub fn allocator(&mut self) -> &mut DefaultAllocator<E> {
        &mut self.allocator
    }

    /// The caller-defined root bytes, most recently set via
    /// [`set_user_data`](Self::set_user_data) or read back from disk.
    pub fn user_data(&self) -> &[u8] {
        &self.user_data
    }

    /// Overwrites the caller-defined root bytes. `data.len()` must equal
    /// the `user_data_size` this format was created or opened with.
    pub fn set_user_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.user_data_size as usize {
            return Err(Error::bad_argument(format!(
                "user data must be exactly {} bytes, got {}",
                self.user_data_size,
                data.len()
            )));
        }
        self.user_data.copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BufferedEngine;
    use crate::vfs::MemoryFile;

    fn new_engine(block_size: u32) -> Rc<RefCell<BufferedEngine<MemoryFile>>> {
        let file = MemoryFile::new();
        Rc::new(RefCell::new(BufferedEngine::new(file, block_size, 64).unwrap()))
    }

    #[test]
    fn create_sets_up_header_and_zeroed_user_data() {
        let engine = new_engine(256);
        let format = Format::create(engine, b"PREQ", 16).unwrap();
        assert_eq!(format.user_data(), &[0u8; 16]);
    }

    #[test]
    fn set_user_data_round_trips_through_flush_and_reopen() {
        let engine = new_engine(256);
        let mut format = Format::create(engine.clone(), b"PREQ", 8).unwrap();
        format.set_user_data(b"rootroot").unwrap();
        format.flush().unwrap();

        let reopened = Format::open(engine, b"PREQ").unwrap();
        assert_eq!(reopened.user_data(), b"rootroot");
    }

    #[test]
    fn allocator_state_survives_reopen() {
        let engine = new_engine(256);
        let mut format = Format::create(engine.clone(), b"PREQ", 0).unwrap();
        let a = format.allocator().allocate(4).unwrap();
        format.flush().unwrap();

        let mut reopened = Format::open(engine, b"PREQ").unwrap();
        let b = reopened.allocator().allocate(4).unwrap();
        assert_ne!(a, b, "both allocations should remain distinct after reopen");
        reopened.allocator().validate().unwrap();
    }

    #[test]
    fn open_rejects_mismatched_magic() {
        let engine = new_engine(256);
        Format::create(engine.clone(), b"PREQ", 0).unwrap();
        assert!(Format::open(engine, b"NOPE").is_err());
    }

    #[test]
    fn create_rejects_user_data_too_large_for_block() {
        let engine = new_engine(256);
        assert!(Format::create(engine, b"PREQ", 1000).is_err());
    }

    #[test]
    fn set_user_data_rejects_wrong_length() {
        let engine = new_engine(256);
        let mut format = Format::create(engine, b"PREQ", 8).unwrap();
        assert!(format.set_user_data(b"short").is_err());
    }
}
