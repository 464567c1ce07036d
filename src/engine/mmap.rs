//! The memory-map backend: maps the file in large fixed-size chunks and
//! serves reads/writes as ordinary memory accesses.
//!
//! Grounded in the teacher crate's own virtual-mapping cache (`cache.rs` /
//! `infra.rs`): the same `RawFile` / `RawView` primitives defined in `os`
//! (`unix.rs` / `windows.rs`) are reused here, just addressed in blocks
//! instead of arbitrary byte ranges, and chunked at the size the
//! specification mandates rather than a user-tunable cache block size.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use log::{debug, trace};

use crate::address::BlockIndex;
use crate::error::{Error, Result};
use crate::os;

use super::{BlockHandle, BufferInner, Engine};

#[cfg(target_pointer_width = "64")]
const CHUNK_SIZE: usize = 1024 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
const CHUNK_SIZE: usize = 128 * 1024 * 1024;

/// Maps a file in `CHUNK_SIZE`-sized pieces and hands out block-sized
/// copies backed by those mappings. Copies (rather than raw pointers) keep
/// the handle type uniform across all three backends; see `DESIGN.md` for
/// the tradeoff.
pub struct MmapEngine {
    raw: os::RawFile,
    block_size: u32,
    chunks: Vec<Option<os::RawView>>,
    cache: HashMap<BlockIndex, Rc<std::cell::RefCell<BufferInner>>>,
}

impl MmapEngine {
    /// Opens (creating if necessary) a memory-mapped store at `path` with
    /// the given block size and an initial file size of `initial_blocks`
    /// blocks (at least 1).
    pub fn create(path: &Path, block_size: u32, initial_blocks: u64) -> Result<Self> {
        if block_size < 64 || (block_size & (block_size - 1)) != 0 {
            return Err(Error::bad_argument(format!(
                "block size {} must be a power of two >= 64",
                block_size
            )));
        }
        let blocks = std::cmp::max(1, initial_blocks);
        let len = blocks as usize * block_size as usize;
        let raw = os::RawFile::open_writable(path, len)
            .map_err(|e| Error::io("mapping file for writing", e))?;
        let mut engine = MmapEngine {
            raw,
            block_size,
            chunks: Vec::new(),
            cache: HashMap::new(),
        };
        engine.ensure_chunk_slots();
        Ok(engine)
    }

    fn chunk_count(&self) -> usize {
        (self.raw.len() + CHUNK_SIZE - 1) / CHUNK_SIZE
    }

    fn ensure_chunk_slots(&mut self) {
        let needed = self.chunk_count();
        while self.chunks.len() < needed {
            self.chunks.push(None);
        }
    }

    fn chunk(&mut self, chunk_index: usize) -> Result<&os::RawView> {
        if self.chunks[chunk_index].is_none() {
            let offset = chunk_index * CHUNK_SIZE;
            let len = std::cmp::min(CHUNK_SIZE, self.raw.len() - offset);
            trace!("mapping chunk {} ({} bytes at {})", chunk_index, len, offset);
            let view = self
                .raw
                .view(offset, len, true)
                .map_err(|e| Error::io("mmap chunk", e))?;
            self.chunks[chunk_index] = Some(view);
        }
        Ok(self.chunks[chunk_index].as_ref().unwrap())
    }

    fn block_ptr(&mut self, index: BlockIndex) -> Result<*mut u8> {
        let byte_off = index.value() as usize * self.block_size as usize;
        let chunk_index = byte_off / CHUNK_SIZE;
        let within = byte_off % CHUNK_SIZE;
        let view = self.chunk(chunk_index)?;
        // SAFETY: `within + block_size` stays within the chunk's mapped
        // length because blocks never straddle a chunk boundary (chunk
        // sizes are large powers of two, block sizes are small powers of
        // two that divide them).
        Ok(unsafe { (view.as_ptr() as *mut u8).add(within) })
    }

    fn copy_from_mapping(&mut self, index: BlockIndex) -> Result<Vec<u8>> {
        let block_size = self.block_size as usize;
        let ptr = self.block_ptr(index)?;
        let mut buf = vec![0u8; block_size];
        // SAFETY: `ptr` points at `block_size` valid, mapped bytes (see
        // `block_ptr`); source and destination do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), block_size);
        }
        Ok(buf)
    }

    fn insert(&mut self, index: BlockIndex, data: Vec<u8>, dirty: bool) -> BlockHandle {
        let buffer = Rc::new(std::cell::RefCell::new(BufferInner {
            index,
            data,
            dirty,
        }));
        self.cache.insert(index, buffer.clone());
        BlockHandle::from_rc(buffer)
    }

    fn prune_unpinned(&mut self) {
        self.cache.retain(|_, buf| Rc::strong_count(buf) > 1);
    }
}

impl Engine for MmapEngine {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn size(&self) -> Result<u64> {
        Ok(self.raw.len() as u64 / self.block_size as u64)
    }

    fn grow(&mut self, n: u64) -> Result<()> {
        let new_len = self.raw.len() + n as usize * self.block_size as usize;
        debug!("growing mmap file to {} bytes", new_len);
        self.raw
            .resize(new_len)
            .map_err(|e| Error::io("growing mmap file", e))?;
        // The last chunk's mapping may now be shorter than what is
        // actually backing it; drop it so it is remapped at full size on
        // next access. Interior chunks are always already full-sized.
        if let Some(last) = self.chunks.last_mut() {
            *last = None;
        }
        self.ensure_chunk_slots();
        Ok(())
    }

    fn read(&mut self, index: BlockIndex) -> Result<BlockHandle> {
        if let Some(buffer) = self.cache.get(&index) {
            return Ok(BlockHandle::from_rc(buffer.clone()));
        }
        let data = self.copy_from_mapping(index)?;
        Ok(self.insert(index, data, false))
    }

    fn overwrite_zero(&mut self, index: BlockIndex) -> Result<BlockHandle> {
        if let Some(buffer) = self.cache.get(&index).cloned() {
            let mut inner = buffer.borrow_mut();
            for byte in inner.data.iter_mut() {
                *byte = 0;
            }
            inner.dirty = true;
            drop(inner);
            return Ok(BlockHandle::from_rc(buffer));
        }
        let data = vec![0u8; self.block_size as usize];
        Ok(self.insert(index, data, true))
    }

    fn overwrite(&mut self, index: BlockIndex, data: &[u8]) -> Result<BlockHandle> {
        if data.len() != self.block_size as usize {
            return Err(Error::bad_argument("overwrite data length must equal block size"));
        }
        if let Some(buffer) = self.cache.get(&index).cloned() {
            let mut inner = buffer.borrow_mut();
            inner.data.copy_from_slice(data);
            inner.dirty = true;
            drop(inner);
            return Ok(BlockHandle::from_rc(buffer));
        }
        Ok(self.insert(index, data.to_vec(), true))
    }

    fn flush(&mut self) -> Result<()> {
        let dirty: Vec<BlockIndex> = self
            .cache
            .iter()
            .filter(|(_, b)| b.borrow().dirty)
            .map(|(i, _)| *i)
            .collect();

        for index in dirty {
            let bytes = self.cache.get(&index).unwrap().borrow().data.clone();
            let ptr = self.block_ptr(index)?;
            // SAFETY: see `copy_from_mapping`; this is the reverse copy.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            }
            self.cache.get(&index).unwrap().borrow_mut().dirty = false;
        }

        for chunk in self.chunks.iter().flatten() {
            chunk.flush().map_err(|e| Error::io("msync", e))?;
        }

        self.prune_unpinned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_through_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let mut engine = MmapEngine::create(&path, 4096, 4).unwrap();

        for i in 0..4u64 {
            let h = engine.overwrite_zero(BlockIndex::new(i)).unwrap();
            h.writable_data()[0] = i as u8 + 1;
        }
        engine.flush().unwrap();

        for i in 0..4u64 {
            let h = engine.read(BlockIndex::new(i)).unwrap();
            assert_eq!(h.data()[0], i as u8 + 1);
        }
    }

    #[test]
    fn grow_then_write_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let mut engine = MmapEngine::create(&path, 4096, 1).unwrap();
        engine.grow(3).unwrap();
        assert_eq!(engine.size().unwrap(), 4);

        let h = engine.overwrite_zero(BlockIndex::new(3)).unwrap();
        h.writable_data()[0] = 77;
        engine.flush().unwrap();

        let h2 = engine.read(BlockIndex::new(3)).unwrap();
        assert_eq!(h2.data()[0], 77);
    }
}
