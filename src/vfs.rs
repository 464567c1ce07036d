//! The virtual-filesystem interface consumed by the storage engine.
//!
//! Per the specification this collaborator is specified only at its
//! interface: positional read/write, truncate, sync, and an optional
//! `mmap` primitive. [`OsFile`] implements it on top of `std::fs::File`;
//! [`MemoryFile`] is an in-memory mock used by the test suite, playing the
//! role a temp-file fixture would play in the teacher crate's own tests.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use crate::error::{Error, Result};

/// How a file should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file for reading and writing, creating it if it
    /// does not exist.
    ReadWrite,
    /// Open an existing file for reading only.
    ReadOnly,
}

/// A handle to persistent storage, abstracting over the filesystem calls
/// the engine needs. Implementations need not be thread-safe; the crate's
/// concurrency model assumes single-owner access (§5).
pub trait VfsFile {
    /// Blocking positional read. `buf.len()` bytes are read starting at
    /// `offset`; short reads past the end of the file are an error.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Blocking positional write, extending the file if `offset + buf.len()`
    /// exceeds the current size.
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Current size of the file, in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Truncates or extends the file to exactly `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Flushes any buffered writes and asks the OS to persist them.
    fn sync(&mut self) -> Result<()>;
}

/// Factory for [`VfsFile`] instances. Mirrors `vfs::open` /
/// `vfs::create_temp` from the external interface.
pub trait Vfs {
    /// The concrete file type this VFS produces.
    type File: VfsFile;

    /// Opens `path` in the given mode.
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::File>;

    /// Creates a new anonymous temporary file that disappears once closed.
    fn create_temp(&self) -> Result<Self::File>;
}

/// A [`Vfs`] backed by the real operating system filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsVfs;

impl Vfs for OsVfs {
    type File = OsFile;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<OsFile> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::ReadWrite => {
                options.read(true).write(true).create(true);
            }
            OpenMode::ReadOnly => {
                options.read(true);
            }
        }
        let file = options
            .open(path)
            .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
        Ok(OsFile { file })
    }

    fn create_temp(&self) -> Result<OsFile> {
        let file = tempfile_handle()?;
        Ok(OsFile { file })
    }
}

#[cfg(unix)]
fn tempfile_handle() -> Result<std::fs::File> {
    use std::env;
    use std::ffi::CString;
    use std::os::unix::io::FromRawFd;

    let dir = env::temp_dir();
    let template = dir.join("prequel-XXXXXX");
    let cstr = CString::new(template.as_os_str().to_string_lossy().into_owned())
        .map_err(|e| Error::io_msg(e))?;
    let mut bytes = cstr.into_bytes_with_nul();
    let fd = unsafe { libc::mkstemp(bytes.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(Error::io("mkstemp", io::Error::last_os_error()));
    }
    // Unlink immediately: the descriptor stays valid until closed, the
    // directory entry disappears right away.
    unsafe {
        libc::unlink(bytes.as_ptr() as *const libc::c_char);
        Ok(std::fs::File::from_raw_fd(fd))
    }
}

#[cfg(windows)]
fn tempfile_handle() -> Result<std::fs::File> {
    use std::env;

    let mut path = env::temp_dir();
    let unique = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    path.push(format!("prequel-{:x}", unique));
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(|e| Error::io("creating temp file", e))
}

/// A [`VfsFile`] backed by a real `std::fs::File`.
pub struct OsFile {
    file: std::fs::File,
}

#[cfg(unix)]
impl VfsFile for OsFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::io("reading file", e))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::io("writing file", e))
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| Error::io("stat file", e))?
            .len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|e| Error::io("truncating file", e))
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::io("fsync", e))
    }
}

#[cfg(windows)]
impl VfsFile for OsFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io("seeking file", e))?;
        self.file
            .read_exact(buf)
            .map_err(|e| Error::io("reading file", e))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io("seeking file", e))?;
        self.file
            .write_all(buf)
            .map_err(|e| Error::io("writing file", e))
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| Error::io("stat file", e))?
            .len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|e| Error::io("truncating file", e))
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::io("fsync", e))
    }
}

/// An in-memory [`VfsFile`] used by the test suite.
#[derive(Debug, Default)]
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        MemoryFile { data: Vec::new() }
    }
}

impl VfsFile for MemoryFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = offset as usize;
        if offset + buf.len() > self.data.len() {
            return Err(Error::io_msg("read past end of memory file"));
        }
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.data.resize(size as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [`Vfs`] that hands out independent [`MemoryFile`]s; used by tests that
/// do not need persistence across process restarts.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryVfs;

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn open(&self, _path: &Path, _mode: OpenMode) -> Result<MemoryFile> {
        Ok(MemoryFile::new())
    }

    fn create_temp(&self) -> Result<MemoryFile> {
        Ok(MemoryFile::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_file_read_write() {
        let mut f = MemoryFile::new();
        f.write(0, b"hello").unwrap();
        f.write(5, b" world").unwrap();
        assert_eq!(f.file_size().unwrap(), 11);
        let mut buf = [0u8; 11];
        f.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn memory_file_truncate() {
        let mut f = MemoryFile::new();
        f.write(0, b"hello").unwrap();
        f.truncate(2).unwrap();
        assert_eq!(f.file_size().unwrap(), 2);
        f.truncate(5).unwrap();
        let mut buf = [0u8; 5];
        f.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"he\0\0\0");
    }
}
