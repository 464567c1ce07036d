//! A persistent, block-addressable storage substrate for building
//! file-backed data structures larger than comfortably fits in memory.
//!
//! *prequel* opens a file (or an in-memory stand-in, for tests) and
//! layers three things on top of it: a cache of pinned, dirty-trackable
//! block buffers (the [`engine`] module, with buffered, memory-mapped and
//! transactional backends behind a common [`engine::Engine`] trait), a
//! compile-time-reflected binary serialization scheme for fixed-size
//! on-disk structs ([`serialize`]), and a best-fit block [`allocator`]
//! built on a generic on-disk [`btree`]. [`extent`] and [`array`] give
//! contiguous and growable fixed-size-element storage over the
//! allocator, and [`container`] builds a linked list, a stack, a
//! segregated-free-list heap and a Robin Hood hash table on top of
//! those. [`format`] ties it all together as a single file with a
//! versioned master block.
//!
//! *CAUTION:* several backends use unsafe, OS-specific memory-mapping
//! APIs. Do not use this where animals may be harmed. Any help with
//! testing and reviewing is much appreciated.
//!
//! Supported platforms (as far as a small bunch of tests indicate):
//!
//! * Linux
//! * MacOS
//! * Windows
//!
//! Dual-licensed under MIT and [UNLICENSE](https://unlicense.org/).
//!
//! # Usage
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use prequel::engine::BufferedEngine;
//! use prequel::format::Format;
//! use prequel::vfs::{MemoryFile, MemoryVfs, Vfs, OpenMode};
//!
//! let file = MemoryVfs.open(std::path::Path::new("ignored"), OpenMode::ReadWrite).unwrap();
//! let engine = Rc::new(RefCell::new(BufferedEngine::new(file, 4096, 64).unwrap()));
//! let mut format = Format::create(engine, b"PREQ", 0).unwrap();
//! let block = format.allocator().allocate(1).unwrap();
//! format.allocator().free(block, 1).unwrap();
//! format.flush().unwrap();
//! ```
//!
//! # Errors
//!
//! Every fallible operation returns [`error::Result`]; the only panics
//! are precondition violations on malformed caller input to low-level
//! serialization helpers, documented where they occur, and
//! `debug_assert!`-guarded internal invariants that are compiled out of
//! release builds.
//!
//! # Concurrency
//!
//! Single-threaded, cooperative, no internal synchronization. An
//! [`engine::Engine`] and everything built on it assumes single-owner
//! access; share a store across threads the way you would share a
//! `RefCell`, which is to say: don't, without your own locking on top.
//!
//! # Name
//!
//! A prequel sets up the world a later story takes place in. This crate
//! is the storage substrate other data structures are built on top of:
//! it comes first.

#![deny(missing_docs)]

pub mod address;
pub mod allocator;
pub mod anchor;
pub mod array;
pub mod btree;
pub mod container;
pub mod engine;
pub mod error;
pub mod extent;
pub mod format;
pub mod serialize;
pub mod vfs;

mod ext;
mod os;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use error::{Error, Result};
