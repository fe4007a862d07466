//! # mapped-segment: memory-mapped append files for log and segment stores
//!
//! A [`MappedFile`] is one preallocated file, mapped into memory, appended to
//! by a single writer while any number of readers read what has been
//! committed so far. It is the storage primitive under a write-ahead log or a
//! message segment; record framing, indexing and multi-file management belong
//! to the caller.
//!
//! ## Features
//!
//! - **Three write targets**: a pooled write buffer, the writable mapping, or
//!   the file descriptor, chosen once at open time
//! - **Commit protocol**: buffered bytes are invisible to readers until
//!   committed; descriptor-mode commits retry instead of dropping data
//! - **Concurrent reads**: bounded reads never wait on writers, only on remaps
//! - **Resize / shrink**: truncate and remap without tearing in-flight reads
//! - **Pluggable collaborators**: mapping facade, buffer pool and retry policy
//!   are injected, so failures can be simulated
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mapped_segment::{MappedFile, VecPool, WriteMode};
//!
//! let pool = Arc::new(VecPool::default());
//! let seg = MappedFile::create("00000000.seg", 1 << 20, WriteMode::Mapped, Some(pool))?;
//!
//! seg.write(b"record-1")?;
//! seg.commit()?;
//!
//! let mut buf = [0u8; 8];
//! seg.read(0, &mut buf)?;
//!
//! // Seal: drop the preallocated tail and hand the buffer back.
//! seg.done_write()?;
//! seg.shrink()?;
//! seg.close()?;
//! # Ok::<(), mapped_segment::MappedFileError>(())
//! ```
//!
//! ## Modules
//!
//! - [`errors`]: error type and result alias
//! - [`mmap`]: [`MappedFile`] lifecycle, reads, resize and sync
//! - [`mapping`]: mapping facade and its OS implementation
//! - [`pool`]: write buffer pools
//! - [`retry`]: commit retry policy
//! - [`builder`]: open options
//! - [`view`]: lock-holding read views
//! - [`manager`]: convenience functions
//! - [`utils`]: page size and range checks
//!
//! ## Feature Flags
//!
//! - `async`: Tokio helpers for creating files and committing off the async threads

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(missing_docs)]

pub mod builder;
pub mod errors;
mod lock;
pub mod manager;
pub mod mapping;
pub mod mmap;
pub mod pool;
pub mod retry;
pub mod utils;
pub mod view;
mod write;

pub use builder::MappedFileBuilder;
pub use errors::{MappedFileError, Result};
pub use manager::{create_file, open_file, remove_file};
pub use mapping::{Mapper, OsMapper, Region};
pub use mmap::{MappedFile, OpenMode, WriteMode};
pub use pool::{BufferPool, VecPool};
pub use retry::{retry_until_success, CancelToken, RetryExhausted, RetryPolicy};
pub use view::{MappedBytes, ReadGuard};
