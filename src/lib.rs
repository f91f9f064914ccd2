//! # Blockfile cache
//!
//! A persistent, on-disk object cache that stores opaque byte streams keyed
//! by arbitrary strings, backed by a custom block-file container format.
//!
//! ## Design constraints
//!
//! These invariants are the groundwork for keeping the design simple and the
//! on-disk state recoverable:
//! - records up to 16 KiB live in block files; larger streams get a
//!   dedicated external file
//! - block files hold fixed-size slots of one of four sizes (36 B, 256 B,
//!   1 KiB, 4 KiB); allocations take 1 to 4 contiguous slots and never
//!   cross a 4-slot group
//! - all structural records carry a 32-bit self-hash over their fixed prefix
//! - every list mutation is bracketed by a transaction record in the index
//!   header, so a crash mid-mutation is recoverable at the next open
//! - one background thread owns all mutable state; callers talk to it
//!   through an operation queue and never need a lock
//! - endianness of the files is based on the host system (cache directories
//!   do not migrate between systems of different endianness)
//!
//! ## On-disk layout
//!
//! A cache directory holds one `index` file (header, eviction control data,
//! and a hash table mapping key hashes to entry addresses), block files
//! `data_0` through `data_255` (four size classes at fixed positions, chain
//! extensions after that), and `f_<hex>` external files for large streams.
//!
//! Entries are records in the 256-byte class: key, state, and addresses of
//! up to three user data streams. The frequently-updated part of an entry
//! (timestamps, LRU linkage, the dirty-run marker) lives in a separate
//! 36-byte rankings node so that touching an entry never rewrites the whole
//! record. Eviction walks up to five doubly-linked lists threaded through
//! those nodes.
//!
//! ## Usage
//!
//! ```no_run
//! use blockfile_cache::{CacheBackend, CacheConfigBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfigBuilder::from_path("/tmp/my-cache")
//!     .max_size(80 * 1024 * 1024)
//!     .build()?;
//! let cache = CacheBackend::open(config).await?;
//!
//! let entry = cache.create_entry("https://example.com/logo.png").await?;
//! entry.write_data(0, 0, b"response headers", false).await?;
//! entry.write_data(1, 0, b"payload bytes", false).await?;
//! entry.close();
//!
//! let entry = cache.open_entry("https://example.com/logo.png").await?;
//! let payload = entry.read_data(1, 0, 1024).await?;
//! # drop(payload);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod addr;
mod backend;
mod bitmap;
mod block_files;
pub mod config;
mod entry;
mod error;
mod eviction;
mod format;
mod in_flight;
mod io;
mod rankings;
mod sparse;
mod stats;
mod storage;

#[cfg(test)]
mod tests;

pub use config::{CacheConfig, CacheConfigBuilder, CacheType};
pub use error::{CacheError, Result};
pub use in_flight::{CacheBackend, CacheIterator, EntryHandle};
