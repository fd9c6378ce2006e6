//! Embedded persistent key-value store built on a log-structured merge
//! tree: a lock-free in-memory write buffer, a write-ahead log for
//! durability, and immutable sorted table files on disk.

#[macro_use]
pub mod error;

pub mod bloom;
pub mod config;
pub mod memtable;
pub mod sstable;
pub mod store;
pub mod tmpfs;
pub mod wal;

pub use config::{MemtableOptions, SstOptions, StoreOptions, WalOptions};
pub use error::{Error, Result};
pub use store::Store;
