//! Immutable sorted table files.
//!
//! A table file is created once from a frozen memtable and never modified
//! afterwards. Files are named by a nanosecond creation timestamp, which
//! doubles as their recency order: the store's queue keeps the newest table
//! first so lookups see the freshest value for a key.

pub mod footer;
mod reader;
mod writer;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::SstOptions;
use crate::error::Result;
use crate::memtable::Memtable;

use footer::{Footer, FOOTER_SIZE};

/// File extension for sorted table files.
pub const FILE_EXT: &str = "kvsst";

/// Handle to one immutable table file.
#[derive(Debug)]
pub struct SsTable {
    path: PathBuf,
    timestamp: u64,
    footer: Footer,
}

impl SsTable {
    /// Builds a new table file from a frozen memtable under
    /// `options.base_dir`, named by a monotonic nanosecond timestamp.
    pub fn create(options: &SstOptions, table: &Memtable) -> Result<Self> {
        options.validate()?;
        let timestamp = unique_nanos();
        let path = options.base_dir.join(format!("{timestamp}.{FILE_EXT}"));
        let footer = match writer::write_table(&path, options.max_block_size, table) {
            Ok(footer) => footer,
            Err(e) => {
                // A half-written file without a footer would poison recovery.
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };

        Ok(Self {
            path,
            timestamp,
            footer,
        })
    }

    /// Takes ownership of an existing table file, reading its footer and
    /// deriving its creation timestamp from the file name.
    pub fn open(path: &Path) -> Result<Self> {
        let timestamp = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
            .ok_or_else(|| {
                crate::error::Error::InvalidData(format!("invalid table file name: {path:?}"))
            })?;

        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE as u64 {
            return errdata!("table file {path:?} shorter than a footer");
        }
        let mut buf = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        file.read_exact(&mut buf)?;
        let footer = Footer::decode(&buf)?;

        Ok(Self {
            path: path.to_path_buf(),
            timestamp,
            footer,
        })
    }

    /// Fetches the value for a key, if present. Maps the file for the
    /// duration of the call.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        reader::lookup(&self.path, key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creation timestamp in nanoseconds; newer tables hold fresher data.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }
}

/// Returns a nanosecond timestamp that is strictly increasing across the
/// process. Tables flushed back to back therefore never collide on file
/// name, and their timestamps order exactly as their creation did.
fn unique_nanos() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    loop {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let last = LAST.load(Ordering::SeqCst);
        let next = now.max(last + 1);
        if LAST
            .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return next;
        }
    }
}
