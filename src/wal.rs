//! Write-ahead logging, enabling recovery of in-memory data after an
//! abnormal process exit.
//!
//! # File format
//!
//! Each log entry is framed as:
//!
//! ```text
//! +--------------+---------------------------------------+-----------+
//! |record_len:u32| payload                               | crc32:u32 |
//! +--------------+---------------------------------------+-----------+
//!                | key_len:u32 | val_len:u32 | key | value |
//! ```
//!
//! Multi-byte integers are big-endian; the CRC-32/ISCSI checksum covers the
//! payload. Length framing means keys and values may contain any byte,
//! including newlines.
//!
//! # Writer discipline
//!
//! Concurrent `log` calls are safe while only one thread ever writes file
//! data. Producers acquire the gate lock in shared mode, reserve a ring slot
//! by advancing the write head with a compare-exchange (retrying on
//! contention or a full ring), deposit their entry, and release. A producer
//! then tries to take the gate exclusively; the winner drains `[read, write)`
//! into the log file while the lock keeps all other producers out, and a
//! loser simply returns, knowing the winner will persist its entry.
//!
//! The log file is created lazily by the first drain and removed when the
//! log is dropped, unless [`Wal::retain`] was called first.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::config::WalOptions;
use crate::error::{Error, Result};

/// File extension for write-ahead logs.
pub const FILE_EXT: &str = "kvwal";

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

struct PendingPut {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// A single write-ahead log file plus its in-memory pending ring.
pub struct Wal {
    path: PathBuf,
    ring: Box<[Mutex<Option<PendingPut>>]>,
    write: AtomicUsize,
    // Only advanced under the exclusive gate; atomic so producers can test
    // for a full ring without it.
    read: AtomicUsize,
    gate: RwLock<()>,
    remove_on_drop: AtomicBool,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    /// Creates a log under `options.base_dir`, named by a monotonic
    /// millisecond timestamp. The file itself is created on first drain.
    pub fn new(options: WalOptions) -> Result<Self> {
        options.validate()?;
        let path = options
            .base_dir
            .join(format!("{}.{FILE_EXT}", unique_millis()));

        let mut ring = Vec::with_capacity(options.concurrent_put_limit);
        ring.resize_with(options.concurrent_put_limit, || Mutex::new(None));

        Ok(Self {
            path,
            ring: ring.into_boxed_slice(),
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            gate: RwLock::new(()),
            remove_on_drop: AtomicBool::new(true),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the log file on disk when this handle is dropped. Used when a
    /// flush fails and the log must survive for the next recovery.
    pub fn retain(&self) {
        self.remove_on_drop.store(false, Ordering::SeqCst);
    }

    /// Logs a put operation. Safe under concurrent callers.
    ///
    /// On return the entry is either already on disk or enqueued in the
    /// ring, where the next exclusive drain will persist it.
    pub fn log(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let capacity = self.ring.len();
        let mut pending = Some(PendingPut {
            key: key.to_vec(),
            value: value.to_vec(),
        });

        loop {
            let shared = self.gate.read()?;

            let w = self.write.load(Ordering::SeqCst);
            let next = (w + 1) % capacity;
            // Full ring: release, try to drain it ourselves, and retry.
            // Without the drain attempt every producer could end up spinning
            // here with no drainer left in flight.
            if next == self.read.load(Ordering::SeqCst) {
                drop(shared);
                if let Ok(_exclusive) = self.gate.try_write() {
                    self.drain()?;
                }
                continue;
            }
            if self
                .write
                .compare_exchange_weak(w, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                drop(shared);
                continue;
            }

            *self.ring[w].lock()? = pending.take();
            break;
        }

        // Promote to drainer. Losing the race is fine: the winner holds the
        // gate exclusively, so it drains every deposited slot, ours included.
        if let Ok(_exclusive) = self.gate.try_write() {
            self.drain()?;
        }
        Ok(())
    }

    /// Blocks until every pending entry is on disk.
    pub fn sync(&self) -> Result<()> {
        let _exclusive = self.gate.write()?;
        self.drain()?;
        if self.path.exists() {
            File::open(&self.path)?.sync_all()?;
        }
        Ok(())
    }

    /// Writes `[read, write)` to the log file. Caller must hold the gate
    /// exclusively, which keeps both heads stable against producers.
    fn drain(&self) -> Result<()> {
        let capacity = self.ring.len();
        let w = self.write.load(Ordering::SeqCst);
        let mut r = self.read.load(Ordering::SeqCst);
        if r == w {
            return Ok(());
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);

        while r != w {
            let entry = self.ring[r].lock()?.take();
            if let Some(entry) = entry {
                write_entry(&mut writer, &entry.key, &entry.value)?;
            }
            r = (r + 1) % capacity;
            self.read.store(r, Ordering::SeqCst);
        }

        writer.flush()?;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if self.remove_on_drop.load(Ordering::SeqCst) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn write_entry<W: Write>(writer: &mut W, key: &[u8], value: &[u8]) -> Result<()> {
    let mut payload = Vec::with_capacity(8 + key.len() + value.len());
    payload.write_u32::<BigEndian>(key.len() as u32)?;
    payload.write_u32::<BigEndian>(value.len() as u32)?;
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);

    let checksum = CRC32.checksum(&payload);

    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(&payload)?;
    writer.write_u32::<BigEndian>(checksum)?;
    Ok(())
}

/// Iterates the entries of a log file in write order.
pub struct ReplayIterator {
    reader: BufReader<File>,
}

impl ReplayIterator {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }

    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let record_len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; record_len];
        reader
            .read_exact(&mut payload)
            .map_err(|e| Error::InvalidData(format!("truncated log payload: {e}")))?;
        let stored_crc = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::InvalidData(format!("truncated log checksum: {e}")))?;

        if CRC32.checksum(&payload) != stored_crc {
            return errdata!("log entry checksum mismatch");
        }

        let mut cursor = Cursor::new(&payload);
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        if 8 + key_len + value_len != record_len {
            return errdata!("log entry length mismatch");
        }

        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value)?;

        Ok(Some((key, value)))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match Self::read_entry(&mut self.reader) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Reads a log file and keeps only the latest value for each key.
///
/// The file is scanned in write order and then reversed, so the first
/// occurrence of a key in the reversed list is its newest value.
pub fn latest_entries(path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries = ReplayIterator::open(path)?.collect::<Result<Vec<_>>>()?;
    entries.reverse();

    let mut seen = std::collections::HashSet::new();
    entries.retain(|(key, _)| seen.insert(key.clone()));
    Ok(entries)
}

/// Returns a millisecond timestamp that is strictly increasing across the
/// process, so two logs created within the same millisecond get distinct
/// file names.
fn unique_millis() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    loop {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::sync::Arc;

    fn create_wal(dir: &TempDir) -> Wal {
        Wal::new(WalOptions::default().base_dir(dir.path())).expect("Failed to create WAL")
    }

    #[test]
    fn test_log_and_replay() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&dir);

        wal.log(b"key1", b"value1").expect("Failed to log");
        wal.log(b"key2", b"value2").expect("Failed to log");
        wal.log(b"key3", b"").expect("Failed to log (empty value)");

        let entries: Vec<_> = ReplayIterator::open(wal.path())
            .expect("Failed to open replay")
            .collect::<Result<Vec<_>>>()
            .expect("Replay failed");

        assert_eq!(
            entries,
            vec![
                (b"key1".to_vec(), b"value1".to_vec()),
                (b"key2".to_vec(), b"value2".to_vec()),
                (b"key3".to_vec(), b"".to_vec()),
            ]
        );
    }

    #[test]
    fn test_binary_safe_framing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&dir);

        let key = b"key\nwith\nnewlines";
        let value = [0u8, 10, 13, 255, 10];
        wal.log(key, &value).expect("Failed to log");

        let entries: Vec<_> = ReplayIterator::open(wal.path())
            .expect("Failed to open replay")
            .collect::<Result<Vec<_>>>()
            .expect("Replay failed");
        assert_eq!(entries, vec![(key.to_vec(), value.to_vec())]);
    }

    #[test]
    fn test_latest_entries_newest_wins() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&dir);

        wal.log(b"key1", b"old").expect("Failed to log");
        wal.log(b"key2", b"value2").expect("Failed to log");
        wal.log(b"key1", b"new").expect("Failed to log");

        let mut entries = latest_entries(wal.path()).expect("Load failed");
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (b"key1".to_vec(), b"new".to_vec()),
                (b"key2".to_vec(), b"value2".to_vec()),
            ]
        );
    }

    #[test]
    fn test_lazy_file_creation_and_removal_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&dir);
        let path = wal.path().to_path_buf();

        assert!(!path.exists(), "File should not exist before the first drain");
        wal.log(b"key", b"value").expect("Failed to log");
        assert!(path.exists(), "First drain should create the file");

        drop(wal);
        assert!(!path.exists(), "Drop should remove the file");
    }

    #[test]
    fn test_retain_keeps_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&dir);
        let path = wal.path().to_path_buf();

        wal.log(b"key", b"value").expect("Failed to log");
        wal.retain();
        drop(wal);
        assert!(path.exists(), "Retained file should survive drop");
    }

    #[test]
    fn test_corrupted_entry_detected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&dir);

        wal.log(b"key1", b"value1").expect("Failed to log");
        wal.log(b"key2", b"value2").expect("Failed to log");

        // Flip bytes inside the first payload.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new()
                .write(true)
                .open(wal.path())
                .expect("Failed to reopen log");
            file.seek(SeekFrom::Start(6)).unwrap();
            file.write_all(b"garbage").unwrap();
        }

        let corrupted = ReplayIterator::open(wal.path())
            .expect("Failed to open replay")
            .any(|entry| matches!(entry, Err(Error::InvalidData(_))));
        assert!(corrupted, "Corruption not detected during replay");
    }

    #[test]
    fn test_concurrent_producers() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = Arc::new(
            Wal::new(
                WalOptions::default()
                    .base_dir(dir.path())
                    .concurrent_put_limit(8),
            )
            .expect("Failed to create WAL"),
        );

        let mut handles = Vec::new();
        for thread_id in 0..4 {
            let wal = wal.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("key_{}_{}", thread_id, i);
                    let value = format!("value_{}", i);
                    wal.log(key.as_bytes(), value.as_bytes()).expect("Failed to log");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("Producer panicked");
        }

        wal.sync().expect("Failed to sync");
        let count = ReplayIterator::open(wal.path())
            .expect("Failed to open replay")
            .count();
        assert_eq!(count, 400, "Every logged entry must be persisted");
    }
}
