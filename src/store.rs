//! The store coordinator: public API, memtable rotation, frozen history,
//! the sorted-table queue, background flushing, and crash recovery.
//!
//! # Write path
//!
//! `put` inserts into the active memtable and then logs through the WAL. A
//! frozen table makes the insert fail, the caller rotates the table into
//! the history list and retries; the retry is unbounded by design.
//!
//! # Read path
//!
//! `get` probes storage tiers from newest to oldest: the active memtable,
//! the history of frozen memtables (newest first), then the table files
//! (newest first). The first hit wins, which gives last-writer-wins
//! semantics across tiers.
//!
//! # Background flushing
//!
//! One background thread wakes every `background_activity_period` and
//! drains the history into table files once it grows past
//! `memtable_history`, recycling the WAL in the process. Shutdown stops the
//! thread and flushes everything still in memory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::config::StoreOptions;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::sstable::{self, SsTable};
use crate::wal::{self, Wal};

/// Embedded persistent key-value store.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and client
/// threads may call `put` and `get` concurrently without coordination.
pub struct Store {
    shared: Arc<Shared>,
    background: Option<JoinHandle<()>>,
}

/// State shared between client threads and the background flusher.
struct Shared {
    config: StoreOptions,
    active: RwLock<Arc<Memtable>>,
    /// Frozen memtables, newest first. Tables are shared so in-flight
    /// readers pin them past detachment for flushing.
    history: RwLock<Vec<Arc<Memtable>>>,
    /// Table files, newest first. Readers share the lock; only the flusher
    /// takes it exclusively.
    ssts: RwLock<Vec<SsTable>>,
    wal: RwLock<Arc<Wal>>,
    /// Serializes rotation: taken only on the slow path, so concurrent put
    /// retries cannot rotate a table twice.
    rotate: Mutex<()>,
    exit: AtomicBool,
}

impl Store {
    /// Opens a store keeping both logs and table files under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_options(StoreOptions::new(dir))
    }

    /// Opens a store with explicit options, recovering any state a previous
    /// process left behind.
    pub fn open_with_options(config: StoreOptions) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.wal.base_dir)?;
        fs::create_dir_all(&config.sst.base_dir)?;

        let shared = Arc::new(Shared {
            active: RwLock::new(Arc::new(Memtable::new(config.memtable.clone())?)),
            history: RwLock::new(Vec::new()),
            ssts: RwLock::new(Vec::new()),
            wal: RwLock::new(Arc::new(Wal::new(config.wal.clone())?)),
            rotate: Mutex::new(()),
            exit: AtomicBool::new(false),
            config,
        });

        // Load existing table files before replay, so freshly recovered
        // data flushes in front of them.
        {
            let mut tables = Vec::new();
            for path in files_with_ext(&shared.config.sst.base_dir, sstable::FILE_EXT)? {
                tables.push(SsTable::open(&path)?);
            }
            tables.sort_by_key(|table| std::cmp::Reverse(table.timestamp()));
            if !tables.is_empty() {
                tracing::info!(count = tables.len(), "loaded existing table files");
            }
            *shared.ssts.write().unwrap() = tables;
        }

        // Logs on disk mean the previous process exited without a clean
        // shutdown. Replay them oldest file first so newer files win on
        // duplicate keys, rotating whenever a memtable fills up.
        let mut logs = files_with_ext(&shared.config.wal.base_dir, wal::FILE_EXT)?;
        logs.sort_by_key(|path| stem_timestamp(path));
        for path in &logs {
            let entries = wal::latest_entries(path)?;
            tracing::info!(path = ?path, entries = entries.len(), "replaying write-ahead log");
            for (key, value) in entries {
                loop {
                    let table = shared.active.read().unwrap().clone();
                    match table.insert(&key, &value) {
                        Ok(()) => break,
                        Err(Error::Frozen) => shared.save_memtable()?,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        if !logs.is_empty() {
            // Persist the recovered data before its logs disappear.
            shared.flush_memtables()?;
            for path in &logs {
                fs::remove_file(path)?;
            }
        }

        let background = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("emberdb-flush".into())
                .spawn(move || background_loop(shared))?
        };

        Ok(Self {
            shared,
            background: Some(background),
        })
    }

    /// Inserts a key-value pair, durably logging it before returning.
    ///
    /// Retries through memtable rotation until the write lands, so the call
    /// always eventually returns.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return errinput!("key must not be empty");
        }

        loop {
            let table = self.shared.active.read().unwrap().clone();
            match table.insert(key, value) {
                Ok(()) => break,
                // Table is full: rotate it into history and retry.
                Err(Error::Frozen) => self.shared.save_memtable()?,
                Err(e) => return Err(e),
            }
        }

        let wal = self.shared.wal.read().unwrap().clone();
        wal.log(key, value)
    }

    /// Fetches the most recent value for a key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return errinput!("key must not be empty");
        }

        let active = self.shared.active.read().unwrap().clone();
        if let Some(value) = active.get(key) {
            return Ok(Some(value.to_vec()));
        }

        // The guard is dropped before touching the table queue: the flusher
        // acquires the queue first and the history second.
        {
            let history = self.shared.history.read().unwrap();
            for table in history.iter() {
                if let Some(value) = table.get(key) {
                    return Ok(Some(value.to_vec()));
                }
            }
        }

        let ssts = self.shared.ssts.read().unwrap();
        for table in ssts.iter() {
            if let Some(value) = table.get(key)? {
                return Ok(Some(value));
            }
        }

        Ok(None)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.background.take() {
            let _ = handle.join();
        }
        // Persist everything still in memory; the final WAL removes its own
        // file on drop, its contents now superseded by table files.
        if let Err(e) = self.shared.flush_memtables() {
            tracing::error!(error = %e, "final flush failed during shutdown");
        }
    }
}

impl Shared {
    /// Locks the active memtable and prepends it to the history, installing
    /// a fresh table in its place. No-op when the active table is empty.
    fn save_memtable(&self) -> Result<()> {
        let _guard = self.rotate.lock().unwrap();

        let mut active = self.active.write().unwrap();
        if active.is_empty() {
            // A concurrent caller already rotated (or there is nothing to
            // rotate); the retry will land in the fresh table.
            return Ok(());
        }
        let old = std::mem::replace(&mut *active, Arc::new(Memtable::new(self.config.memtable.clone())?));
        old.lock();
        // Publish to history before releasing the active slot so no reader
        // can observe the table in neither tier.
        self.history.write().unwrap().insert(0, old);
        Ok(())
    }

    /// Drains the history into table files and recycles the WAL. Called by
    /// the background thread and at shutdown.
    fn flush_memtables(&self) -> Result<()> {
        self.save_memtable()?;

        // Swap in a fresh log but hold the superseded one: a crash mid-flush
        // must still find it on disk for recovery.
        let old_wal = {
            let fresh = Arc::new(Wal::new(self.config.wal.clone())?);
            let mut wal = self.wal.write().unwrap();
            std::mem::replace(&mut *wal, fresh)
        };

        loop {
            // Exclusive queue access spans the build, so a reader that
            // missed a detached table in history blocks here and then
            // observes its file. Both locks release every iteration.
            let mut ssts = self.ssts.write().unwrap();
            // Pop the oldest first: file timestamps then increase with data
            // freshness and the timestamp order of the queue stays truthful.
            let Some(table) = self.history.write().unwrap().pop() else {
                break;
            };
            match SsTable::create(&self.config.sst, &table) {
                Ok(sst) => {
                    tracing::info!(
                        path = ?sst.path(),
                        entries = sst.footer().entry_count,
                        "flushed memtable to table file"
                    );
                    ssts.insert(0, sst);
                }
                Err(e) => {
                    // Undo the pop and keep the old log on disk: its
                    // contents have not all reached table files.
                    self.history.write().unwrap().push(table);
                    old_wal.retain();
                    return Err(e);
                }
            }
        }

        drop(old_wal);
        Ok(())
    }
}

fn background_loop(shared: Arc<Shared>) {
    loop {
        std::thread::sleep(shared.config.background_activity_period);
        if shared.exit.load(Ordering::SeqCst) {
            break;
        }

        let depth = shared.history.read().unwrap().len();
        if depth > shared.config.memtable_history {
            if let Err(e) = shared.flush_memtables() {
                tracing::error!(error = %e, "background flush failed");
            }
        }
    }
}

/// Regular files in `dir` carrying the given extension.
fn files_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ext) {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn stem_timestamp(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemtableOptions, SstOptions};
    use crate::tmpfs::TempDir;
    use std::time::{Duration, Instant};

    fn options(dir: &TempDir) -> StoreOptions {
        // Small blocks keep the fixed-size table files tiny in tests.
        StoreOptions::new(dir.path())
            .sst(SstOptions::default().base_dir(dir.path()).max_block_size(4096))
            .background_activity_period(Duration::from_millis(10))
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "Timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn sst_files(dir: &TempDir) -> Vec<PathBuf> {
        files_with_ext(dir.path(), sstable::FILE_EXT).expect("Failed to list table files")
    }

    fn wal_files(dir: &TempDir) -> Vec<PathBuf> {
        files_with_ext(dir.path(), wal::FILE_EXT).expect("Failed to list log files")
    }

    #[test]
    fn test_basic_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::open_with_options(options(&dir)).expect("Failed to open store");

        store.put(b"alpha", b"one").expect("Put failed");
        assert_eq!(store.get(b"alpha").expect("Get failed"), Some(b"one".to_vec()));
        assert_eq!(store.get(b"absent").expect("Get failed"), None);

        // Zero-length values are legal and distinct from a miss.
        store.put(b"blank", b"").expect("Put failed");
        assert_eq!(store.get(b"blank").expect("Get failed"), Some(Vec::new()));
    }

    #[test]
    fn test_overwrite() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::open_with_options(options(&dir)).expect("Failed to open store");

        store.put(b"k", b"v1").expect("Put failed");
        store.put(b"k", b"v2").expect("Put failed");
        assert_eq!(store.get(b"k").expect("Get failed"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::open_with_options(options(&dir)).expect("Failed to open store");

        assert!(store.put(b"", b"value").is_err());
        assert!(store.get(b"").is_err());
    }

    #[test]
    fn test_forced_flush() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::open_with_options(
            options(&dir)
                .memtable(MemtableOptions::default().writes_before_lock(4))
                .memtable_history(0),
        )
        .expect("Failed to open store");

        for (key, value) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")] {
            store.put(key.as_bytes(), value.as_bytes()).expect("Put failed");
        }

        // The fifth insert rotated the memtable; the background thread
        // flushes the history shortly after.
        wait_for(|| !sst_files(&dir).is_empty());

        for (key, value) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")] {
            assert_eq!(
                store.get(key.as_bytes()).expect("Get failed"),
                Some(value.as_bytes().to_vec()),
                "Key {key} lost across the flush"
            );
        }
    }

    #[test]
    fn test_reads_across_all_tiers() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::open_with_options(
            options(&dir)
                .memtable(MemtableOptions::default().writes_before_lock(2))
                .memtable_history(0),
        )
        .expect("Failed to open store");

        store.put(b"a", b"1").expect("Put failed");
        store.put(b"b", b"2").expect("Put failed");
        // This rotates {a, b} into history and lands in a fresh table.
        store.put(b"c", b"3").expect("Put failed");

        assert_eq!(store.get(b"a").expect("Get failed"), Some(b"1".to_vec()));
        assert_eq!(store.get(b"c").expect("Get failed"), Some(b"3".to_vec()));

        // Once flushed, the same reads are served from table files.
        wait_for(|| !sst_files(&dir).is_empty());
        assert_eq!(store.get(b"a").expect("Get failed"), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").expect("Get failed"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_crash_recovery() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            // History threshold high enough that nothing flushes: on a
            // crash, the data exists only in the log.
            let store = Store::open_with_options(options(&dir).memtable_history(usize::MAX))
                .expect("Failed to open store");
            store.put(b"k1", b"v1").expect("Put failed");
            store.put(b"k2", b"v2").expect("Put failed");
            assert_eq!(wal_files(&dir).len(), 1);

            // Abrupt process death: no shutdown, no final flush.
            std::mem::forget(store);
        }

        let store = Store::open_with_options(options(&dir)).expect("Failed to reopen store");
        assert_eq!(store.get(b"k1").expect("Get failed"), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k2").expect("Get failed"), Some(b"v2".to_vec()));

        // The stale log was replayed, persisted, and removed.
        assert!(wal_files(&dir).is_empty(), "Recovered log must be deleted");
        assert!(!sst_files(&dir).is_empty(), "Recovered data must be persisted");
    }

    #[test]
    fn test_crash_recovery_keeps_newest_value() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let store = Store::open_with_options(options(&dir).memtable_history(usize::MAX))
                .expect("Failed to open store");
            store.put(b"k", b"old").expect("Put failed");
            store.put(b"k", b"new").expect("Put failed");
            std::mem::forget(store);
        }

        let store = Store::open_with_options(options(&dir)).expect("Failed to reopen store");
        assert_eq!(store.get(b"k").expect("Get failed"), Some(b"new".to_vec()));
    }

    #[test]
    fn test_shutdown_flushes_everything() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let store = Store::open_with_options(options(&dir)).expect("Failed to open store");
            for i in 0..20 {
                let key = format!("key_{i:02}");
                let value = format!("value_{i}");
                store.put(key.as_bytes(), value.as_bytes()).expect("Put failed");
            }
        }

        // A clean shutdown leaves only table files behind.
        assert!(wal_files(&dir).is_empty(), "Shutdown must remove the log");
        assert!(!sst_files(&dir).is_empty(), "Shutdown must flush to table files");

        let store = Store::open_with_options(options(&dir)).expect("Failed to reopen store");
        for i in 0..20 {
            let key = format!("key_{i:02}");
            let value = format!("value_{i}");
            assert_eq!(
                store.get(key.as_bytes()).expect("Get failed"),
                Some(value.into_bytes())
            );
        }
    }

    #[test]
    fn test_concurrent_put_get_same_key() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            Store::open_with_options(
                options(&dir)
                    .memtable(MemtableOptions::default().writes_before_lock(500))
                    .memtable_history(1),
            )
            .expect("Failed to open store"),
        );

        const WRITES: u32 = 5000;
        store.put(b"k", &0u32.to_be_bytes()).expect("Put failed");

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 1..WRITES {
                    store.put(b"k", &i.to_be_bytes()).expect("Put failed");
                }
            })
        };

        // The key must stay visible through rotations and flushes, and every
        // observed value must be one some writer actually produced.
        for _ in 0..2000 {
            let value = store
                .get(b"k")
                .expect("Get failed")
                .expect("Key must always be visible");
            assert_eq!(value.len(), 4);
            let n = u32::from_be_bytes(value.as_slice().try_into().unwrap());
            assert!(n < WRITES);
        }

        writer.join().expect("Writer panicked");
        let value = store.get(b"k").expect("Get failed").expect("Key missing");
        assert_eq!(
            u32::from_be_bytes(value.as_slice().try_into().unwrap()),
            WRITES - 1
        );
    }

    #[test]
    fn test_concurrent_writers_distinct_keys() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            Store::open_with_options(
                options(&dir)
                    .memtable(MemtableOptions::default().writes_before_lock(128))
                    .memtable_history(1),
            )
            .expect("Failed to open store"),
        );

        let mut handles = Vec::new();
        for thread_id in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    let key = format!("key_{thread_id}_{i:04}");
                    let value = format!("value_{thread_id}_{i}");
                    store.put(key.as_bytes(), value.as_bytes()).expect("Put failed");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("Writer panicked");
        }

        for thread_id in 0..4 {
            for i in 0..250 {
                let key = format!("key_{thread_id}_{i:04}");
                let value = format!("value_{thread_id}_{i}");
                assert_eq!(
                    store.get(key.as_bytes()).expect("Get failed"),
                    Some(value.into_bytes()),
                    "Key {key} lost"
                );
            }
        }
    }
}
