//! In-memory write buffer backed by a concurrent skip list.
//!
//! The memtable is the first tier of the store: every put lands here before
//! it is logged, and a table that reaches one of its capacity limits is
//! frozen and queued for flushing to a sorted table file.
//!
//! # Record slots
//!
//! Values are not stored in the skip list itself. Each insert reserves a
//! slot in a pre-allocated, write-once record arena by incrementing
//! `next_record`, writes its value into that slot, and then publishes the
//! slot by advancing the key's atomic record index. An overwrite is
//! therefore a single atomic integer swap rather than a pointer swap, and a
//! concurrent reader that resolved the old index still sees valid bytes:
//! superseded slots stay allocated until the table is dropped. Readers may
//! observe a stale-but-valid record; they never observe a torn one, since a
//! slot is fully written before its index becomes reachable.
//!
//! Slot indices are dense in `[0, next_record)` and never reused, which is
//! what makes "newer" a simple integer comparison.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crossbeam_skiplist::SkipMap;

use crate::config::MemtableOptions;
use crate::error::{Error, Result};

/// Concurrent sorted table of key-value pairs with freeze semantics.
///
/// Keys are ordered lexicographically on unsigned bytes. Within one table a
/// key maps to at most one skip-list entry; repeated inserts advance the
/// entry's record index to the newest slot (last writer wins, with slot
/// reservation as the linearization point).
pub struct Memtable {
    config: MemtableOptions,
    data: SkipMap<Vec<u8>, AtomicU32>,
    records: Box<[OnceLock<Box<[u8]>>]>,
    next_record: AtomicU32,
    live_data_size: AtomicUsize,
    total_data_size: AtomicUsize,
    is_locked: AtomicBool,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("entries", &self.data.len())
            .field("live_size", &self.live_size())
            .field("total_size", &self.total_size())
            .field("locked", &self.locked())
            .finish()
    }
}

impl Memtable {
    /// Creates an empty table, pre-allocating `writes_before_lock` record slots.
    pub fn new(config: MemtableOptions) -> Result<Self> {
        config.validate()?;
        let mut records = Vec::with_capacity(config.writes_before_lock);
        records.resize_with(config.writes_before_lock, OnceLock::new);

        Ok(Self {
            config,
            data: SkipMap::new(),
            records: records.into_boxed_slice(),
            next_record: AtomicU32::new(0),
            live_data_size: AtomicUsize::new(0),
            total_data_size: AtomicUsize::new(0),
            is_locked: AtomicBool::new(false),
        })
    }

    /// Inserts or updates a key-value pair. Never blocks.
    ///
    /// Returns `Error::Frozen` iff the table is locked or out of capacity,
    /// in which case the caller should rotate the table and retry.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.locked() {
            return Err(Error::Frozen);
        }

        // Reserve a fresh slot. The counter only ever grows, so a reserved
        // index is owned exclusively by this thread. Reservations that lose
        // the race against the capacity limit burn an index, which is fine:
        // nothing will ever reference it.
        let idx = self.next_record.fetch_add(1, Ordering::SeqCst);
        if idx as usize >= self.records.len() {
            return Err(Error::Frozen);
        }

        let size = value.len();
        // Slot indices are never reused, so this set cannot fail.
        let _ = self.records[idx as usize].set(value.into());
        self.total_data_size.fetch_add(size, Ordering::SeqCst);

        let entry = self.data.get_or_insert(key.to_vec(), AtomicU32::new(idx));
        let prev = entry.value().fetch_max(idx, Ordering::SeqCst);

        if prev == idx {
            // Fresh key: the entry we just created is our own.
            self.live_data_size.fetch_add(size, Ordering::SeqCst);
        } else if prev < idx {
            // Superseded an older record; swap its size out of the live total.
            let old = self.records[prev as usize].get().map_or(0, |r| r.len());
            self.live_data_size.fetch_add(size, Ordering::SeqCst);
            self.live_data_size.fetch_sub(old, Ordering::SeqCst);
        }
        // prev > idx: a concurrent insert already published a newer slot.
        // Treat this insertion as succeeded-then-overwritten; the stale slot
        // stays counted in total_data_size only.

        Ok(())
    }

    /// Looks up the current value for a key.
    ///
    /// Lock-free. The returned slice borrows the record arena and stays
    /// valid for the lifetime of the table; under concurrent writes it may
    /// be stale by the time the caller reads it.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let idx = self.data.get(key)?.value().load(Ordering::SeqCst) as usize;
        self.records.get(idx)?.get().map(|record| &record[..])
    }

    /// Visits entries in ascending key order, resolving each key to its
    /// current record. Used to stream a frozen table into a file.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        for entry in self.data.iter() {
            let idx = entry.value().load(Ordering::SeqCst) as usize;
            if let Some(record) = self.records.get(idx).and_then(|slot| slot.get()) {
                f(entry.key(), record)?;
            }
        }
        Ok(())
    }

    /// Marks the table frozen. Idempotent; returns the prior state.
    pub fn lock(&self) -> bool {
        self.is_locked.swap(true, Ordering::SeqCst)
    }

    /// True once the table refuses further insertions, whether explicitly
    /// locked or past any capacity threshold.
    pub fn locked(&self) -> bool {
        self.is_locked.load(Ordering::SeqCst)
            || self.next_record.load(Ordering::SeqCst) as usize >= self.config.writes_before_lock
            || self.live_data_size.load(Ordering::SeqCst) >= self.config.data_limit
            || self.total_data_size.load(Ordering::SeqCst) >= self.config.total_data_limit
    }

    /// True iff the table holds no entries.
    ///
    /// Note this is entry count, not live bytes: a table whose values are
    /// all zero-length still has keys that must rotate and flush.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Bytes of live value data.
    pub fn live_size(&self) -> usize {
        self.live_data_size.load(Ordering::SeqCst)
    }

    /// Bytes of value data including superseded records.
    pub fn total_size(&self) -> usize {
        self.total_data_size.load(Ordering::SeqCst)
    }
}
