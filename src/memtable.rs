//! Append-only memtable with a reserved-index commit protocol.
//!
//! The memtable is a bounded slab of record slots written by a single
//! writer and read by many sampler threads. A writer claims a slot with a
//! fetch-and-add on the tail counter, formats the record in place, and only
//! then bumps the committed count with release ordering. Samplers read the
//! committed count once per query (the cutoff) and may touch any slot below
//! it; slots below the cutoff are never rewritten while the memtable is
//! live, which is what makes the unsynchronized slot reads sound.
//!
//! Truncation is the one operation that rewrites committed slots. Samplers
//! therefore pin the memtable for the duration of a query, and `truncate`
//! refuses to run while any pin is held.
//!
//! # Tombstone cache
//!
//! `check_tombstone` must never report a false negative, so tombstones are
//! tracked twice: a bloom filter provides the cheap negative probe and a
//! concurrent skip map holds the exact `(key, value)` pairs behind it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use crossbeam_skiplist::SkipMap;

use crate::alias::Alias;
use crate::filter::BloomFilter;
use crate::record::{Key, Record, Value};

/// Bounded, append-only record buffer. One writer, many samplers.
pub struct Memtable {
    slots: Box<[UnsafeCell<Record>]>,
    delete_tags: Option<Box<[AtomicBool]>>,
    capacity: usize,
    tombstone_capacity: usize,

    tail: AtomicUsize,
    committed: AtomicUsize,
    tombstones: AtomicUsize,
    weight_bits: AtomicU64,

    pin_lock: RwLock<()>,
    pins: AtomicUsize,

    tombstone_filter: BloomFilter,
    tombstone_cache: SkipMap<(Key, Value), ()>,
}

// SAFETY: slot contents are only read below the committed count, which is
// published with release ordering after the slot write; committed slots are
// not rewritten except under `truncate`, which holds the pin lock
// exclusively while samplers hold it shared.
unsafe impl Sync for Memtable {}

/// RAII pin blocking memtable truncation, in the style of a freeze guard.
pub struct MemtablePin<'a> {
    memtable: &'a Memtable,
    _guard: RwLockReadGuard<'a, ()>,
}

impl Drop for MemtablePin<'_> {
    fn drop(&mut self) {
        self.memtable.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The memtable's contribution to one sampling query.
pub struct MemtableSampleRange {
    /// Committed prefix length observed at query entry.
    pub cutoff: usize,
    /// In-range candidate records (candidate mode only).
    pub candidates: Option<Vec<Record>>,
    /// Weight-proportional draw table over the candidates.
    pub alias: Option<Alias>,
    /// Total sampling weight contributed by the memtable.
    pub weight: f64,
}

impl Memtable {
    /// Create a memtable with the given record and tombstone capacities.
    /// `tagging` allocates the per-slot delete tags used by the tagging
    /// delete policy.
    pub fn new(
        capacity: usize,
        tombstone_capacity: usize,
        bloom_fpr: f64,
        bloom_hash_count: u32,
        tagging: bool,
    ) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(Record::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let delete_tags = tagging.then(|| {
            (0..capacity)
                .map(|_| AtomicBool::new(false))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        Self {
            slots,
            delete_tags,
            capacity,
            tombstone_capacity,
            tail: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
            weight_bits: AtomicU64::new(0f64.to_bits()),
            pin_lock: RwLock::new(()),
            pins: AtomicUsize::new(0),
            tombstone_filter: BloomFilter::new(bloom_fpr, tombstone_capacity, bloom_hash_count),
            tombstone_cache: SkipMap::new(),
        }
    }

    /// Append a record. Returns false when the slab is full or a tombstone
    /// would exceed the tombstone budget.
    pub fn append(&self, key: Key, value: Value, weight: f64, tombstone: bool) -> bool {
        if tombstone && self.tombstones.load(Ordering::SeqCst) + 1 > self.tombstone_capacity {
            return false;
        }

        // Reserve a slot. The tail may run past capacity on failed
        // reservations; only reservations inside the slab commit.
        let idx = self.tail.fetch_add(1, Ordering::SeqCst);
        if idx >= self.capacity {
            return false;
        }

        let record = if tombstone {
            Record::tombstone(key, value)
        } else {
            Record::new(key, value, weight)
        }
        .with_slot(idx as u32);

        // SAFETY: idx came from the tail reservation, so no other write
        // targets this slot, and it is above every published cutoff.
        unsafe {
            *self.slots[idx].get() = record;
        }

        if tombstone {
            self.tombstones.fetch_add(1, Ordering::SeqCst);
            self.tombstone_filter.insert(key);
            self.tombstone_cache.insert((key, value), ());
        } else {
            self.add_weight(weight);
        }

        self.committed.fetch_add(1, Ordering::Release);
        true
    }

    fn add_weight(&self, weight: f64) {
        let mut current = self.weight_bits.load(Ordering::SeqCst);
        loop {
            let next = (f64::from_bits(current) + weight).to_bits();
            match self.weight_bits.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Number of committed records.
    pub fn record_count(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tombstone_capacity(&self) -> usize {
        self.tombstone_capacity
    }

    pub fn is_full(&self) -> bool {
        self.record_count() == self.capacity
    }

    /// Total weight of committed live records.
    pub fn total_weight(&self) -> f64 {
        f64::from_bits(self.weight_bits.load(Ordering::SeqCst))
    }

    /// Read a committed record. Returns None above the committed prefix.
    pub fn record_at(&self, idx: usize) -> Option<Record> {
        if idx >= self.record_count() {
            return None;
        }
        // SAFETY: idx is below the committed count, so the slot write
        // happened before the Acquire load above and is never repeated.
        Some(unsafe { *self.slots[idx].get() })
    }

    /// True if the record in `idx` carries a delete tag.
    pub fn slot_deleted(&self, idx: usize) -> bool {
        match &self.delete_tags {
            Some(tags) if idx < self.record_count() => tags[idx].load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// Copy of the committed prefix, sorted by the record order. Delete
    /// tags are folded into the copied headers.
    pub fn sorted_output(&self) -> Vec<Record> {
        let n = self.record_count();
        let mut records = Vec::with_capacity(n);
        for idx in 0..n {
            // SAFETY: idx < committed, see record_at.
            let mut record = unsafe { *self.slots[idx].get() };
            if self.slot_deleted(idx) {
                record = record.tag_deleted();
            }
            records.push(record);
        }
        records.sort_unstable();
        records
    }

    /// True if a tombstone for exactly `(key, value)` is present. The bloom
    /// filter gates the exact probe; the probe itself never misses.
    pub fn check_tombstone(&self, key: Key, value: Value) -> bool {
        if !self.tombstone_filter.lookup(key) {
            return false;
        }
        self.tombstone_cache.contains_key(&(key, value))
    }

    /// Tag the most recent live `(key, value)` record as deleted. Only
    /// available when the memtable was built with tagging enabled.
    pub fn delete_record(&self, key: Key, value: Value) -> bool {
        let Some(tags) = &self.delete_tags else {
            return false;
        };
        let n = self.record_count();
        let mut found = None;
        for idx in 0..n {
            // SAFETY: idx < committed, see record_at.
            let record = unsafe { *self.slots[idx].get() };
            if !record.is_tombstone() && record.matches(key, value) {
                found = Some(idx);
            }
        }
        match found {
            Some(idx) => {
                tags[idx].store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Pin the memtable for a sampling query, blocking truncation.
    pub fn pin(&self) -> MemtablePin<'_> {
        let guard = match self.pin_lock.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.pins.fetch_add(1, Ordering::SeqCst);
        MemtablePin {
            memtable: self,
            _guard: guard,
        }
    }

    /// Number of active sampler pins.
    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    /// Produce this query's memtable contribution.
    ///
    /// In rejection mode the contribution is the whole committed prefix and
    /// sampling draws slot indices below the cutoff, rejecting out-of-range
    /// records later. In candidate mode the in-range records are gathered up
    /// front, with an alias over their weights when `weighted`.
    pub fn sample_range(
        &self,
        lo: Key,
        hi: Key,
        rejection: bool,
        weighted: bool,
    ) -> MemtableSampleRange {
        let cutoff = self.record_count();
        if rejection {
            return MemtableSampleRange {
                cutoff,
                candidates: None,
                alias: None,
                weight: cutoff as f64,
            };
        }

        let mut candidates = Vec::new();
        for idx in 0..cutoff {
            // SAFETY: idx < committed, see record_at.
            let mut record = unsafe { *self.slots[idx].get() };
            if record.key < lo || record.key > hi {
                continue;
            }
            if self.slot_deleted(idx) {
                record = record.tag_deleted();
            }
            candidates.push(record);
        }

        let (weight, alias) = if weighted {
            let weights: Vec<f64> = candidates.iter().map(|r| r.weight).collect();
            let total: f64 = weights.iter().sum();
            let alias = (total > 0.0).then(|| Alias::new(&weights).ok()).flatten();
            (total, alias)
        } else {
            (candidates.len() as f64, None)
        };

        MemtableSampleRange {
            cutoff,
            candidates: Some(candidates),
            alias,
            weight,
        }
    }

    /// Reset the memtable to empty. Fails while any sampler pin is held.
    pub fn truncate(&self) -> bool {
        let Ok(_guard) = self.pin_lock.try_write() else {
            return false;
        };

        self.tail.store(0, Ordering::SeqCst);
        self.committed.store(0, Ordering::SeqCst);
        self.tombstones.store(0, Ordering::SeqCst);
        self.weight_bits.store(0f64.to_bits(), Ordering::SeqCst);
        self.tombstone_filter.clear();
        for entry in self.tombstone_cache.iter() {
            entry.remove();
        }
        if let Some(tags) = &self.delete_tags {
            for tag in tags.iter() {
                tag.store(false, Ordering::SeqCst);
            }
        }
        true
    }

    /// Bytes held by the record slab.
    pub fn memory_bytes(&self) -> usize {
        self.capacity * std::mem::size_of::<Record>()
    }

    /// Bytes held by the tombstone filter.
    pub fn aux_memory_bytes(&self) -> usize {
        self.tombstone_filter.memory_bytes()
    }
}
