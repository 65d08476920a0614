//! Immutable sorted runs with an internal fanout index.
//!
//! A run is built once, from a memtable's sorted view or by merging other
//! runs, and never changes afterwards (delete tags excepted, which live in
//! per-slot atomics). Construction cancels matched record/tombstone pairs:
//! a live record immediately followed by its matching tombstone drops both,
//! which is what keeps a single run free of self-shadowed pairs and lets
//! the sampler restrict deletion checks to strictly newer runs.
//!
//! Atop the sorted array sits a bottom-up index of separator keys with a
//! fixed node size: each separator is the maximum key of its child group,
//! and `lower_bound`/`upper_bound` descend the levels then scan inside the
//! leaf group. Out-of-range keys yield the sentinel `record_count()`.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use itertools::Itertools as _;

use crate::alias::Alias;
use crate::errdata;
use crate::error::{Error, Result};
use crate::filter::BloomFilter;
use crate::memtable::Memtable;
use crate::metrics;
use crate::record::{Key, Record, Value, ENCODED_LEN};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const NODE_SIZE: usize = 256;
const FANOUT: usize = NODE_SIZE / (std::mem::size_of::<Key>() + std::mem::size_of::<usize>());
const LEAF_FANOUT: usize = NODE_SIZE / std::mem::size_of::<Record>();

/// An immutable sorted batch of records.
pub struct Run {
    data: Vec<Record>,
    /// Separator levels, leaf separators first, coarsest level last.
    index: Vec<Vec<Key>>,
    filter: BloomFilter,
    tombstones: usize,
    total_weight: f64,
    deleted: AtomicUsize,
    delete_tags: Option<Box<[AtomicBool]>>,
}

struct HeapEntry {
    record: Record,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.record
            .cmp(&other.record)
            .then(self.source.cmp(&other.source))
    }
}

impl Run {
    /// Build a run from a memtable's sorted view, cancelling matched
    /// record/tombstone pairs on the way through.
    pub fn from_memtable(
        memtable: &Memtable,
        bloom_fpr: f64,
        bloom_hash_count: u32,
        tagging: bool,
    ) -> Self {
        let sorted = memtable.sorted_output();
        let filter = BloomFilter::new(
            bloom_fpr,
            memtable.tombstone_count().max(1),
            bloom_hash_count,
        );

        let mut data = Vec::with_capacity(sorted.len());
        let mut tombstones = 0;
        let mut i = 0;
        while i < sorted.len() {
            let record = sorted[i];
            if !record.is_tombstone()
                && i + 1 < sorted.len()
                && sorted[i + 1].is_tombstone()
                && record.matches_record(&sorted[i + 1])
            {
                i += 2;
                metrics::record_cancellation();
                continue;
            }

            let record = record.strip_slot();
            if record.is_tombstone() {
                tombstones += 1;
                filter.insert(record.key);
            }
            data.push(record);
            i += 1;
        }

        Self::assemble(data, filter, tombstones, tagging)
    }

    /// Merge runs into a new run via a priority queue over their cursors.
    /// When the queue's head is a live record and the runner-up is its
    /// matching tombstone, both are dropped. Fails with `InvalidData` if an
    /// input yields records out of order, leaving the inputs untouched.
    pub fn merge(
        inputs: &[Arc<Run>],
        bloom_fpr: f64,
        bloom_hash_count: u32,
        tagging: bool,
    ) -> Result<Self> {
        let expected: usize = inputs.iter().map(|r| r.record_count()).sum();
        let tombstone_estimate: usize = inputs.iter().map(|r| r.tombstone_count()).sum();
        let filter = BloomFilter::new(bloom_fpr, tombstone_estimate.max(1), bloom_hash_count);

        let mut cursors = vec![0usize; inputs.len()];
        let mut heap = BinaryHeap::with_capacity(inputs.len());
        for (source, run) in inputs.iter().enumerate() {
            if let Some(record) = run.output_record_at(0) {
                heap.push(Reverse(HeapEntry { record, source }));
            }
        }

        let mut data = Vec::with_capacity(expected);
        let mut tombstones = 0;

        // Advance one cursor, validating that its run stays sorted.
        let advance = |cursors: &mut Vec<usize>,
                       heap: &mut BinaryHeap<Reverse<HeapEntry>>,
                       source: usize|
         -> Result<()> {
            let idx = cursors[source] + 1;
            cursors[source] = idx;
            if let Some(record) = inputs[source].output_record_at(idx) {
                if inputs[source].data[idx] < inputs[source].data[idx - 1] {
                    return Err(errdata!(
                        "merge input run {source} is not sorted at index {idx}"
                    ));
                }
                heap.push(Reverse(HeapEntry { record, source }));
            }
            Ok(())
        };

        while let Some(Reverse(top)) = heap.pop() {
            if !top.record.is_tombstone() {
                let cancels = matches!(
                    heap.peek(),
                    Some(Reverse(next))
                        if next.record.is_tombstone() && next.record.matches_record(&top.record)
                );
                if cancels {
                    if let Some(Reverse(next)) = heap.pop() {
                        advance(&mut cursors, &mut heap, top.source)?;
                        advance(&mut cursors, &mut heap, next.source)?;
                        metrics::record_cancellation();
                    }
                    continue;
                }
            }

            if top.record.is_tombstone() {
                tombstones += 1;
                filter.insert(top.record.key);
            }
            data.push(top.record);
            advance(&mut cursors, &mut heap, top.source)?;
        }

        Ok(Self::assemble(data, filter, tombstones, tagging))
    }

    fn assemble(data: Vec<Record>, filter: BloomFilter, tombstones: usize, tagging: bool) -> Self {
        let total_weight = data
            .iter()
            .filter(|r| !r.is_tombstone())
            .map(|r| r.weight)
            .sum();
        let deleted = data.iter().filter(|r| r.is_delete_tagged()).count();
        let delete_tags = tagging.then(|| {
            data.iter()
                .map(|r| AtomicBool::new(r.is_delete_tagged()))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        let index = build_index(&data);
        Self {
            data,
            index,
            filter,
            tombstones,
            total_weight,
            deleted: AtomicUsize::new(deleted),
            delete_tags,
        }
    }

    pub fn record_count(&self) -> usize {
        self.data.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    /// Count of delete-tagged records.
    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Total weight of live records.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn min_key(&self) -> Option<Key> {
        self.data.first().map(|r| r.key)
    }

    pub fn max_key(&self) -> Option<Key> {
        self.data.last().map(|r| r.key)
    }

    /// The sorted record array.
    pub fn records(&self) -> &[Record] {
        &self.data
    }

    pub fn record_at(&self, idx: usize) -> Option<Record> {
        self.data.get(idx).copied()
    }

    /// Record with the live delete-tag state folded into its header, the
    /// form used for merging and persistence.
    pub(crate) fn output_record_at(&self, idx: usize) -> Option<Record> {
        let record = self.record_at(idx)?;
        if self.slot_deleted(idx) {
            Some(record.tag_deleted())
        } else {
            Some(record)
        }
    }

    /// True if the record at `idx` is shadowed by a delete tag.
    pub fn slot_deleted(&self, idx: usize) -> bool {
        if self.data.get(idx).is_some_and(|r| r.is_delete_tagged()) {
            return true;
        }
        match &self.delete_tags {
            Some(tags) => tags.get(idx).is_some_and(|t| t.load(Ordering::SeqCst)),
            None => false,
        }
    }

    /// First index whose key is >= `key`; `record_count()` if none.
    pub fn lower_bound(&self, key: Key) -> usize {
        if self.data.is_empty() {
            return 0;
        }
        let group = self.leaf_group(key, false);
        let mut idx = group * LEAF_FANOUT;
        while idx < self.data.len() && self.data[idx].key < key {
            idx += 1;
        }
        idx
    }

    /// First index whose key is > `key`; `record_count()` if none.
    pub fn upper_bound(&self, key: Key) -> usize {
        if self.data.is_empty() {
            return 0;
        }
        let group = self.leaf_group(key, true);
        let mut idx = group * LEAF_FANOUT;
        while idx < self.data.len() && self.data[idx].key <= key {
            idx += 1;
        }
        idx
    }

    // Descend the separator levels to the leaf group that may contain the
    // boundary for `key`.
    fn leaf_group(&self, key: Key, upper: bool) -> usize {
        let mut node = 0usize;
        for depth in (0..self.index.len()).rev() {
            let level = &self.index[depth];
            let (start, end) = if depth == self.index.len() - 1 {
                (0, level.len())
            } else {
                let start = node * FANOUT;
                (start, (start + FANOUT).min(level.len()))
            };

            let mut chosen = end - 1;
            for j in start..end {
                let separator = level[j];
                if (upper && key < separator) || (!upper && key <= separator) {
                    chosen = j;
                    break;
                }
            }
            node = chosen;
        }
        node
    }

    /// True if this run holds a tombstone for exactly `(key, value)`. The
    /// run's filter gates the scan.
    pub fn tombstone_exists(&self, key: Key, value: Value) -> bool {
        self.get_tombstone(key, value).is_some()
    }

    /// Find the tombstone shadowing `(key, value)`, if present.
    pub fn get_tombstone(&self, key: Key, value: Value) -> Option<Record> {
        if self.tombstones == 0 || !self.filter.lookup(key) {
            return None;
        }
        let mut idx = self.lower_bound(key);
        while idx < self.data.len() && self.data[idx].key == key {
            let record = self.data[idx];
            if record.value > value {
                break;
            }
            if record.value == value && record.is_tombstone() {
                return Some(record);
            }
            idx += 1;
        }
        None
    }

    /// First live record with the given key.
    pub fn get(&self, key: Key) -> Option<Record> {
        let mut idx = self.lower_bound(key);
        while idx < self.data.len() && self.data[idx].key == key {
            if !self.data[idx].is_tombstone() {
                return Some(self.data[idx]);
            }
            idx += 1;
        }
        None
    }

    /// Tag the live `(key, value)` record as deleted. Only available on
    /// runs built with tagging enabled.
    pub fn delete_record(&self, key: Key, value: Value) -> bool {
        let Some(tags) = &self.delete_tags else {
            return false;
        };
        let mut idx = self.lower_bound(key);
        while idx < self.data.len() && self.data[idx].key == key {
            let record = self.data[idx];
            if record.value > value {
                break;
            }
            if record.value == value && !record.is_tombstone() {
                if !tags[idx].swap(true, Ordering::SeqCst) {
                    self.deleted.fetch_add(1, Ordering::SeqCst);
                }
                return true;
            }
            idx += 1;
        }
        false
    }

    /// Sum of record weights in `[lo_idx, hi_idx)`. Tombstones carry zero
    /// weight, so they contribute nothing.
    pub fn weight_in(&self, lo_idx: usize, hi_idx: usize) -> f64 {
        self.data[lo_idx..hi_idx].iter().map(|r| r.weight).sum()
    }

    /// Alias over the record weights in `[lo_idx, hi_idx)`, or None when the
    /// interval carries no weight.
    pub fn range_alias(&self, lo_idx: usize, hi_idx: usize) -> Option<Alias> {
        let weights: Vec<f64> = self.data[lo_idx..hi_idx].iter().map(|r| r.weight).collect();
        if weights.iter().sum::<f64>() <= 0.0 {
            return None;
        }
        Alias::new(&weights).ok()
    }

    /// Bytes held by the record array and separator index.
    pub fn memory_bytes(&self) -> usize {
        let index_bytes: usize = self
            .index
            .iter()
            .map(|level| level.len() * std::mem::size_of::<Key>())
            .sum();
        self.data.len() * std::mem::size_of::<Record>() + index_bytes
    }

    /// Bytes held by the tombstone filter.
    pub fn aux_memory_bytes(&self) -> usize {
        self.filter.memory_bytes()
    }

    /// Write the record array to `path` with a trailing CRC32. Delete tags
    /// are folded into the persisted headers.
    pub fn persist_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut payload = Vec::with_capacity(self.data.len() * ENCODED_LEN + 4);
        for idx in 0..self.data.len() {
            if let Some(record) = self.output_record_at(idx) {
                record.encode(&mut payload)?;
            }
        }
        let checksum = CRC32.checksum(&payload);
        payload.extend_from_slice(&checksum.to_be_bytes());
        fs::write(path, payload)?;
        Ok(())
    }

    /// Reload a run persisted with `persist_to`, verifying the checksum and
    /// sort order and rebuilding the index and tombstone filter.
    pub fn load<P: AsRef<Path>>(
        path: P,
        bloom_fpr: f64,
        bloom_hash_count: u32,
        tagging: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        if bytes.len() < 4 || (bytes.len() - 4) % ENCODED_LEN != 0 {
            return Err(errdata!("run file {} has a malformed length", path.display()));
        }

        let (payload, stored) = bytes.split_at(bytes.len() - 4);
        let stored = (&mut &stored[..]).read_u32::<BigEndian>()?;
        if CRC32.checksum(payload) != stored {
            return Err(Error::ChecksumMismatch(format!(
                "run file {}",
                path.display()
            )));
        }

        let mut reader = payload;
        let mut data = Vec::with_capacity(payload.len() / ENCODED_LEN);
        while !reader.is_empty() {
            data.push(Record::decode(&mut reader)?);
        }

        if !data.iter().tuple_windows().all(|(a, b)| a <= b) {
            return Err(errdata!("run file {} is not sorted", path.display()));
        }

        let mut tombstones = 0;
        let filter = BloomFilter::new(
            bloom_fpr,
            data.iter().filter(|r| r.is_tombstone()).count().max(1),
            bloom_hash_count,
        );
        for record in &data {
            if record.is_tombstone() {
                tombstones += 1;
                filter.insert(record.key);
            }
        }

        Ok(Self::assemble(data, filter, tombstones, tagging))
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("records", &self.data.len())
            .field("tombstones", &self.tombstones)
            .field("deleted", &self.deleted_count())
            .finish()
    }
}

fn build_index(data: &[Record]) -> Vec<Vec<Key>> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut levels = Vec::new();
    let leaf_separators: Vec<Key> = data
        .chunks(LEAF_FANOUT)
        .map(|group| group[group.len() - 1].key)
        .collect();
    levels.push(leaf_separators);

    while levels[levels.len() - 1].len() > FANOUT {
        let previous = &levels[levels.len() - 1];
        let next: Vec<Key> = previous
            .chunks(FANOUT)
            .map(|group| group[group.len() - 1])
            .collect();
        levels.push(next);
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn memtable_with(records: &[(u64, u64, bool)]) -> Memtable {
        let mt = Memtable::new(records.len().max(1), records.len().max(1), 0.01, 3, false);
        for &(key, value, tombstone) in records {
            assert!(mt.append(key, value, 1.0, tombstone));
        }
        mt
    }

    fn run_from(records: &[(u64, u64, bool)]) -> Run {
        Run::from_memtable(&memtable_with(records), 0.01, 3, false)
    }

    #[test]
    fn test_from_memtable_sorts() {
        let entries: Vec<(u64, u64, bool)> =
            [5u64, 3, 9, 1, 7].iter().map(|&k| (k, k, false)).collect();
        let run = run_from(&entries);
        assert_eq!(run.record_count(), 5);
        let keys: Vec<u64> = run.records().iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
        assert!(run.records().iter().tuple_windows().all(|(a, b)| a <= b));
    }

    #[test]
    fn test_construction_cancels_matched_pairs() {
        let run = run_from(&[(1, 1, false), (2, 2, false), (1, 1, true)]);
        // The (1, 1) record and its tombstone cancel.
        assert_eq!(run.record_count(), 1);
        assert_eq!(run.tombstone_count(), 0);
        assert_eq!(run.records()[0].key, 2);
    }

    #[test]
    fn test_unmatched_tombstone_survives() {
        let run = run_from(&[(2, 2, false), (1, 9, true)]);
        assert_eq!(run.record_count(), 2);
        assert_eq!(run.tombstone_count(), 1);
        assert!(run.tombstone_exists(1, 9));
        assert!(!run.tombstone_exists(1, 8));
        assert!(!run.tombstone_exists(2, 2));
    }

    #[test]
    fn test_bounds_on_large_run() {
        let entries: Vec<(u64, u64, bool)> = (0..1000u64).map(|k| (k * 2, k, false)).collect();
        let run = run_from(&entries);

        for &probe in &[0u64, 1, 2, 77, 500, 1997, 1998, 5000] {
            let lb = run.lower_bound(probe);
            let ub = run.upper_bound(probe);
            assert!(lb <= ub);
            // Records straddle the key correctly.
            if lb > 0 {
                assert!(run.records()[lb - 1].key < probe);
            }
            if lb < run.record_count() {
                assert!(run.records()[lb].key >= probe);
            }
            if ub > 0 {
                assert!(run.records()[ub - 1].key <= probe);
            }
            if ub < run.record_count() {
                assert!(run.records()[ub].key > probe);
            }
        }

        assert_eq!(run.lower_bound(5000), run.record_count());
        assert_eq!(run.upper_bound(5000), run.record_count());
        assert_eq!(run.lower_bound(0), 0);
    }

    #[test]
    fn test_bounds_against_linear_scan() {
        let mut rng = StdRng::seed_from_u64(7);
        let entries: Vec<(u64, u64, bool)> = (0..500)
            .map(|_| (rng.gen_range(0..10_000u64), 0, false))
            .collect();
        let run = run_from(&entries);

        for _ in 0..200 {
            let probe = rng.gen_range(0..10_500u64);
            let expected_lb = run.records().iter().position(|r| r.key >= probe);
            let expected_ub = run.records().iter().position(|r| r.key > probe);
            assert_eq!(
                run.lower_bound(probe),
                expected_lb.unwrap_or(run.record_count())
            );
            assert_eq!(
                run.upper_bound(probe),
                expected_ub.unwrap_or(run.record_count())
            );
        }
    }

    #[test]
    fn test_merge_combines_and_cancels() {
        // Older run holds the record, newer run holds its tombstone.
        let old = Arc::new(run_from(&[(1, 1, false), (3, 3, false)]));
        let new = Arc::new(run_from(&[(1, 1, true), (2, 2, false)]));

        let merged = Run::merge(&[old, new], 0.01, 3, false).unwrap();
        assert_eq!(merged.record_count(), 2);
        assert_eq!(merged.tombstone_count(), 0);
        let keys: Vec<u64> = merged.records().iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![2, 3]);
    }

    #[test]
    fn test_merge_preserves_duplicates() {
        let a = Arc::new(run_from(&[(1, 1, false)]));
        let b = Arc::new(run_from(&[(1, 1, false)]));
        let merged = Run::merge(&[a, b], 0.01, 3, false).unwrap();
        assert_eq!(merged.record_count(), 2);
    }

    #[test]
    fn test_merge_large_random() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut runs = Vec::new();
        let mut total = 0;
        for _ in 0..4 {
            let entries: Vec<(u64, u64, bool)> = (0..250)
                .map(|_| (rng.gen::<u64>(), rng.gen::<u64>(), false))
                .collect();
            total += entries.len();
            runs.push(Arc::new(run_from(&entries)));
        }
        let merged = Run::merge(&runs, 0.01, 3, false).unwrap();
        assert_eq!(merged.record_count(), total);
        assert!(merged.records().iter().tuple_windows().all(|(a, b)| a <= b));
    }

    #[test]
    fn test_get_skips_tombstones() {
        let run = run_from(&[(2, 2, false), (1, 9, true)]);
        assert_eq!(run.get(2).map(|r| r.value), Some(2));
        assert_eq!(run.get(1), None);
        assert_eq!(run.get_tombstone(1, 9).map(|r| r.value), Some(9));
    }

    #[test]
    fn test_delete_record_tagging() {
        let mt = memtable_with(&[(1, 1, false), (2, 2, false)]);
        let run = Run::from_memtable(&mt, 0.01, 3, true);

        assert!(run.delete_record(1, 1));
        assert!(run.slot_deleted(0));
        assert_eq!(run.deleted_count(), 1);
        // A second delete of the same record does not double count.
        assert!(run.delete_record(1, 1));
        assert_eq!(run.deleted_count(), 1);
        assert!(!run.delete_record(3, 3));
    }

    #[test]
    fn test_merge_folds_delete_tags() {
        let mt = memtable_with(&[(1, 1, false), (2, 2, false)]);
        let run = Arc::new(Run::from_memtable(&mt, 0.01, 3, true));
        assert!(run.delete_record(1, 1));

        let merged = Run::merge(&[run], 0.01, 3, true).unwrap();
        assert!(merged.records()[0].is_delete_tagged());
        assert_eq!(merged.deleted_count(), 1);
    }

    #[test]
    fn test_weight_accounting() {
        let mt = Memtable::new(4, 4, 0.01, 3, false);
        mt.append(1, 1, 2.0, false);
        mt.append(2, 2, 3.0, false);
        mt.append(3, 3, 0.0, true);
        let run = Run::from_memtable(&mt, 0.01, 3, false);

        assert!((run.total_weight() - 5.0).abs() < 1e-9);
        assert!((run.weight_in(0, run.record_count()) - 5.0).abs() < 1e-9);
        assert!(run.range_alias(0, run.record_count()).is_some());
    }

    #[test]
    fn test_persist_load_round_trip() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("run.dat");

        let entries: Vec<(u64, u64, bool)> = (0..300u64)
            .map(|k| (k, k, k % 7 == 0 && k > 200))
            .collect();
        let run = run_from(&entries);
        run.persist_to(&path).unwrap();

        let loaded = Run::load(&path, 0.01, 3, false).unwrap();
        assert_eq!(loaded.record_count(), run.record_count());
        assert_eq!(loaded.tombstone_count(), run.tombstone_count());
        assert_eq!(loaded.records(), run.records());
        for record in run.records().iter().filter(|r| r.is_tombstone()) {
            assert!(loaded.tombstone_exists(record.key, record.value));
        }
    }

    #[test]
    fn test_load_rejects_corruption() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("run.dat");

        let run = run_from(&[(1, 1, false), (2, 2, false)]);
        run.persist_to(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[3] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            Run::load(&path, 0.01, 3, false),
            Err(Error::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_empty_run() {
        let mt = Memtable::new(1, 1, 0.01, 3, false);
        let run = Run::from_memtable(&mt, 0.01, 3, false);
        assert_eq!(run.record_count(), 0);
        assert_eq!(run.lower_bound(5), 0);
        assert_eq!(run.upper_bound(5), 0);
        assert_eq!(run.min_key(), None);
    }
}
