//! The LSM tree: write path, merge policy, and sampling orchestration.
//!
//! Writes land in the memtable; a full memtable flushes into level 0 as a
//! new run (tiering) or merges with the resident run (leveling). When a
//! level cannot accept an incoming batch, `merge_down` walks deeper until
//! it finds a level with room, growing the tree if none has, then merges
//! level into level moving downward. Merging strictly downward through
//! adjacent levels is what keeps every tombstone at a level at least as
//! fresh as the record it shadows.
//!
//! After any merge the receiving level's tombstone proportion is checked
//! against the configured cap, and a violating level is itself merged
//! down, cascading until every level is back under the cap.
//!
//! The single writer rebuilds the level vector on a working copy and
//! publishes it wholesale, so a failed merge leaves the tree untouched.
//! Samplers clone the level vector under a brief read lock and then work
//! on their own snapshot; runs are immutable, so no further coordination
//! is needed.

use std::path::Path;
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::config::{DeletePolicy, MergePolicy, TreeConfig};
use crate::error::{Error, Result};
use crate::level::Level;
use crate::memtable::Memtable;
use crate::record::{Key, Record, Value};
use crate::run::Run;
use crate::manifest;
use crate::sampler::SampleQuery;

/// A write-optimized ordered store with independent range sampling.
/// Level 0 is the freshest level; one writer, many samplers.
pub struct LsmTree {
    config: TreeConfig,
    memtable: Memtable,
    levels: RwLock<Vec<Arc<Level>>>,
}

impl LsmTree {
    /// Create an empty tree.
    pub fn new(config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let memtable = Self::build_memtable(&config);
        Ok(Self {
            config,
            memtable,
            levels: RwLock::new(Vec::new()),
        })
    }

    /// Reload a tree from the snapshot in `config.dir`.
    pub fn load(config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let levels = manifest::load(&config)?;
        let memtable = Self::build_memtable(&config);
        Ok(Self {
            config,
            memtable,
            levels: RwLock::new(levels),
        })
    }

    fn build_memtable(config: &TreeConfig) -> Memtable {
        Memtable::new(
            config.memtable_capacity,
            config.memtable_tombstone_capacity,
            config.bloom_fpr,
            config.bloom_hash_count,
            config.delete_policy == DeletePolicy::Tagging,
        )
    }

    /// Append a record with unit weight.
    pub fn append(&self, key: Key, value: Value, tombstone: bool) -> Result<bool> {
        self.append_weighted(key, value, 1.0, tombstone)
    }

    /// Append a record with an explicit sampling weight. Returns false when
    /// the memtable refuses the record, which for tombstones means the
    /// tombstone budget is spent.
    pub fn append_weighted(
        &self,
        key: Key,
        value: Value,
        weight: f64,
        tombstone: bool,
    ) -> Result<bool> {
        if self.memtable.is_full() {
            self.flush_memtable()?;
        }
        Ok(self.memtable.append(key, value, weight, tombstone))
    }

    /// Tag the live `(key, value)` record as deleted. Levels are searched
    /// first, the memtable last. Requires the tagging delete policy.
    pub fn delete_record(&self, key: Key, value: Value) -> Result<bool> {
        if self.config.delete_policy != DeletePolicy::Tagging {
            return Err(Error::InvalidOperation(
                "delete_record requires the tagging delete policy".to_string(),
            ));
        }
        let snapshot = self.levels_snapshot();
        for level in &snapshot {
            if level.delete_record(key, value) {
                return Ok(true);
            }
        }
        Ok(self.memtable.delete_record(key, value))
    }

    /// Draw `k` independent samples of live records with keys in
    /// `[lo, hi]`, appending them to `out`. Returns fewer than `k` records
    /// only when the window is empty or fully shadowed.
    pub fn range_sample<R: Rng>(
        &self,
        out: &mut Vec<Record>,
        lo: Key,
        hi: Key,
        k: usize,
        rng: &mut R,
    ) {
        let _pin = self.memtable.pin();
        let snapshot = self.levels_snapshot();
        SampleQuery::new(&self.memtable, &snapshot, &self.config, lo, hi).execute(k, rng, out);
    }

    /// Records across the memtable and all levels.
    pub fn record_count(&self) -> usize {
        let levels: usize = self
            .levels_snapshot()
            .iter()
            .map(|l| l.record_count())
            .sum();
        levels + self.memtable.record_count()
    }

    /// Tombstones across the memtable and all levels.
    pub fn tombstone_count(&self) -> usize {
        let levels: usize = self
            .levels_snapshot()
            .iter()
            .map(|l| l.tombstone_count())
            .sum();
        levels + self.memtable.tombstone_count()
    }

    /// Number of levels.
    pub fn height(&self) -> usize {
        self.levels_snapshot().len()
    }

    /// Bytes held by record storage.
    pub fn memory_bytes(&self) -> usize {
        let levels: usize = self
            .levels_snapshot()
            .iter()
            .map(|l| l.memory_bytes())
            .sum();
        levels + self.memtable.memory_bytes()
    }

    /// Bytes held by auxiliary structures, i.e. the tombstone filters.
    pub fn aux_memory_bytes(&self) -> usize {
        let levels: usize = self
            .levels_snapshot()
            .iter()
            .map(|l| l.aux_memory_bytes())
            .sum();
        levels + self.memtable.aux_memory_bytes()
    }

    /// True if every level's tombstone count is within the configured
    /// proportion of its capacity.
    pub fn validate_tombstone_proportion(&self) -> bool {
        self.levels_snapshot().iter().all(|level| {
            let prop = level.tombstone_count() as f64 / self.level_capacity(level.level_no()) as f64;
            prop <= self.config.max_tombstone_prop
        })
    }

    /// Snapshot the tree into `dir` as a manifest plus run data files. The
    /// memtable is flushed first so the snapshot is complete.
    pub fn persist<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        self.flush_memtable()?;
        let snapshot = self.levels_snapshot();
        manifest::persist(&snapshot, dir.as_ref())?;
        tracing::info!(
            dir = %dir.as_ref().display(),
            levels = snapshot.len(),
            "persisted tree snapshot"
        );
        Ok(())
    }

    /// The tree's configuration.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    fn levels_snapshot(&self) -> Vec<Arc<Level>> {
        match self.levels.read() {
            Ok(levels) => levels.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn tagging(&self) -> bool {
        self.config.delete_policy == DeletePolicy::Tagging
    }

    fn run_cap(&self) -> usize {
        match self.config.merge_policy {
            MergePolicy::Leveling => 1,
            MergePolicy::Tiering => self.config.scale_factor,
        }
    }

    /// Record capacity of level `idx`: memtable capacity times
    /// `scale^(idx + 1)`.
    fn level_capacity(&self, idx: usize) -> usize {
        let mut capacity = self.config.memtable_capacity as u128;
        for _ in 0..=idx {
            capacity = capacity.saturating_mul(self.config.scale_factor as u128);
        }
        capacity.min(usize::MAX as u128) as usize
    }

    /// Move the memtable's contents into level 0, merging deeper levels
    /// first if level 0 cannot accept them. The new level vector is built
    /// on a working copy and published only after every merge succeeded.
    fn flush_memtable(&self) -> Result<()> {
        let count = self.memtable.record_count();
        if count == 0 {
            return Ok(());
        }

        let mut working = self.levels_snapshot();
        if !self.can_merge_with(&working, 0, count) {
            self.merge_down(&mut working, 0)?;
        }

        let run = Arc::new(Run::from_memtable(
            &self.memtable,
            self.config.bloom_fpr,
            self.config.bloom_hash_count,
            self.tagging(),
        ));
        let flushed = run.record_count();

        match self.config.merge_policy {
            MergePolicy::Tiering => {
                Arc::make_mut(&mut working[0]).append_run(run)?;
            }
            MergePolicy::Leveling => {
                let mut staging = Level::new(0, 1);
                staging.append_run(run)?;
                let merged = Level::merge_levels(
                    &working[0],
                    &staging,
                    self.config.bloom_fpr,
                    self.config.bloom_hash_count,
                    self.tagging(),
                )?;
                working[0] = Arc::new(merged);
            }
        }
        self.enforce_tombstone_maximum(&mut working, 0)?;

        match self.levels.write() {
            Ok(mut levels) => *levels = working,
            Err(poisoned) => *poisoned.into_inner() = working,
        }
        tracing::debug!(records = count, flushed, "flushed memtable");

        // Samplers pin the memtable for the duration of a query; wait for
        // them to drain before recycling the slots.
        while !self.memtable.truncate() {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Merge level `idx` into the tree below it, recursively making room.
    fn merge_down(&self, working: &mut Vec<Arc<Level>>, idx: usize) -> Result<()> {
        let base = match self.find_mergable_level(working, idx) {
            Some(base) => base,
            None => self.grow(working)?,
        };

        let mut i = base;
        while i > idx {
            self.merge_level_pair(working, i, i - 1)?;
            self.enforce_tombstone_maximum(working, i)?;
            i -= 1;
        }
        Ok(())
    }

    /// Find the first level below `idx` that can absorb the cascade
    /// starting at `idx`.
    fn find_mergable_level(&self, working: &[Arc<Level>], idx: usize) -> Option<usize> {
        let mut incoming = working.get(idx).map_or(0, |l| l.record_count());
        for i in idx + 1..working.len() {
            if self.can_merge_with(working, i, incoming) {
                return Some(i);
            }
            incoming = working[i].record_count();
        }
        None
    }

    /// Whether level `idx` can accept `incoming` more records.
    fn can_merge_with(&self, working: &[Arc<Level>], idx: usize, incoming: usize) -> bool {
        let Some(level) = working.get(idx) else {
            return false;
        };
        match self.config.merge_policy {
            MergePolicy::Leveling => level.record_count() + incoming <= self.level_capacity(idx),
            MergePolicy::Tiering => level.run_count() < self.config.scale_factor,
        }
    }

    /// Append a fresh, empty level and return its index.
    fn grow(&self, working: &mut Vec<Arc<Level>>) -> Result<usize> {
        let new_idx = working.len();
        if new_idx >= self.config.memory_levels {
            return Err(Error::Capacity(format!(
                "memory level budget of {} exhausted",
                self.config.memory_levels
            )));
        }
        if let Some(last) = working.last() {
            // Tombstones in the oldest run must have been consumed before a
            // deeper level is exposed beneath them.
            debug_assert_eq!(
                last.runs().first().map_or(0, |r| r.tombstone_count()),
                0,
                "unconsumed tombstones in the oldest run at grow time"
            );
        }
        working.push(Arc::new(Level::new(new_idx, self.run_cap())));
        tracing::info!(level = new_idx, "grew tree");
        Ok(new_idx)
    }

    /// Merge the younger `incoming_idx` level into the adjacent older
    /// `base_idx` level and reset the younger level to empty.
    fn merge_level_pair(
        &self,
        working: &mut [Arc<Level>],
        base_idx: usize,
        incoming_idx: usize,
    ) -> Result<()> {
        match self.config.merge_policy {
            MergePolicy::Leveling => {
                let merged = Level::merge_levels(
                    &working[base_idx],
                    &working[incoming_idx],
                    self.config.bloom_fpr,
                    self.config.bloom_hash_count,
                    self.tagging(),
                )?;
                working[base_idx] = Arc::new(merged);
            }
            MergePolicy::Tiering => {
                let incoming = Arc::clone(&working[incoming_idx]);
                Arc::make_mut(&mut working[base_idx]).absorb(
                    &incoming,
                    self.config.bloom_fpr,
                    self.config.bloom_hash_count,
                    self.tagging(),
                )?;
            }
        }
        working[incoming_idx] = Arc::new(Level::new(incoming_idx, self.run_cap()));
        tracing::info!(base = base_idx, incoming = incoming_idx, "merged levels");
        Ok(())
    }

    /// Merge `idx` down if its tombstone proportion exceeds the cap.
    fn enforce_tombstone_maximum(&self, working: &mut Vec<Arc<Level>>, idx: usize) -> Result<()> {
        let Some(level) = working.get(idx) else {
            return Ok(());
        };
        let prop = level.tombstone_count() as f64 / self.level_capacity(idx) as f64;
        if prop > self.config.max_tombstone_prop {
            tracing::info!(
                level = idx,
                proportion = prop,
                cap = self.config.max_tombstone_prop,
                "tombstone proportion exceeded, merging down"
            );
            self.merge_down(working, idx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTree")
            .field("records", &self.record_count())
            .field("tombstones", &self.tombstone_count())
            .field("height", &self.height())
            .finish()
    }
}
