//! Levels: fixed-capacity run containers at one age tier.
//!
//! Runs within a level are ordered oldest first, so the run at the highest
//! index is the freshest. A tiering level accumulates up to its run
//! capacity before the tree merges it downward; a leveling level keeps a
//! single merged run. Merging always moves data from a younger level into
//! an older one, which preserves the invariant that a tombstone is never
//! at an older level than the record it shadows.

use std::sync::Arc;

use crate::alias::Alias;
use crate::error::{Error, Result};
use crate::record::{Key, Value};
use crate::run::Run;

/// One sampling interval inside a run, produced for a query window.
pub struct SampleRange {
    pub level_idx: usize,
    pub run_idx: usize,
    pub run: Arc<Run>,
    /// First record index in the window.
    pub lo: usize,
    /// One past the last record index in the window.
    pub hi: usize,
    /// Sampling weight of the interval.
    pub weight: f64,
    /// Weight-proportional draw table over the interval, when weighted.
    pub alias: Option<Alias>,
}

/// A container of runs at one age tier.
#[derive(Debug, Clone)]
pub struct Level {
    level_no: usize,
    run_cap: usize,
    runs: Vec<Arc<Run>>,
}

impl Level {
    pub fn new(level_no: usize, run_cap: usize) -> Self {
        Self {
            level_no,
            run_cap,
            runs: Vec::new(),
        }
    }

    /// Rebuild a level from reloaded runs, e.g. during snapshot recovery.
    pub fn from_runs(level_no: usize, run_cap: usize, runs: Vec<Arc<Run>>) -> Result<Self> {
        if runs.len() > run_cap {
            return Err(Error::Capacity(format!(
                "level {level_no} holds at most {run_cap} runs, got {}",
                runs.len()
            )));
        }
        Ok(Self {
            level_no,
            run_cap,
            runs,
        })
    }

    pub fn level_no(&self) -> usize {
        self.level_no
    }

    pub fn run_cap(&self) -> usize {
        self.run_cap
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.runs.len() >= self.run_cap
    }

    pub fn runs(&self) -> &[Arc<Run>] {
        &self.runs
    }

    pub fn record_count(&self) -> usize {
        self.runs.iter().map(|r| r.record_count()).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.runs.iter().map(|r| r.tombstone_count()).sum()
    }

    /// Total weight of live records across the level's runs.
    pub fn total_weight(&self) -> f64 {
        self.runs.iter().map(|r| r.total_weight()).sum()
    }

    /// Tombstones as a share of the level's records; zero for an empty
    /// level. The tree's enforcement uses the capacity-relative ratio, this
    /// is the level-local view.
    pub fn tombstone_proportion(&self) -> f64 {
        let records = self.record_count();
        if records == 0 {
            return 0.0;
        }
        self.tombstone_count() as f64 / records as f64
    }

    pub fn memory_bytes(&self) -> usize {
        self.runs.iter().map(|r| r.memory_bytes()).sum()
    }

    pub fn aux_memory_bytes(&self) -> usize {
        self.runs.iter().map(|r| r.aux_memory_bytes()).sum()
    }

    /// Install a freshly built run as the level's newest entry.
    pub fn append_run(&mut self, run: Arc<Run>) -> Result<()> {
        if self.is_full() {
            return Err(Error::Capacity(format!(
                "level {} already holds {} runs",
                self.level_no, self.run_cap
            )));
        }
        self.runs.push(run);
        Ok(())
    }

    /// Tiering merge: fold the incoming younger level's runs into a single
    /// run appended here. A single-run incoming level is moved without
    /// rebuilding.
    pub fn absorb(
        &mut self,
        incoming: &Level,
        bloom_fpr: f64,
        bloom_hash_count: u32,
        tagging: bool,
    ) -> Result<()> {
        debug_assert!(incoming.level_no < self.level_no);
        if self.is_full() {
            return Err(Error::Capacity(format!(
                "level {} cannot absorb level {}",
                self.level_no, incoming.level_no
            )));
        }
        if incoming.is_empty() {
            return Ok(());
        }
        if incoming.run_count() == 1 {
            self.runs.push(Arc::clone(&incoming.runs[0]));
            return Ok(());
        }
        let merged = Run::merge(&incoming.runs, bloom_fpr, bloom_hash_count, tagging)?;
        self.runs.push(Arc::new(merged));
        Ok(())
    }

    /// Leveling merge: produce the replacement level holding one run built
    /// from the base level's run and the incoming younger level's runs.
    pub fn merge_levels(
        base: &Level,
        incoming: &Level,
        bloom_fpr: f64,
        bloom_hash_count: u32,
        tagging: bool,
    ) -> Result<Level> {
        debug_assert!(
            base.level_no > incoming.level_no || (base.level_no == 0 && incoming.level_no == 0)
        );

        let mut inputs: Vec<Arc<Run>> = Vec::with_capacity(base.run_count() + incoming.run_count());
        inputs.extend(base.runs.iter().cloned());
        inputs.extend(incoming.runs.iter().cloned());

        let mut level = Level::new(base.level_no, 1);
        if inputs.is_empty() {
            return Ok(level);
        }
        let merged = Run::merge(&inputs, bloom_fpr, bloom_hash_count, tagging)?;
        level.runs.push(Arc::new(merged));
        Ok(level)
    }

    /// Collect this level's sampling intervals for `[lo, hi]`. Runs whose
    /// interval is empty, or weightless under weighted sampling, are
    /// omitted.
    pub fn sample_ranges(&self, lo: Key, hi: Key, weighted: bool, out: &mut Vec<SampleRange>) {
        for (run_idx, run) in self.runs.iter().enumerate() {
            let lo_idx = run.lower_bound(lo);
            let hi_idx = run.upper_bound(hi);
            if lo_idx >= hi_idx {
                continue;
            }

            let (weight, alias) = if weighted {
                let weight = run.weight_in(lo_idx, hi_idx);
                if weight <= 0.0 {
                    continue;
                }
                (weight, run.range_alias(lo_idx, hi_idx))
            } else {
                ((hi_idx - lo_idx) as f64, None)
            };

            out.push(SampleRange {
                level_idx: self.level_no,
                run_idx,
                run: Arc::clone(run),
                lo: lo_idx,
                hi: hi_idx,
                weight,
                alias,
            });
        }
    }

    /// True if any run at position `first_run` or newer holds a tombstone
    /// for `(key, value)`. Each run's filter gates its scan.
    pub fn tombstone_check_from(&self, first_run: usize, key: Key, value: Value) -> bool {
        self.runs
            .iter()
            .skip(first_run)
            .any(|run| run.tombstone_exists(key, value))
    }

    /// Tag a live `(key, value)` record, trying the freshest run first.
    pub fn delete_record(&self, key: Key, value: Value) -> bool {
        self.runs.iter().rev().any(|run| run.delete_record(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Memtable;

    fn run_with(entries: &[(u64, u64, bool)], tagging: bool) -> Arc<Run> {
        let mt = Memtable::new(entries.len().max(1), entries.len().max(1), 0.01, 3, tagging);
        for &(key, value, tombstone) in entries {
            assert!(mt.append(key, value, 1.0, tombstone));
        }
        Arc::new(Run::from_memtable(&mt, 0.01, 3, tagging))
    }

    #[test]
    fn test_append_until_full() {
        let mut level = Level::new(0, 2);
        level.append_run(run_with(&[(1, 1, false)], false)).unwrap();
        level.append_run(run_with(&[(2, 2, false)], false)).unwrap();
        assert!(level.is_full());
        assert!(matches!(
            level.append_run(run_with(&[(3, 3, false)], false)),
            Err(Error::Capacity(_))
        ));
        assert_eq!(level.record_count(), 2);
    }

    #[test]
    fn test_absorb_merges_runs() {
        let mut incoming = Level::new(0, 2);
        incoming.append_run(run_with(&[(1, 1, false)], false)).unwrap();
        incoming.append_run(run_with(&[(2, 2, false)], false)).unwrap();

        let mut base = Level::new(1, 2);
        base.absorb(&incoming, 0.01, 3, false).unwrap();
        assert_eq!(base.run_count(), 1);
        assert_eq!(base.record_count(), 2);
    }

    #[test]
    fn test_absorb_moves_single_run() {
        let mut incoming = Level::new(0, 2);
        let run = run_with(&[(1, 1, false)], false);
        incoming.append_run(Arc::clone(&run)).unwrap();

        let mut base = Level::new(1, 2);
        base.absorb(&incoming, 0.01, 3, false).unwrap();
        // The run itself was moved, not rebuilt.
        assert!(Arc::ptr_eq(&base.runs()[0], &run));
    }

    #[test]
    fn test_merge_levels_cancels_across_levels() {
        let mut base = Level::new(1, 1);
        base.append_run(run_with(&[(1, 1, false), (2, 2, false)], false))
            .unwrap();

        let mut incoming = Level::new(0, 1);
        incoming.append_run(run_with(&[(1, 1, true)], false)).unwrap();

        let merged = Level::merge_levels(&base, &incoming, 0.01, 3, false).unwrap();
        assert_eq!(merged.level_no(), 1);
        assert_eq!(merged.run_count(), 1);
        assert_eq!(merged.record_count(), 1);
        assert_eq!(merged.tombstone_count(), 0);
    }

    #[test]
    fn test_sample_ranges_skip_empty_windows() {
        let mut level = Level::new(0, 2);
        level
            .append_run(run_with(&[(10, 1, false), (20, 2, false)], false))
            .unwrap();
        level
            .append_run(run_with(&[(100, 3, false)], false))
            .unwrap();

        let mut ranges = Vec::new();
        level.sample_ranges(5, 50, false, &mut ranges);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].run_idx, 0);
        assert_eq!(ranges[0].lo, 0);
        assert_eq!(ranges[0].hi, 2);
        assert_eq!(ranges[0].weight, 2.0);
    }

    #[test]
    fn test_tombstone_proportion() {
        let mut level = Level::new(0, 2);
        assert_eq!(level.tombstone_proportion(), 0.0);
        level
            .append_run(run_with(&[(1, 1, false), (2, 9, true), (3, 3, false), (4, 4, false)], false))
            .unwrap();
        assert!((level.tombstone_proportion() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_tombstone_check_respects_run_cursor() {
        let mut level = Level::new(0, 3);
        level.append_run(run_with(&[(1, 1, true)], false)).unwrap();
        level.append_run(run_with(&[(5, 5, false)], false)).unwrap();
        level.append_run(run_with(&[(2, 2, true)], false)).unwrap();

        // All runs probed.
        assert!(level.tombstone_check_from(0, 1, 1));
        assert!(level.tombstone_check_from(0, 2, 2));
        // Only runs newer than index 0.
        assert!(!level.tombstone_check_from(1, 1, 1));
        assert!(level.tombstone_check_from(1, 2, 2));
        assert!(!level.tombstone_check_from(3, 2, 2));
    }

    #[test]
    fn test_delete_record_prefers_newest_run() {
        let mut level = Level::new(0, 2);
        level.append_run(run_with(&[(1, 1, false)], true)).unwrap();
        level.append_run(run_with(&[(1, 1, false)], true)).unwrap();

        assert!(level.delete_record(1, 1));
        assert!(level.runs()[1].slot_deleted(0));
        assert!(!level.runs()[0].slot_deleted(0));
    }
}
