use std::path::PathBuf;

use crate::error::Result;
use crate::errinput;

/// Per-level merge policy.
///
/// Tiering keeps up to `scale_factor` runs per level and defers merging
/// until a level overflows. Leveling keeps a single merged run per level
/// and folds every incoming batch into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    Tiering,
    Leveling,
}

/// How deletions are represented.
///
/// Tombstone deletes append a matching tombstone record that cancels the
/// live record during merges. Tagging deletes locate the live record and
/// set its delete tag in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    Tombstone,
    Tagging,
}

/// Configuration for an LSM tree.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Directory holding persisted snapshots of the tree.
    pub dir: PathBuf,

    /// Memtable capacity in records (default: 32768).
    pub memtable_capacity: usize,

    /// Maximum number of tombstones the memtable accepts before refusing
    /// further tombstone appends (default: equal to the capacity).
    pub memtable_tombstone_capacity: usize,

    /// Level growth factor: level `i` holds `memtable_capacity * scale^(i+1)`
    /// records, and a tiering level holds up to `scale` runs (default: 8).
    pub scale_factor: usize,

    /// Maximum number of memory-resident levels. Growing past this budget
    /// fails; deeper tiers belong to an external on-disk collaborator
    /// (default: 16).
    pub memory_levels: usize,

    /// Maximum tombstone proportion per level before a forced merge-down
    /// (default: 0.1).
    pub max_tombstone_prop: f64,

    /// Merge policy (default: tiering).
    pub merge_policy: MergePolicy,

    /// Delete representation (default: tombstones).
    pub delete_policy: DeletePolicy,

    /// Sample the memtable by rejection over its full committed prefix
    /// instead of materializing the in-range candidates (default: true).
    pub rejection_sampling: bool,

    /// Weight-proportional sampling instead of uniform (default: false).
    pub weighted: bool,

    /// Bloom filter false positive rate for tombstone filters (default: 0.01).
    pub bloom_fpr: f64,

    /// Number of bloom filter hash functions (default: 3).
    pub bloom_hash_count: u32,

    /// Sampling attempt budget, as a multiple of the requested sample size.
    /// A pass that admits nothing after the budget is spent bails out
    /// (default: 32).
    pub rejection_trigger: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./siltdb"),
            memtable_capacity: 32 * 1024,
            memtable_tombstone_capacity: 32 * 1024,
            scale_factor: 8,
            memory_levels: 16,
            max_tombstone_prop: 0.1,
            merge_policy: MergePolicy::Tiering,
            delete_policy: DeletePolicy::Tombstone,
            rejection_sampling: true,
            weighted: false,
            bloom_fpr: 0.01,
            bloom_hash_count: 3,
            rejection_trigger: 32,
        }
    }
}

impl TreeConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable record capacity and matching tombstone capacity.
    pub fn memtable_capacity(mut self, capacity: usize) -> Self {
        self.memtable_capacity = capacity;
        self.memtable_tombstone_capacity = capacity;
        self
    }

    /// Set the memtable tombstone capacity independently.
    pub fn memtable_tombstone_capacity(mut self, capacity: usize) -> Self {
        self.memtable_tombstone_capacity = capacity;
        self
    }

    /// Set the level scale factor.
    pub fn scale_factor(mut self, scale: usize) -> Self {
        self.scale_factor = scale;
        self
    }

    /// Set the memory level budget.
    pub fn memory_levels(mut self, levels: usize) -> Self {
        self.memory_levels = levels;
        self
    }

    /// Set the per-level tombstone proportion cap.
    pub fn max_tombstone_prop(mut self, prop: f64) -> Self {
        self.max_tombstone_prop = prop;
        self
    }

    /// Set the merge policy.
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Set the delete policy.
    pub fn delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Enable or disable rejection sampling of the memtable.
    pub fn rejection_sampling(mut self, enabled: bool) -> Self {
        self.rejection_sampling = enabled;
        self
    }

    /// Enable weight-proportional sampling.
    pub fn weighted(mut self, enabled: bool) -> Self {
        self.weighted = enabled;
        self
    }

    /// Set the bloom filter false positive rate.
    pub fn bloom_fpr(mut self, fpr: f64) -> Self {
        self.bloom_fpr = fpr;
        self
    }

    /// Set the bloom filter hash function count.
    pub fn bloom_hash_count(mut self, count: u32) -> Self {
        self.bloom_hash_count = count;
        self
    }

    /// Set the sampling attempt budget multiplier.
    pub fn rejection_trigger(mut self, trigger: usize) -> Self {
        self.rejection_trigger = trigger;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.memtable_capacity == 0 {
            return Err(errinput!("memtable capacity must be positive"));
        }
        if self.scale_factor < 2 {
            return Err(errinput!("scale factor must be at least 2"));
        }
        if self.memory_levels == 0 {
            return Err(errinput!("at least one memory level is required"));
        }
        if !(0.0..=1.0).contains(&self.max_tombstone_prop) {
            return Err(errinput!(
                "tombstone proportion must be in [0, 1], got {}",
                self.max_tombstone_prop
            ));
        }
        if !(self.bloom_fpr > 0.0 && self.bloom_fpr < 1.0) {
            return Err(errinput!(
                "bloom false positive rate must be in (0, 1), got {}",
                self.bloom_fpr
            ));
        }
        if self.bloom_hash_count == 0 {
            return Err(errinput!("bloom hash count must be positive"));
        }
        if self.weighted && self.rejection_sampling {
            return Err(errinput!(
                "rejection sampling of the memtable is uniform-only; disable it for weighted trees"
            ));
        }
        if self.rejection_trigger == 0 {
            return Err(errinput!("rejection trigger must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TreeConfig::default();
        assert_eq!(config.memtable_capacity, 32 * 1024);
        assert_eq!(config.scale_factor, 8);
        assert_eq!(config.merge_policy, MergePolicy::Tiering);
        assert_eq!(config.delete_policy, DeletePolicy::Tombstone);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = TreeConfig::new("/tmp/test")
            .memtable_capacity(100)
            .scale_factor(2)
            .memory_levels(4)
            .max_tombstone_prop(0.01)
            .merge_policy(MergePolicy::Leveling);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.memtable_capacity, 100);
        assert_eq!(config.memtable_tombstone_capacity, 100);
        assert_eq!(config.scale_factor, 2);
        assert_eq!(config.memory_levels, 4);
        assert_eq!(config.merge_policy, MergePolicy::Leveling);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(TreeConfig::default().memtable_capacity(0).validate().is_err());
        assert!(TreeConfig::default().scale_factor(1).validate().is_err());
        assert!(TreeConfig::default().max_tombstone_prop(1.5).validate().is_err());
        assert!(TreeConfig::default().bloom_fpr(0.0).validate().is_err());
    }

    #[test]
    fn test_weighted_requires_candidate_sampling() {
        let config = TreeConfig::default().weighted(true);
        assert!(config.validate().is_err());

        let config = TreeConfig::default().weighted(true).rejection_sampling(false);
        assert!(config.validate().is_ok());
    }
}
