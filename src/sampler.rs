//! Two-phase independent range sampling.
//!
//! A query pins the memtable, snapshots the level pointers, and then runs
//! three phases:
//!
//! 1. **Ranges and weights.** Every run contributes the interval
//!    `[lower_bound(lo), upper_bound(hi))` and its sampling weight; the
//!    memtable contributes either its whole committed prefix (rejection
//!    mode) or the materialized in-range candidates. A zero total weight
//!    means the window is provably empty and the query bails out.
//! 2. **Alias construction.** One alias table is built over the
//!    contributor weights. Normalization is numerical hygiene only; the
//!    table needs proportionality, nothing more.
//! 3. **Batched rejection loop.** Each pass draws the outstanding sample
//!    count worth of contributor indices through the alias, then draws
//!    uniform (or weight-proportional) slots within each contributor.
//!    Candidates are admitted unless they are tombstones, fall outside the
//!    window, or are shadowed by a delete; rejected draws feed the next
//!    pass.
//!
//! A record is shadowed by a delete when its delete tag is set (tagging
//! policy), when the memtable holds a matching tombstone, or when any
//! strictly newer run does. Within the candidate's own level only runs at
//! higher positions are newer; pairs inside a single run were already
//! cancelled when the run was built.

use std::sync::Arc;

use rand::Rng;

use crate::alias::Alias;
use crate::config::{DeletePolicy, TreeConfig};
use crate::level::{Level, SampleRange};
use crate::memtable::Memtable;
use crate::metrics;
use crate::record::{Key, Record};

/// One contributor to a sampling query.
struct Contributor {
    weight: f64,
    source: Source,
}

enum Source {
    /// The memtable's whole committed prefix (rejection mode).
    MemtableWhole { cutoff: usize },
    /// Materialized in-range memtable records (candidate mode).
    MemtableCandidates {
        records: Vec<Record>,
        alias: Option<Alias>,
    },
    /// An interval of one run.
    Interval(SampleRange),
}

enum Origin<'a> {
    MemtableSlot(usize),
    MemtableCandidate,
    Run { range: &'a SampleRange, slot: usize },
}

/// A single range-sampling query over a consistent view of the tree.
pub(crate) struct SampleQuery<'a> {
    memtable: &'a Memtable,
    levels: &'a [Arc<Level>],
    lo: Key,
    hi: Key,
    tagging: bool,
    weighted: bool,
    rejection: bool,
    trigger: usize,
}

impl<'a> SampleQuery<'a> {
    pub(crate) fn new(
        memtable: &'a Memtable,
        levels: &'a [Arc<Level>],
        config: &TreeConfig,
        lo: Key,
        hi: Key,
    ) -> Self {
        Self {
            memtable,
            levels,
            lo,
            hi,
            tagging: config.delete_policy == DeletePolicy::Tagging,
            weighted: config.weighted,
            rejection: config.rejection_sampling,
            trigger: config.rejection_trigger,
        }
    }

    /// Fill `out` with `k` admitted records.
    pub(crate) fn execute<R: Rng>(&self, k: usize, rng: &mut R, out: &mut Vec<Record>) {
        out.clear();
        if k == 0 {
            return;
        }

        let (contributors, total_weight) = self.collect_contributors();
        if total_weight <= 0.0 {
            metrics::record_bailout();
            return;
        }

        let weights: Vec<f64> = contributors
            .iter()
            .map(|c| c.weight / total_weight)
            .collect();
        let Ok(alias) = Alias::new(&weights) else {
            metrics::record_bailout();
            return;
        };

        let memtable_only = contributors
            .iter()
            .all(|c| !matches!(c.source, Source::Interval(_)));

        let budget = k.saturating_mul(self.trigger);
        let mut attempts = 0usize;
        let mut remaining = k;
        let mut counts = vec![0usize; contributors.len()];
        let mut first_pass = true;

        while out.len() < k {
            for count in counts.iter_mut() {
                *count = 0;
            }
            for _ in 0..remaining {
                counts[alias.draw(rng)] += 1;
            }

            let mut admitted = 0usize;
            for (idx, &count) in counts.iter().enumerate() {
                for _ in 0..count {
                    attempts += 1;
                    if let Some(record) = self.try_draw(&contributors[idx], rng) {
                        out.push(record);
                        admitted += 1;
                    }
                }
            }
            remaining = k - out.len();
            if remaining == 0 {
                break;
            }

            // A rejection-mode query whose only contributor is the memtable
            // and whose first pass admitted nothing has an empty window.
            if first_pass && admitted == 0 && self.rejection && memtable_only {
                metrics::record_bailout();
                return;
            }
            first_pass = false;

            // A fully-shadowed window would otherwise loop forever; give up
            // once a pass admits nothing with the attempt budget spent.
            if admitted == 0 && attempts >= budget {
                metrics::record_bailout();
                return;
            }
        }
    }

    fn collect_contributors(&self) -> (Vec<Contributor>, f64) {
        let mut contributors = Vec::new();

        let memtable_range =
            self.memtable
                .sample_range(self.lo, self.hi, self.rejection, self.weighted);
        if memtable_range.weight > 0.0 {
            let source = match memtable_range.candidates {
                None => Source::MemtableWhole {
                    cutoff: memtable_range.cutoff,
                },
                Some(records) => Source::MemtableCandidates {
                    records,
                    alias: memtable_range.alias,
                },
            };
            contributors.push(Contributor {
                weight: memtable_range.weight,
                source,
            });
        }

        let mut ranges = Vec::new();
        for level in self.levels {
            level.sample_ranges(self.lo, self.hi, self.weighted, &mut ranges);
        }
        for range in ranges {
            contributors.push(Contributor {
                weight: range.weight,
                source: Source::Interval(range),
            });
        }

        let total = contributors.iter().map(|c| c.weight).sum();
        (contributors, total)
    }

    fn try_draw<R: Rng>(&self, contributor: &Contributor, rng: &mut R) -> Option<Record> {
        metrics::record_attempt();

        let (record, origin) = match &contributor.source {
            Source::MemtableWhole { cutoff } => {
                let slot = rng.gen_range(0..*cutoff);
                (self.memtable.record_at(slot)?, Origin::MemtableSlot(slot))
            }
            Source::MemtableCandidates { records, alias } => {
                let idx = match alias {
                    Some(alias) => alias.draw(rng),
                    None => rng.gen_range(0..records.len()),
                };
                (records[idx], Origin::MemtableCandidate)
            }
            Source::Interval(range) => {
                let offset = match &range.alias {
                    Some(alias) => alias.draw(rng),
                    None => rng.gen_range(0..range.hi - range.lo),
                };
                let slot = range.lo + offset;
                (range.run.record_at(slot)?, Origin::Run { range, slot })
            }
        };

        self.admit(&record, &origin).then_some(record)
    }

    fn admit(&self, record: &Record, origin: &Origin) -> bool {
        if record.is_tombstone() {
            metrics::record_tombstone_rejection();
            return false;
        }
        if record.key < self.lo || record.key > self.hi {
            metrics::record_bounds_rejection();
            return false;
        }
        if self.is_deleted(record, origin) {
            metrics::record_deletion_rejection();
            return false;
        }
        true
    }

    // A candidate is dead if its delete tag is set, or a matching tombstone
    // exists in the memtable or any strictly newer run.
    fn is_deleted(&self, record: &Record, origin: &Origin) -> bool {
        if self.tagging {
            if record.is_delete_tagged() {
                return true;
            }
            match origin {
                Origin::MemtableSlot(slot) => {
                    if self.memtable.slot_deleted(*slot) {
                        return true;
                    }
                }
                Origin::Run { range, slot } => {
                    if range.run.slot_deleted(*slot) {
                        return true;
                    }
                }
                Origin::MemtableCandidate => {}
            }
        }

        if self.memtable.check_tombstone(record.key, record.value) {
            return true;
        }

        // Memtable candidates have no runs above them.
        let Origin::Run { range, .. } = origin else {
            return false;
        };

        for level in &self.levels[..range.level_idx] {
            if level.tombstone_check_from(0, record.key, record.value) {
                return true;
            }
        }
        self.levels[range.level_idx].tombstone_check_from(
            range.run_idx + 1,
            record.key,
            record.value,
        )
    }
}
