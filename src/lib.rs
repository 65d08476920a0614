//! SiltDB: a write-optimized LSM storage engine with independent range
//! sampling.
//!
//! The engine keeps records in a log-structured merge tree. An append-only
//! memtable absorbs writes; when it fills, its contents flush into an
//! immutable sorted run at level 0, and levels of runs merge downward as
//! they fill in turn. The distinguishing operation is `range_sample`:
//! given a key window and a sample size, it returns independent uniform
//! (or weight-proportional) samples of the live records in the window,
//! drawn across every level with deleted and out-of-window candidates
//! resolved by rejection.
//!
//! # Architecture
//!
//! ```text
//!            writes                 samplers
//!              │                       │
//!              ▼                       ▼
//!       ┌────────────┐        ┌──────────────────┐
//!       │  Memtable  │◄───────┤  SampleQuery     │
//!       │ (slab +    │  pin   │  alias over      │
//!       │  atomics)  │        │  contributors,   │
//!       └─────┬──────┘        │  rejection loop  │
//!             │ flush         └────────┬─────────┘
//!             ▼                        │ snapshot
//!       ┌────────────┐                 │
//!       │  Level 0   │◄────────────────┘
//!       │ (runs)     │
//!       └─────┬──────┘
//!             │ merge down
//!             ▼
//!       ┌────────────┐
//!       │  Level 1   │
//!       └────────────┘
//!             ...
//! ```
//!
//! Concurrency model: one writer, many samplers. Runs are immutable, the
//! memtable publishes records through a reserved-index commit protocol,
//! and the writer publishes level changes wholesale so samplers always
//! work on a consistent snapshot.

pub mod alias;
pub mod config;
pub mod error;
pub mod filter;
pub mod level;
pub mod memtable;
pub mod metrics;
pub mod record;
pub mod run;
pub mod tmpfs;
pub mod tree;

mod manifest;
mod sampler;

pub use alias::Alias;
pub use config::{DeletePolicy, MergePolicy, TreeConfig};
pub use error::{Error, Result};
pub use filter::BloomFilter;
pub use level::Level;
pub use memtable::Memtable;
pub use metrics::SamplingMetrics;
pub use record::{Key, Record, Value};
pub use run::Run;
pub use tree::LsmTree;
