//! `blsm` is a persistent ordered key-value store built as a three-level
//! log-structured merge-tree.
//!
//! Writes land in a small in-memory component (C0) and are progressively
//! merged into two on-disk runs (C1, C2) by background threads:
//! - The mem-merge shovels C0 into a fresh C1 while writers keep going,
//!   garbage-collecting what it consumed.
//! - The disk-merge folds a frozen C1 into C2 once C1 outgrows the size
//!   ratio `R`, which the engine retunes after every disk merge to balance
//!   write amplification.
//!
//! Durability comes from a write-ahead log plus a persistent header record
//! committed by atomic rename; reads see a total order over stripped keys
//! across all levels, and snapshot iterators stay consistent while merges
//! run underneath them.

pub mod component;
pub mod engine;
pub mod error;
pub mod header;
pub mod memtable;
pub mod merge;
pub mod options;
pub mod rate_limiter;
pub mod stats;
pub mod tuple;
pub mod wal;

pub use engine::{Blsm, EngineMetrics, SnapshotIter, MIN_R};
pub use error::{Error, Result};
pub use merge::MergeScheduler;
pub use options::{BlsmOptions, LogMode};
pub use rate_limiter::RateLimiter;
pub use stats::{MergeStatsSnapshot, FORCE_INTERVAL};
pub use tuple::{LastWriterWins, Tuple, TupleMerger};
