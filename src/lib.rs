//! Native core of a sampling heap profiler for runtimes with pluggable
//! allocator hooks.
//!
//! While attached, the profiler wraps the host's allocation domains and
//! records sampled allocations and frees to a binary event log
//! (`{base}.hpd`) alongside a metadata file (`{base}.hpm`) that interns
//! the call stacks. After the run, [`digest::make_digest`] folds the log
//! into periodic live-memory snapshots with a random-access index
//! (`{base}.hpc`).

pub mod digest;
pub mod error;
pub mod format;
pub mod host;
pub mod profile;
pub mod sampler;
pub mod wire;

pub use error::{Error, Result};
pub use profile::{is_profiling, start_profiler, start_stats, stop};
