//! The online profiling side: the allocator patch, the reentrancy guard,
//! and the two profiler flavors it can dispatch to.

pub mod guard;
pub mod patch;
pub mod recording;
pub mod stats;
pub mod trace;

pub use patch::{is_profiling, start_profiler, start_stats, stop};
pub use recording::Recorder;
pub use stats::StatsProfiler;

use std::ffi::c_void;

/// The currently attached profiler. A tagged variant with direct dispatch;
/// the set of profilers is closed, so trait objects would buy nothing in
/// the allocation hot path.
pub(crate) enum ActiveProfiler {
    Recording(Recorder),
    Stats(StatsProfiler),
}

impl ActiveProfiler {
    pub(crate) fn handle_malloc(&mut self, ptr: *mut c_void, size: usize) {
        match self {
            ActiveProfiler::Recording(p) => p.handle_malloc(ptr, size),
            ActiveProfiler::Stats(p) => p.handle_malloc(ptr, size),
        }
    }

    pub(crate) fn handle_free(&mut self, ptr: *mut c_void) {
        match self {
            ActiveProfiler::Recording(p) => p.handle_free(ptr),
            ActiveProfiler::Stats(p) => p.handle_free(ptr),
        }
    }

    pub(crate) fn handle_realloc(&mut self, old: *mut c_void, new: *mut c_void, size: usize) {
        match self {
            ActiveProfiler::Recording(p) => p.handle_realloc(old, new, size),
            ActiveProfiler::Stats(p) => p.handle_realloc(old, new, size),
        }
    }
}
