//! The recording profiler: decides, per allocation, whether to sample it,
//! interns the call stack, and appends an event to the data file.

use crate::error::Result;
use crate::format::{self, TRACE_INDEX_HIGH_BITS, WallTime};
use crate::host::Host;
use crate::profile::trace::{trace_fingerprint, write_raw_trace};
use crate::sampler::Sampler;
use crate::wire::{ScopedFile, with_suffix};
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

/// What we remember about a live sampled pointer. The size is the size the
/// caller requested, not whatever the underlying allocator actually
/// reserved; there is no portable way to learn the latter.
struct LivePointer {
    trace_index: u32,
    size: u64,
}

/// The recording profiler.
///
/// Thread-compatible but not thread-safe: the allocator patch serializes
/// all calls into it (see `profile::patch` for how, and why the profiler
/// itself carries no lock).
pub struct Recorder {
    host: Arc<dyn Host>,
    sampler: Sampler,
    metadata_file: ScopedFile,
    data_file: ScopedFile,
    last_clock: WallTime,
    /// Next index to assign. Index 0 is reserved for "no trace".
    next_trace_index: u32,
    /// Fingerprint to trace index, so repeat call sites skip the metadata
    /// write.
    trace_index: HashMap<u32, u32>,
    live_set: HashMap<usize, LivePointer>,
    /// Writes that failed inside an allocator hook. Reported once on drop;
    /// failing loudly from inside the host's allocator is not an option.
    dropped_writes: u64,
}

impl Recorder {
    /// Open `{filebase}.hpm` and `{filebase}.hpd` and write the metadata
    /// header. Takes ownership of the sampler; its table is immutable from
    /// here on.
    pub fn create(host: Arc<dyn Host>, filebase: &Path, sampler: Sampler) -> Result<Self> {
        let mut metadata_file = ScopedFile::create(with_suffix(filebase, ".hpm"))?;
        let data_file = ScopedFile::create(with_suffix(filebase, ".hpd"))?;

        let start = WallTime::now();
        format::write_metadata(&mut metadata_file, start, &sampler)?;

        Ok(Recorder {
            host,
            sampler,
            metadata_file,
            data_file,
            last_clock: start,
            next_trace_index: 1,
            trace_index: HashMap::new(),
            live_set: HashMap::new(),
            dropped_writes: 0,
        })
    }

    pub fn handle_malloc(&mut self, ptr: *mut c_void, size: usize) {
        if !self.sampler.sample(size as u64) {
            return;
        }
        let timestamp = WallTime::now();
        let trace_index = self.trace_index();
        self.live_set.insert(
            ptr as usize,
            LivePointer {
                trace_index,
                size: size as u64,
            },
        );
        self.write_event(timestamp, trace_index, size as u64, true);
    }

    pub fn handle_free(&mut self, ptr: *mut c_void) {
        // Absent means the allocation was not sampled, or predates us.
        let Some(live) = self.live_set.remove(&(ptr as usize)) else {
            return;
        };
        let timestamp = WallTime::now();
        self.write_event(timestamp, live.trace_index, live.size, false);
    }

    /// Reallocation is treated as a free plus a malloc. Treating it more
    /// cleverly (a delta-sized malloc when the pointer is unchanged) runs
    /// into trouble when the old pointer was not selected by sampling.
    pub fn handle_realloc(&mut self, old: *mut c_void, new: *mut c_void, size: usize) {
        if !old.is_null() {
            self.handle_free(old);
        }
        self.handle_malloc(new, size);
    }

    fn write_event(&mut self, timestamp: WallTime, trace_index: u32, size: u64, alloc: bool) {
        if format::write_event(
            &mut self.data_file,
            &mut self.last_clock,
            timestamp,
            trace_index,
            size,
            alloc,
        )
        .is_err()
        {
            self.dropped_writes += 1;
        }
    }

    /// Intern the current call stack. New stacks get the next dense index
    /// and their raw trace appended to the metadata file; an exhausted
    /// index space or a failed metadata write pins the fingerprint to the
    /// reserved index 0.
    fn trace_index(&mut self) -> u32 {
        let fingerprint = trace_fingerprint(self.host.as_ref());
        if fingerprint == 0 {
            return 0;
        }
        if let Some(&index) = self.trace_index.get(&fingerprint) {
            return index;
        }

        let next = self.next_trace_index;
        let index = if next & TRACE_INDEX_HIGH_BITS != 0 {
            0
        } else if write_raw_trace(self.host.as_ref(), &mut self.metadata_file).is_err() {
            self.dropped_writes += 1;
            0
        } else {
            self.next_trace_index += 1;
            next
        };
        self.trace_index.insert(fingerprint, index);
        index
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.dropped_writes > 0 {
            log::warn!(
                "heap profile is incomplete: {} writes were dropped",
                self.dropped_writes
            );
        }
    }
}
