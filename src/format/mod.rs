//! On-disk format of the profiler's three files.
//!
//! A profiling run writes two files side by side: `{base}.hpm` holds the
//! metadata header followed by one raw stack trace per newly-seen trace
//! index, and `{base}.hpd` is a bare stream of allocation events. The
//! digest builder later folds `.hpd` into a `{base}.hpc` file (see
//! [`crate::digest`]).
//!
//! All fixed-width fields are big-endian; varints follow the convention in
//! [`crate::wire::codec`].

use crate::error::{Error, Result};
use crate::sampler::Sampler;
use crate::wire::codec::{
    MAX_VARINT_LEN, put_fixed32, put_varint, read_fixed32, read_fixed64, read_string, read_varint,
    try_read_fixed32, write_fixed32, write_fixed64,
};
use std::io::{Read, Seek, Write};
use std::time::{SystemTime, UNIX_EPOCH};

pub const FORMAT_VERSION: u32 = 1;

/// Trace indices are 30-bit; the two high bits of the event head word carry
/// the delta sign and the alloc/free flag.
pub const TRACE_INDEX_HIGH_BITS: u32 = 0xc000_0000;
const DELTA_IS_NEGATIVE: u32 = 1 << 31;
const OPERATION_IS_FREE: u32 = 1 << 30;

/// Worst-case encoded event: head word plus three maximal varints.
const EVENT_BUF_LEN: usize = 4 + 3 * MAX_VARINT_LEN;

/// A wall-clock instant with nanosecond resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WallTime {
    pub sec: i64,
    /// Always in `[0, 1e9)`.
    pub nsec: u32,
}

/// A normalized difference between two instants: sign plus non-negative
/// magnitude, `nsec` in `[0, 1e9)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeDelta {
    pub negative: bool,
    pub sec: u64,
    pub nsec: u32,
}

impl WallTime {
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => WallTime {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            // A clock before the epoch still normalizes to nsec >= 0.
            Err(e) => {
                let d = e.duration();
                let mut sec = -(d.as_secs() as i64);
                let mut nsec = d.subsec_nanos();
                if nsec > 0 {
                    sec -= 1;
                    nsec = 1_000_000_000 - nsec;
                }
                WallTime { sec, nsec }
            }
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + 1e-9 * self.nsec as f64
    }

    pub fn datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.sec, self.nsec)
    }

    /// Compute `later - self` as a signed magnitude, exact to the
    /// nanosecond regardless of which instant is earlier.
    pub fn delta_to(&self, later: &WallTime) -> TimeDelta {
        let (negative, from, to) = if (later.sec, later.nsec) < (self.sec, self.nsec) {
            (true, later, self)
        } else {
            (false, self, later)
        };
        let mut sec = to.sec - from.sec;
        let mut nsec = to.nsec as i64 - from.nsec as i64;
        if nsec < 0 {
            nsec += 1_000_000_000;
            sec -= 1;
        }
        TimeDelta {
            negative,
            sec: sec as u64,
            nsec: nsec as u32,
        }
    }
}

impl TimeDelta {
    pub fn as_secs_f64(&self) -> f64 {
        let magnitude = self.sec as f64 + 1e-9 * self.nsec as f64;
        if self.negative { -magnitude } else { magnitude }
    }
}

/// One sampling tier as recovered from a metadata file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingRange {
    pub max_bytes: u64,
    pub probability: f64,
}

/// The decoded `.hpm` header.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub start: WallTime,
    /// Sorted ascending by `max_bytes`, as written.
    pub sampling: Vec<SamplingRange>,
}

/// Write the metadata header: version, start clock, sampling table.
pub fn write_metadata<W: Write>(w: &mut W, start: WallTime, sampler: &Sampler) -> std::io::Result<()> {
    write_fixed32(w, FORMAT_VERSION)?;
    write_fixed64(w, start.sec as u64)?;
    write_fixed64(w, start.nsec as u64)?;
    sampler.write_state(w)
}

pub fn read_metadata<R: Read + Seek>(r: &mut R) -> Result<Metadata> {
    let version = read_fixed32(r)?;
    if version != FORMAT_VERSION {
        return Err(Error::MalformedStream(format!(
            "unknown metadata format {version}"
        )));
    }

    let sec = read_fixed64(r)? as i64;
    let nsec = read_fixed64(r)? as u32;

    let num_ranges = read_varint(r)?;
    let mut sampling = Vec::with_capacity(num_ranges.min(1024) as usize);
    for _ in 0..num_ranges {
        let max_bytes = read_fixed64(r)?;
        let scaled = read_fixed32(r)?;
        sampling.push(SamplingRange {
            max_bytes,
            probability: scaled as f64 / u32::MAX as f64,
        });
    }

    Ok(Metadata {
        start: WallTime { sec, nsec },
        sampling,
    })
}

/// An event as stored on disk, before sign folding.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawEvent {
    head: u32,
    delta_sec: u64,
    delta_usec: u64,
    pub size: u64,
}

impl RawEvent {
    pub fn trace_index(&self) -> u32 {
        self.head & !TRACE_INDEX_HIGH_BITS
    }

    pub fn is_free(&self) -> bool {
        self.head & OPERATION_IS_FREE != 0
    }

    pub fn delta_seconds(&self) -> f64 {
        let magnitude = self.delta_sec as f64 + 1e-6 * self.delta_usec as f64;
        if self.head & DELTA_IS_NEGATIVE != 0 {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn signed_size(&self) -> i64 {
        let size = self.size as i64;
        if self.is_free() { -size } else { size }
    }
}

/// A decoded event: time since the previous event, the trace index, and
/// the requested size (negative for frees).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Event {
    pub delta_seconds: f64,
    pub trace_index: u32,
    pub size: i64,
}

/// Append one event and advance `last_clock` so successive events stay
/// delta-coded. The head word packs the delta sign (bit 31), the free flag
/// (bit 30), and the 30-bit trace index; the time delta is truncated to
/// microseconds to keep the varints short.
pub fn write_event<W: Write>(
    w: &mut W,
    last_clock: &mut WallTime,
    timestamp: WallTime,
    trace_index: u32,
    size: u64,
    alloc: bool,
) -> std::io::Result<()> {
    debug_assert_eq!(trace_index & TRACE_INDEX_HIGH_BITS, 0);

    let delta = last_clock.delta_to(&timestamp);
    *last_clock = timestamp;

    let mut head = trace_index;
    if delta.negative {
        head |= DELTA_IS_NEGATIVE;
    }
    if !alloc {
        head |= OPERATION_IS_FREE;
    }

    let mut buf = [0u8; EVENT_BUF_LEN];
    let mut at = put_fixed32(&mut buf, 0, head);
    at = put_varint(&mut buf, at, delta.sec);
    at = put_varint(&mut buf, at, (delta.nsec / 1000) as u64);
    at = put_varint(&mut buf, at, size);
    w.write_all(&buf[..at])
}

pub(crate) fn read_raw_event<R: Read + Seek>(r: &mut R) -> Result<Option<RawEvent>> {
    let Some(head) = try_read_fixed32(r)? else {
        return Ok(None);
    };
    let delta_sec = read_varint(r)?;
    let delta_usec = read_varint(r)?;
    let size = read_varint(r)?;
    Ok(Some(RawEvent {
        head,
        delta_sec,
        delta_usec,
        size,
    }))
}

/// Read the next event from an `.hpd` stream, or `None` at a clean end of
/// file. Truncation mid-event is an error.
pub fn read_event<R: Read + Seek>(r: &mut R) -> Result<Option<Event>> {
    Ok(read_raw_event(r)?.map(|raw| Event {
        delta_seconds: raw.delta_seconds(),
        trace_index: raw.trace_index(),
        size: raw.signed_size(),
    }))
}

/// One frame of a stored stack trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceFrame {
    pub filename: String,
    pub line: u32,
}

/// Read one raw trace from an `.hpm` stream.
///
/// The file stores frames innermost-first with line numbers offset by one
/// so the zero sentinel is unambiguous; the frames are returned reversed,
/// outermost call first.
pub fn read_raw_trace<R: Read + Seek>(r: &mut R) -> Result<Vec<TraceFrame>> {
    let mut frames = Vec::new();
    loop {
        let lineno = read_varint(r)?;
        if lineno == 0 {
            frames.reverse();
            return Ok(frames);
        }
        let filename = read_string(r)?;
        frames.push(TraceFrame {
            filename,
            line: (lineno - 1) as u32,
        });
    }
}
