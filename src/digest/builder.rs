use crate::digest::{INDEX_MAGIC, SNAPSHOT_MAGIC};
use crate::error::{Error, Result};
use crate::format::{self, Metadata, read_metadata};
use crate::wire::codec::{write_fixed32, write_fixed64, write_varint};
use crate::wire::{ScopedFile, with_suffix};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How the event log is folded into a digest.
#[derive(Clone)]
pub struct DigestOptions {
    /// Milliseconds of profiling time between snapshots. Must be positive.
    pub interval_msec: u64,
    /// Fraction of each snapshot's total bytes that may be lumped into the
    /// reserved trace index 0 instead of being listed per trace. Zero
    /// keeps everything; must be below 1.
    pub precision: f64,
    /// Print progress to stderr while digesting.
    pub verbose: bool,
    /// Polled between events; set it to interrupt a long digest. The
    /// partial digest is still finalized.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for DigestOptions {
    fn default() -> Self {
        DigestOptions {
            interval_msec: 1000,
            precision: 0.0,
            verbose: false,
            cancel: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DigestStats {
    pub events_read: u64,
    pub snapshots_written: u64,
}

/// Converts raw sampled sizes back to estimated totals: each sampling tier
/// contributes the reciprocal of its probability.
struct ScalingTable {
    /// Sorted ascending by `max_bytes`, like the sampling table it came
    /// from.
    factors: Vec<(u64, f64)>,
}

impl ScalingTable {
    fn new(metadata: &Metadata) -> Self {
        ScalingTable {
            factors: metadata
                .sampling
                .iter()
                .map(|range| {
                    let factor = if range.probability == 0.0 {
                        0.0
                    } else {
                        1.0 / range.probability
                    };
                    (range.max_bytes, factor)
                })
                .collect(),
        }
    }

    fn scale(&self, raw_size: u64) -> i64 {
        match self.factors.iter().find(|&&(max, _)| max > raw_size) {
            Some(&(_, factor)) => (raw_size as f64 * factor).round() as i64,
            // Beyond the top tier everything was recorded, so the raw size
            // is already the true size.
            None => raw_size as i64,
        }
    }
}

struct Progress {
    started: Instant,
    total_bytes: u64,
}

impl Progress {
    fn report(&self, relative_time: f64, events_read: u64, bytes_read: u64) {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 || bytes_read == 0 {
            return;
        }
        let fraction = bytes_read as f64 / self.total_bytes.max(1) as f64;
        let eta = elapsed * (1.0 / fraction - 1.0);
        // The rate is given both as bytes read and as seconds of profiling
        // time digested per second of wall time.
        eprintln!(
            "Digested {} of data ({:.1}M events, {}) @ {}ps={:.1}sec/sec; {:.1}%; ETA {}",
            fmt_seconds(relative_time),
            events_read as f64 * 1e-6,
            fmt_bytes(bytes_read as f64),
            fmt_bytes(bytes_read as f64 / elapsed),
            relative_time / elapsed,
            100.0 * fraction,
            fmt_seconds(eta),
        );
    }
}

fn fmt_seconds(seconds: f64) -> String {
    humantime::format_duration(Duration::from_secs(seconds.max(0.0) as u64)).to_string()
}

fn fmt_bytes(bytes: f64) -> String {
    if bytes < 1.2e9 {
        format!("{:.1}MB", bytes / 1_048_576.0)
    } else {
        format!("{:.1}GB", bytes / 1_073_741_824.0)
    }
}

/// Fold `{filebase}.hpd` into `{filebase}.hpc`.
///
/// Streams the event log once, maintaining estimated live bytes per trace
/// index, and emits a snapshot every `interval_msec` of profiling time. A
/// truncated final event is treated as a clean end of input: a partial log
/// is a valid digest of a prefix of the run. The output file is removed
/// if digesting fails.
pub fn make_digest(filebase: &Path, options: &DigestOptions) -> Result<DigestStats> {
    if options.interval_msec == 0 {
        return Err(Error::BadConfig(
            "snapshot interval must be a positive number of milliseconds".into(),
        ));
    }
    if !(0.0..1.0).contains(&options.precision) {
        return Err(Error::BadConfig(format!(
            "invalid precision {}; must be in the range [0, 1)",
            options.precision
        )));
    }

    let metadata = {
        let mut hpm = BufReader::new(File::open(with_suffix(filebase, ".hpm"))?);
        read_metadata(&mut hpm)?
    };
    let scaling = ScalingTable::new(&metadata);

    let events_path = with_suffix(filebase, ".hpd");
    let mut events = BufReader::new(File::open(&events_path)?);
    let mut out = ScopedFile::create(with_suffix(filebase, ".hpc"))?;
    out.set_delete_on_drop(true);

    write_fixed32(&mut out, format::FORMAT_VERSION)?;
    write_fixed64(&mut out, metadata.start.sec as u64)?;
    write_fixed64(&mut out, metadata.start.nsec as u64)?;
    write_varint(&mut out, options.interval_msec)?;
    // The index lands at an offset we only know at the end; leave a
    // placeholder and come back for it.
    let index_offset_at = out.stream_position()?;
    write_fixed64(&mut out, 0)?;

    let mut progress = None;
    if options.verbose {
        let total_bytes = events.seek(SeekFrom::End(0))?;
        events.seek(SeekFrom::Start(0))?;
        let started_at = metadata
            .start
            .datetime()
            .map(|dt| format!(" (profile started {} UTC)", dt.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_default();
        eprintln!(
            "Digesting {}: {}{}",
            events_path.display(),
            fmt_bytes(total_bytes as f64),
            started_at
        );
        progress = Some(Progress {
            started: Instant::now(),
            total_bytes,
        });
    }

    let interval = options.interval_msec as f64 / 1000.0;
    let mut live_bytes: HashMap<u32, i64> = HashMap::new();
    let mut snapshot_offsets: Vec<u64> = Vec::new();
    let mut relative_time = 0.0f64;
    let mut next_snapshot = interval;
    let mut events_read = 0u64;
    let mut cancelled = false;

    loop {
        if let Some(cancel) = &options.cancel
            && cancel.load(Ordering::Relaxed)
        {
            // Interrupted: flush what exists and report the interruption.
            cancelled = true;
            break;
        }

        let event = match format::read_raw_event(&mut events) {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err) if err.is_eof() => {
                log::debug!("event stream ended mid-record after {events_read} events: {err}");
                break;
            }
            Err(err) => return Err(err),
        };

        let mut scaled = scaling.scale(event.size);
        if event.is_free() {
            scaled = -scaled;
        }
        if scaled != 0 {
            match live_bytes.entry(event.trace_index()) {
                Entry::Occupied(mut entry) => {
                    *entry.get_mut() += scaled;
                    if *entry.get() == 0 {
                        entry.remove();
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(scaled);
                }
            }
        }

        // A backwards clock step never rewinds digest time; otherwise a
        // jittery clock could oscillate around a snapshot boundary.
        let delta = event.delta_seconds();
        if delta > 0.0 {
            relative_time += delta;
        }
        while relative_time >= next_snapshot {
            snapshot_offsets.push(out.stream_position()?);
            write_snapshot(&mut out, &live_bytes, options.precision)?;
            next_snapshot += interval;
        }

        events_read += 1;
        if let Some(progress) = &progress
            && events_read % 500_000 == 0
        {
            progress.report(relative_time, events_read, events.stream_position()?);
        }
    }

    if progress.is_some() {
        eprintln!("Writing index with {} entries", snapshot_offsets.len());
    }

    let index_offset = out.stream_position()?;
    write_fixed32(&mut out, INDEX_MAGIC)?;
    write_varint(&mut out, snapshot_offsets.len() as u64)?;
    if let Some((&first, rest)) = snapshot_offsets.split_first() {
        write_varint(&mut out, first)?;
        let mut prev = first;
        for &offset in rest {
            write_varint(&mut out, offset - prev)?;
            prev = offset;
        }
    }

    out.seek(SeekFrom::Start(index_offset_at))?;
    write_fixed64(&mut out, index_offset)?;

    out.set_delete_on_drop(false);

    if cancelled {
        return Err(Error::Cancelled);
    }
    Ok(DigestStats {
        events_read,
        snapshots_written: snapshot_offsets.len() as u64,
    })
}

/// Emit one snapshot: entries sorted by descending size, optionally with
/// the smallest traces lumped into the reserved index 0.
fn write_snapshot<W: Write>(
    w: &mut W,
    live_bytes: &HashMap<u32, i64>,
    precision: f64,
) -> std::io::Result<()> {
    let mut sorted: Vec<(u32, i64)> = live_bytes.iter().map(|(&k, &v)| (k, v)).collect();
    let total: i64 = sorted.iter().map(|entry| entry.1).sum();
    sorted.sort_unstable_by(|a, b| b.1.cmp(&a.1));

    if precision > 0.0 {
        // Peel traces from the tail while their sum stays strictly below
        // the tolerated slop, then stand in a single "other" entry, which
        // takes the reserved no-trace index 0.
        let slop = (total as f64 * precision) as i64;
        let mut peeled = 0i64;
        let mut keep = sorted.len();
        while keep > 0 && peeled + sorted[keep - 1].1 < slop {
            peeled += sorted[keep - 1].1;
            keep -= 1;
        }
        sorted.truncate(keep);
        if peeled > 0 {
            let at = sorted.partition_point(|entry| entry.1 > peeled);
            sorted.insert(at, (0, peeled));
        }
    }

    write_fixed32(w, SNAPSHOT_MAGIC)?;
    write_varint(w, sorted.len() as u64)?;
    if let Some((&(first_index, first_size), rest)) = sorted.split_first() {
        write_varint(w, first_index as u64)?;
        write_varint(w, first_size as u64)?;
        let mut prev_size = first_size;
        for &(index, size) in rest {
            write_varint(w, index as u64)?;
            // Descending order makes every difference non-negative, so
            // they pack tightly as unsigned varints.
            write_varint(w, (prev_size - size) as u64)?;
            prev_size = size;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::reader::{read_digest_entry, read_digest_metadata};
    use crate::format::{WallTime, write_event, write_metadata};
    use crate::sampler::Sampler;
    use crate::wire::codec::{read_fixed32, read_varint};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn wt(sec: i64, nsec: u32) -> WallTime {
        WallTime { sec, nsec }
    }

    /// Lay down a `.hpm`/`.hpd` pair: the given sampling table, then one
    /// event per `(trace_index, size, alloc, at_seconds)` tuple.
    fn write_log(
        dir: &Path,
        rates: &[(u64, f64)],
        events: &[(u32, u64, bool, f64)],
    ) -> PathBuf {
        let base = dir.join("run");
        let sampler = Sampler::new(rates).unwrap();
        let start = wt(1_700_000_000, 0);

        let mut hpm = File::create(with_suffix(&base, ".hpm")).unwrap();
        write_metadata(&mut hpm, start, &sampler).unwrap();

        let mut hpd = File::create(with_suffix(&base, ".hpd")).unwrap();
        let mut last = start;
        for &(trace_index, size, alloc, at) in events {
            let timestamp = wt(start.sec + at as i64, ((at.fract()) * 1e9) as u32);
            write_event(&mut hpd, &mut last, timestamp, trace_index, size, alloc).unwrap();
        }
        base
    }

    #[test]
    fn rejects_zero_interval_and_bad_precision() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_log(dir.path(), &[], &[]);

        let mut options = DigestOptions {
            interval_msec: 0,
            ..DigestOptions::default()
        };
        assert!(matches!(
            make_digest(&base, &options),
            Err(Error::BadConfig(_))
        ));

        options.interval_msec = 1000;
        options.precision = 1.0;
        assert!(matches!(
            make_digest(&base, &options),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn first_interval_snapshot_uses_descending_delta_coding() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_log(
            dir.path(),
            &[],
            &[
                (1, 10, true, 0.1),
                (2, 20, true, 0.2),
                (3, 30, true, 0.3),
                // Pushes profiling time across the 1s boundary without
                // touching the live map.
                (0, 0, true, 1.5),
            ],
        );

        let stats = make_digest(&base, &DigestOptions::default()).unwrap();
        assert_eq!(stats.events_read, 4);
        assert_eq!(stats.snapshots_written, 1);

        let mut hpc = File::open(with_suffix(&base, ".hpc")).unwrap();
        let md = read_digest_metadata(&mut hpc).unwrap();
        assert_eq!(md.interval_seconds, 1.0);
        assert_eq!(md.offsets.len(), 1);

        // Wire-level check of the snapshot body: count 3, then
        // (3, 30), (2, 10), (1, 10).
        hpc.seek(SeekFrom::Start(md.offsets[0])).unwrap();
        assert_eq!(read_fixed32(&mut hpc).unwrap(), SNAPSHOT_MAGIC);
        let mut body = Vec::new();
        for _ in 0..7 {
            body.push(read_varint(&mut hpc).unwrap());
        }
        assert_eq!(body, vec![3, 3, 30, 2, 10, 1, 10]);

        let entries = read_digest_entry(&mut hpc, md.offsets[0]).unwrap();
        assert_eq!(entries[&1], 10);
        assert_eq!(entries[&2], 20);
        assert_eq!(entries[&3], 30);
    }

    #[test]
    fn precision_peels_the_tail_into_index_zero() {
        let live: HashMap<u32, i64> = [(1, 900), (2, 50), (3, 30), (4, 20)].into();
        let mut buf = Vec::new();
        write_snapshot(&mut buf, &live, 0.1).unwrap();

        let entries = read_digest_entry(&mut std::io::Cursor::new(buf), 0).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[&1], 900);
        assert_eq!(entries[&2], 50);
        assert_eq!(entries[&0], 50);
    }

    #[test]
    fn zero_precision_peels_nothing() {
        let live: HashMap<u32, i64> = [(1, 900), (2, 50), (3, 30), (4, 20)].into();
        let mut buf = Vec::new();
        write_snapshot(&mut buf, &live, 0.0).unwrap();

        let entries = read_digest_entry(&mut std::io::Cursor::new(buf), 0).unwrap();
        assert_eq!(entries.len(), 4);
        assert!(!entries.contains_key(&0));
    }

    #[test]
    fn scaling_uses_reciprocal_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        // Allocations under 1 KiB were sampled at 50%, so their sizes
        // scale by 2; larger ones were always recorded.
        let base = write_log(
            dir.path(),
            &[(1024, 0.5)],
            &[
                (1, 100, true, 0.1),
                (2, 4096, true, 0.2),
                (0, 0, true, 1.5),
            ],
        );

        make_digest(&base, &DigestOptions::default()).unwrap();
        let mut hpc = File::open(with_suffix(&base, ".hpc")).unwrap();
        let md = read_digest_metadata(&mut hpc).unwrap();
        let entries = read_digest_entry(&mut hpc, md.offsets[0]).unwrap();
        assert_eq!(entries[&1], 200);
        assert_eq!(entries[&2], 4096);
    }

    #[test]
    fn frees_cancel_allocations_and_empty_traces_vanish() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_log(
            dir.path(),
            &[],
            &[
                (1, 100, true, 0.1),
                (2, 64, true, 0.2),
                (1, 100, false, 0.3),
                (0, 0, true, 1.5),
            ],
        );

        make_digest(&base, &DigestOptions::default()).unwrap();
        let mut hpc = File::open(with_suffix(&base, ".hpc")).unwrap();
        let md = read_digest_metadata(&mut hpc).unwrap();
        let entries = read_digest_entry(&mut hpc, md.offsets[0]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[&2], 64);
    }

    #[test]
    fn truncated_final_event_is_a_benign_end() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_log(
            dir.path(),
            &[],
            &[
                (1, 100, true, 0.1),
                (0, 0, true, 1.5),
                (2, 64, true, 1.6),
            ],
        );
        let hpd = with_suffix(&base, ".hpd");
        let len = std::fs::metadata(&hpd).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&hpd).unwrap();
        file.set_len(len - 2).unwrap();

        let stats = make_digest(&base, &DigestOptions::default()).unwrap();
        assert_eq!(stats.events_read, 2);
        assert_eq!(stats.snapshots_written, 1);
    }

    #[test]
    fn cancel_finalizes_a_partial_digest() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_log(dir.path(), &[], &[(1, 100, true, 0.1)]);

        let cancel = Arc::new(AtomicBool::new(true));
        let options = DigestOptions {
            cancel: Some(Arc::clone(&cancel)),
            ..DigestOptions::default()
        };
        match make_digest(&base, &options) {
            Err(Error::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }

        // The partial file survives and its (empty) index parses.
        let mut hpc = File::open(with_suffix(&base, ".hpc")).unwrap();
        let md = read_digest_metadata(&mut hpc).unwrap();
        assert!(md.offsets.is_empty());
    }

    #[test]
    fn missing_event_file_removes_the_half_written_digest() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_log(dir.path(), &[], &[]);
        std::fs::remove_file(with_suffix(&base, ".hpd")).unwrap();

        assert!(make_digest(&base, &DigestOptions::default()).is_err());
        assert!(!with_suffix(&base, ".hpc").exists());
    }

    #[test]
    fn multiple_intervals_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        // One 10-byte allocation every second of profiling time, placed
        // half an interval past each boundary.
        let events: Vec<(u32, u64, bool, f64)> =
            (0..5).map(|i| (1, 10, true, i as f64 + 0.5)).collect();
        let base = write_log(dir.path(), &[], &events);

        let stats = make_digest(&base, &DigestOptions::default()).unwrap();
        // The event at 4.5s crosses the last boundary.
        assert_eq!(stats.snapshots_written, 4);

        let mut hpc = File::open(with_suffix(&base, ".hpc")).unwrap();
        let md = read_digest_metadata(&mut hpc).unwrap();
        assert!(md.offsets.windows(2).all(|w| w[0] < w[1]));

        // The snapshot at boundary k+1 includes every event up to and
        // including the one that crossed the boundary.
        for (k, &offset) in md.offsets.iter().enumerate() {
            let entries = read_digest_entry(&mut hpc, offset).unwrap();
            assert_eq!(entries[&1], 10 * (k as i64 + 2), "snapshot {k}");
        }
    }
}
