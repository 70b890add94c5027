//! Call-stack capture: a per-run fingerprint for interning, and the raw
//! trace record written to the metadata file on first sighting.
//!
//! Frames whose filename starts with `<` are host-internal synthetics and
//! are skipped on both paths, so the fingerprint and the stored trace
//! always describe the same frames.

use crate::host::Host;
use crate::wire::codec::{write_string, write_varint};
use std::io::Write;

const PRIME_1: u32 = 2654435761;
const PRIME_2: u32 = 2246822519;
const PRIME_5: u32 = 374761393;

/// The host runtime's tuple hash, so fingerprints match what the host
/// would compute for the same `(code, line)` sequence. Fingerprints are
/// never persisted; they only need to be stable within one run.
struct StackHash {
    acc: u32,
    count: u32,
}

impl StackHash {
    fn new() -> Self {
        StackHash {
            acc: PRIME_5,
            count: 0,
        }
    }

    fn mix_u32(&mut self, value: u32) {
        self.acc = self.acc.wrapping_add(value.wrapping_mul(PRIME_2));
        self.acc = self.acc.rotate_left(13);
        self.acc = self.acc.wrapping_mul(PRIME_1);
        self.count += 1;
    }

    fn mix_u64(&mut self, value: u64) {
        self.mix_u32(value as u32);
        self.mix_u32((value >> 32) as u32);
    }

    fn finish(&self) -> u32 {
        let value = self.acc.wrapping_add(self.count ^ (PRIME_5 ^ 3527539));
        if value == u32::MAX { 1546275796 } else { value }
    }
}

fn skip_frame(filename: &str) -> bool {
    filename.starts_with('<')
}

/// Fingerprint the current call stack, or 0 when no stack is available.
pub(crate) fn trace_fingerprint(host: &dyn Host) -> u32 {
    let mut hash = StackHash::new();
    let available = host.walk_stack(&mut |frame| {
        if !skip_frame(frame.filename) {
            hash.mix_u64(frame.code_id);
            hash.mix_u32(frame.line);
        }
    });
    if available { hash.finish() } else { 0 }
}

/// Append the current call stack to the metadata file: per retained frame
/// a varint `line + 1` and the length-prefixed filename, innermost frame
/// first, terminated by a zero varint.
pub(crate) fn write_raw_trace<W: Write>(host: &dyn Host, w: &mut W) -> std::io::Result<()> {
    let mut result = Ok(());
    host.walk_stack(&mut |frame| {
        if result.is_err() || skip_frame(frame.filename) {
            return;
        }
        result = write_varint(w, frame.line as u64 + 1)
            .and_then(|_| write_string(w, frame.filename));
    });
    result?;
    write_varint(w, 0)
}
