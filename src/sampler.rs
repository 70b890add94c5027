//! Size-tiered sampling decisions.
//!
//! A sampler holds an ordered list of `(max_bytes, probability)` ranges.
//! An allocation of `n` bytes is governed by the first range whose
//! `max_bytes` exceeds `n`; anything larger than every range is always
//! recorded.

use crate::error::{Error, Result};
use crate::wire::codec::{write_fixed32, write_fixed64, write_varint};
use std::io::Write;

/// Fixed default seed so sampling decisions are reproducible run to run.
const DEFAULT_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// A small linear-congruential generator. Far from cryptographic, but
/// cheap enough to run on every allocation; the decision only needs the
/// top 32 bits to be well mixed.
#[derive(Debug)]
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Lcg(seed)
    }

    #[inline]
    fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 32) as u32
    }
}

#[derive(Clone, Copy, Debug)]
struct Range {
    max_bytes: u64,
    probability: f64,
    /// `round(probability * 2^32)`, compared against a uniform u32 draw.
    /// A value of 2^32 can never lose the comparison, so p = 1 never
    /// consults the generator.
    threshold: u64,
}

#[derive(Debug)]
pub struct Sampler {
    /// Sorted ascending by `max_bytes`, no duplicates.
    ranges: Vec<Range>,
    rng: Lcg,
}

impl Sampler {
    /// Build a sampler from `(max_bytes, probability)` pairs. The pairs may
    /// arrive in any order; duplicates and probabilities outside [0, 1]
    /// are rejected.
    pub fn new(sampling_rates: &[(u64, f64)]) -> Result<Self> {
        let mut ranges = Vec::with_capacity(sampling_rates.len());
        for &(max_bytes, probability) in sampling_rates {
            if !(0.0..=1.0).contains(&probability) {
                return Err(Error::BadConfig(format!(
                    "{probability} is not a valid probability; it must be in the range [0, 1]"
                )));
            }
            ranges.push(Range {
                max_bytes,
                probability,
                threshold: (probability * 4_294_967_296.0).round() as u64,
            });
        }

        ranges.sort_unstable_by_key(|r| r.max_bytes);
        for pair in ranges.windows(2) {
            if pair[0].max_bytes == pair[1].max_bytes {
                return Err(Error::BadConfig(format!(
                    "repeated size entry {} in sampling rates",
                    pair[0].max_bytes
                )));
            }
        }

        Ok(Sampler {
            ranges,
            rng: Lcg::new(DEFAULT_SEED),
        })
    }

    /// Decide whether to record an allocation of `size` bytes.
    #[inline]
    pub fn sample(&mut self, size: u64) -> bool {
        // The range list is small; a linear scan beats a binary search.
        for range in &self.ranges {
            if range.max_bytes > size {
                return match range.threshold {
                    0 => false,
                    t if t > u32::MAX as u64 => true,
                    t => (self.rng.next_u32() as u64) < t,
                };
            }
        }
        // Bigger than all the ranges: always record.
        true
    }

    /// Serialize the table: varint count, then per range a fixed64
    /// `max_bytes` and the probability scaled to `u32::MAX` as a fixed32.
    pub fn write_state<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write_varint(w, self.ranges.len() as u64)?;
        for range in &self.ranges {
            write_fixed64(w, range.max_bytes)?;
            write_fixed32(w, scale_probability(range.probability))?;
        }
        Ok(())
    }
}

fn scale_probability(probability: f64) -> u32 {
    if probability >= 1.0 {
        u32::MAX
    } else {
        (probability * u32::MAX as f64).round() as u32
    }
}
