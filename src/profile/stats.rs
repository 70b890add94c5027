//! The stats-gathering profiler: no event log, just a histogram of
//! allocation sizes by power-of-two bin, printed when profiling stops.

use comfy_table::{CellAlignment, Table, presets};
use std::collections::BTreeMap;
use std::ffi::c_void;

#[derive(Default)]
struct BinStats {
    num_allocs: u64,
    total_bytes: u64,
}

#[derive(Default)]
pub struct StatsProfiler {
    /// `ceil(log2 size)` to per-bin totals, kept sorted for the report.
    bins: BTreeMap<u32, BinStats>,
}

fn log2_round_up(value: u64) -> u32 {
    if value == 0 {
        0
    } else {
        64 - (value - 1).leading_zeros()
    }
}

impl StatsProfiler {
    pub fn new() -> Self {
        StatsProfiler::default()
    }

    pub fn handle_malloc(&mut self, _ptr: *mut c_void, size: usize) {
        let stats = self.bins.entry(log2_round_up(size as u64)).or_default();
        stats.num_allocs += 1;
        stats.total_bytes += size as u64;
    }

    pub fn handle_free(&mut self, _ptr: *mut c_void) {}

    pub fn handle_realloc(&mut self, _old: *mut c_void, new: *mut c_void, size: usize) {
        self.handle_malloc(new, size);
    }
}

impl Drop for StatsProfiler {
    fn drop(&mut self) {
        let mut table = Table::new();
        table.load_preset(presets::NOTHING);
        table.set_header(["Size", "Count", "Bytes"]);

        let mut prev_size: u64 = 0;
        for (&bin, stats) in &self.bins {
            let bin_size = 1u64.checked_shl(bin).unwrap_or(u64::MAX);
            table.add_row([
                format!("{} - {}", prev_size + 1, bin_size),
                stats.num_allocs.to_string(),
                stats.total_bytes.to_string(),
            ]);
            prev_size = bin_size;
        }
        for column in table.column_iter_mut() {
            column.set_cell_alignment(CellAlignment::Right);
        }

        eprintln!("-------------------------------------------");
        eprintln!("HEAP USAGE SUMMARY");
        eprintln!("{table}");
    }
}
