//! Append-only ledger of capture instants.
//!
//! One entry is recorded per lock-step cycle by the capture task (single
//! writer, no locking). The ledger feeds rate correction and the final
//! session statistics; it never drives control flow beyond pacing. An
//! optional sidecar file mirrors the entries as one wall-clock timestamp
//! per line for post-hoc synchronization analysis.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Observability summary over all recorded instants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerSummary {
    /// Mean inter-frame interval, seconds. Zero if fewer than two entries.
    pub mean_interval: f64,
    /// Elapsed time between the first and last entry, seconds.
    pub total_elapsed: f64,
    pub sample_count: usize,
}

pub struct TimestampLedger {
    entries: Vec<f64>,
    sidecar: Option<BufWriter<File>>,
}

impl TimestampLedger {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            sidecar: None,
        }
    }

    /// Ledger that mirrors every entry into `{base}_time_list.txt`.
    pub fn with_sidecar(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            entries: Vec::new(),
            sidecar: Some(BufWriter::new(file)),
        })
    }

    /// Append a capture instant (epoch seconds).
    pub fn record(&mut self, instant: f64) -> io::Result<()> {
        self.entries.push(instant);
        if let Some(w) = self.sidecar.as_mut() {
            writeln!(w, "{instant:.6}")?;
        }
        Ok(())
    }

    /// Inter-frame intervals between consecutive entries.
    pub fn diffs(&self) -> Vec<f64> {
        self.entries.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn summary(&self) -> LedgerSummary {
        let n = self.entries.len();
        if n < 2 {
            return LedgerSummary {
                mean_interval: 0.0,
                total_elapsed: 0.0,
                sample_count: n,
            };
        }
        let total = self.entries[n - 1] - self.entries[0];
        LedgerSummary {
            mean_interval: total / (n - 1) as f64,
            total_elapsed: total,
            sample_count: n,
        }
    }

    pub fn entries(&self) -> &[f64] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flush the sidecar. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.sidecar.take() {
            w.flush()?;
        }
        Ok(())
    }
}

impl Default for TimestampLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimestampLedger {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diffs_and_summary() {
        let mut ledger = TimestampLedger::new();
        for t in [10.0, 10.1, 10.2, 10.4] {
            ledger.record(t).unwrap();
        }
        let diffs = ledger.diffs();
        assert_eq!(diffs.len(), 3);
        assert!((diffs[2] - 0.2).abs() < 1e-12);

        let summary = ledger.summary();
        assert_eq!(summary.sample_count, 4);
        assert!((summary.total_elapsed - 0.4).abs() < 1e-12);
        assert!((summary.mean_interval - 0.4 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let ledger = TimestampLedger::new();
        let summary = ledger.summary();
        assert_eq!(summary.sample_count, 0);
        assert_eq!(summary.total_elapsed, 0.0);
    }

    #[test]
    fn sidecar_has_one_timestamp_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_time_list.txt");
        let mut ledger = TimestampLedger::with_sidecar(&path).unwrap();
        ledger.record(1718000000.125).unwrap();
        ledger.record(1718000000.158).unwrap();
        ledger.close().unwrap();
        ledger.close().unwrap(); // idempotent

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<f64> = text.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1] >= lines[0]);
    }
}
