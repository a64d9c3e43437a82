//! Per-camera progress counters.
//!
//! Single-writer-per-counter discipline: `in_count`, `stalls` and the
//! dropped-sequence list are written only by the capture task, `out_count`
//! and `slow_writes` only by that camera's persistence worker. Backlog
//! (`in_count - out_count`) is therefore computable at any instant without
//! a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam::utils::CachePadded;

#[derive(Default)]
pub struct CameraCounters {
    in_count: CachePadded<AtomicU64>,
    out_count: CachePadded<AtomicU64>,
    stalls: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    slow_writes: CachePadded<AtomicU64>,
    max_backlog: CachePadded<AtomicU64>,
    dropped_sequences: Mutex<Vec<u64>>,
}

/// Point-in-time copy of a camera's counters.
#[derive(Debug, Clone, Default)]
pub struct CounterSnapshot {
    pub in_count: u64,
    pub out_count: u64,
    pub stalls: u64,
    pub dropped: u64,
    pub slow_writes: u64,
    pub max_backlog: u64,
    pub dropped_sequences: Vec<u64>,
}

impl CameraCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture task: a frame was captured and handed to the channel.
    /// Returns the sequence number the frame was assigned.
    pub fn record_in(&self) -> u64 {
        let seq = self.in_count.fetch_add(1, Ordering::Relaxed);
        let backlog = (seq + 1).saturating_sub(self.out_count.load(Ordering::Relaxed));
        self.max_backlog.fetch_max(backlog, Ordering::Relaxed);
        seq
    }

    /// Worker: a frame was durably written.
    pub fn record_out(&self) {
        self.out_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture task: a frame was discarded (overflow policy or dead
    /// consumer). The sequence number is kept so gaps stay explicit.
    pub fn record_drop(&self, sequence: u64) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut seqs) = self.dropped_sequences.lock() {
            seqs.push(sequence);
        }
    }

    pub fn record_slow_write(&self) {
        self.slow_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_count(&self) -> u64 {
        self.in_count.load(Ordering::Relaxed)
    }

    pub fn out_count(&self) -> u64 {
        self.out_count.load(Ordering::Relaxed)
    }

    /// Outstanding frames captured but not yet persisted.
    pub fn backlog(&self) -> u64 {
        self.in_count().saturating_sub(self.out_count())
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            in_count: self.in_count(),
            out_count: self.out_count(),
            stalls: self.stalls.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            slow_writes: self.slow_writes.load(Ordering::Relaxed),
            max_backlog: self.max_backlog.load(Ordering::Relaxed),
            dropped_sequences: self
                .dropped_sequences
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default(),
        }
    }
}
