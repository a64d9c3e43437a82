//! Persistence worker: drains one camera's bounded channel into its
//! backing store, preserving arrival order.
//!
//! State machine: `Idle -> Running -> Draining -> Closed`. `Draining`
//! begins once capture has signalled completion (all senders dropped) and
//! ends only when every buffered frame is flushed. A worker never reaches
//! `Closed` with backlog outstanding unless it failed fatally, and that
//! failure is carried in its report. An in-flight write always completes;
//! cancellation is honoured between writes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::error::StoreError;
use crate::pipeline::counters::CameraCounters;
use crate::pipeline::store::FrameStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Closed = 3,
}

/// Shared observable worker state.
#[derive(Default)]
pub struct WorkerStateCell(AtomicU8);

impl WorkerStateCell {
    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Acquire) {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::Draining,
            _ => WorkerState::Closed,
        }
    }
}

/// Bounded backoff-retry for transient I/O failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
        }
    }
}

/// End-of-run report for one camera's persistence.
#[derive(Debug)]
pub struct WorkerReport {
    pub camera: usize,
    pub written: u64,
    /// Set when retries were exhausted or a fatal error occurred. Only
    /// this camera's persistence halted; capture elsewhere continued.
    pub fatal: Option<StoreError>,
    /// Frames still buffered when the worker gave up. Zero on a clean
    /// drain.
    pub abandoned: usize,
}

pub struct PersistenceWorker {
    camera: usize,
    rx: Receiver<Frame>,
    store: Box<dyn FrameStore>,
    counters: Arc<CameraCounters>,
    retry: RetryPolicy,
    write_timeout: Duration,
    state: Arc<WorkerStateCell>,
}

impl PersistenceWorker {
    pub fn new(
        camera: usize,
        rx: Receiver<Frame>,
        store: Box<dyn FrameStore>,
        counters: Arc<CameraCounters>,
        retry: RetryPolicy,
        write_timeout: Duration,
    ) -> Self {
        Self {
            camera,
            rx,
            store,
            counters,
            retry,
            write_timeout,
            state: Arc::new(WorkerStateCell::default()),
        }
    }

    pub fn state_handle(&self) -> Arc<WorkerStateCell> {
        Arc::clone(&self.state)
    }

    pub async fn run(mut self) -> WorkerReport {
        self.state.set(WorkerState::Running);
        debug!("camera {} persistence running", self.camera);

        let mut fatal: Option<StoreError> = None;
        loop {
            if self.rx.is_disconnected() && self.state.get() == WorkerState::Running {
                self.state.set(WorkerState::Draining);
                debug!(
                    "camera {} draining {} buffered frames",
                    self.camera,
                    self.rx.len()
                );
            }

            match self.rx.recv_async().await {
                Ok(frame) => match self.write_with_retry(&frame).await {
                    Ok(()) => self.counters.record_out(),
                    Err(e) => {
                        error!(
                            "camera {} persistence halted at sequence {}: {e}",
                            self.camera, frame.meta.sequence
                        );
                        fatal = Some(e);
                        break;
                    }
                },
                // Disconnected and empty: the drain is complete.
                Err(_) => break,
            }
        }

        if self.state.get() == WorkerState::Running {
            self.state.set(WorkerState::Draining);
        }

        if let Err(e) = self.store.flush_and_close() {
            error!("camera {} store close failed: {e}", self.camera);
            if fatal.is_none() {
                fatal = Some(e);
            }
        }

        let abandoned = self.rx.len();
        self.state.set(WorkerState::Closed);
        info!(
            "camera {} persistence closed: {} written, {} abandoned",
            self.camera,
            self.counters.out_count(),
            abandoned
        );

        WorkerReport {
            camera: self.camera,
            written: self.counters.out_count(),
            fatal,
            abandoned,
        }
    }

    /// One durable write with bounded exponential backoff on retryable
    /// failures. A write that succeeds but overruns the configured
    /// timeout is reported and counted, never aborted mid-flight.
    async fn write_with_retry(&mut self, frame: &Frame) -> Result<(), StoreError> {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            match self.store.write(frame) {
                Ok(()) => {
                    if started.elapsed() > self.write_timeout {
                        warn!(
                            "camera {} write of sequence {} overran its {}ms budget",
                            self.camera,
                            frame.meta.sequence,
                            self.write_timeout.as_millis()
                        );
                        self.counters.record_slow_write();
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let backoff = self.retry.initial_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        "camera {} retryable write failure (attempt {attempt}/{}): {e}",
                        self.camera, self.retry.max_retries
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io;
    use std::sync::Mutex;

    fn frame(camera: usize, seq: u64) -> Frame {
        Frame::new(Bytes::from(vec![seq as u8; 12]), camera, seq, (2, 2))
    }

    /// In-memory store recording the sequence order it saw.
    #[derive(Default)]
    struct MemStore {
        written: Arc<Mutex<Vec<u64>>>,
        closes: Arc<Mutex<u32>>,
    }

    impl FrameStore for MemStore {
        fn write(&mut self, frame: &Frame) -> Result<(), StoreError> {
            self.written.lock().unwrap().push(frame.meta.sequence);
            Ok(())
        }

        fn flush_and_close(&mut self) -> Result<(), StoreError> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Fails every first attempt with a retryable error.
    struct FlakyStore {
        inner: MemStore,
        attempts: u32,
    }

    impl FrameStore for FlakyStore {
        fn write(&mut self, frame: &Frame) -> Result<(), StoreError> {
            self.attempts += 1;
            if self.attempts % 2 == 1 {
                return Err(StoreError::from_io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "transient",
                )));
            }
            self.inner.write(frame)
        }

        fn flush_and_close(&mut self) -> Result<(), StoreError> {
            self.inner.flush_and_close()
        }
    }

    /// Goes fatally wrong after `ok_writes` successes.
    struct DyingStore {
        inner: MemStore,
        ok_writes: u64,
    }

    impl FrameStore for DyingStore {
        fn write(&mut self, frame: &Frame) -> Result<(), StoreError> {
            if self.inner.written.lock().unwrap().len() as u64 >= self.ok_writes {
                return Err(StoreError::from_io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "disk gone",
                )));
            }
            self.inner.write(frame)
        }

        fn flush_and_close(&mut self) -> Result<(), StoreError> {
            self.inner.flush_and_close()
        }
    }

    #[tokio::test]
    async fn drains_in_order_and_closes_clean() {
        let (tx, rx) = flume::bounded(4);
        let counters = Arc::new(CameraCounters::new());
        let store = MemStore::default();
        let written = Arc::clone(&store.written);

        let worker = PersistenceWorker::new(
            0,
            rx,
            Box::new(store),
            Arc::clone(&counters),
            RetryPolicy::default(),
            Duration::from_secs(1),
        );
        let state = worker.state_handle();
        assert_eq!(state.get(), WorkerState::Idle);

        let handle = tokio::spawn(worker.run());
        for seq in 0..10 {
            counters.record_in();
            tx.send_async(frame(0, seq)).await.unwrap();
        }
        drop(tx);

        let report = handle.await.unwrap();
        assert!(report.fatal.is_none());
        assert_eq!(report.written, 10);
        assert_eq!(report.abandoned, 0);
        assert_eq!(state.get(), WorkerState::Closed);
        assert_eq!(counters.out_count(), counters.in_count());
        assert_eq!(*written.lock().unwrap(), (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (tx, rx) = flume::bounded(4);
        let counters = Arc::new(CameraCounters::new());
        let store = FlakyStore {
            inner: MemStore::default(),
            attempts: 0,
        };
        let written = Arc::clone(&store.inner.written);

        let worker = PersistenceWorker::new(
            0,
            rx,
            Box::new(store),
            Arc::clone(&counters),
            RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
            },
            Duration::from_secs(1),
        );
        let handle = tokio::spawn(worker.run());

        for seq in 0..5 {
            counters.record_in();
            tx.send_async(frame(0, seq)).await.unwrap();
        }
        drop(tx);

        let report = handle.await.unwrap();
        assert!(report.fatal.is_none());
        assert_eq!(report.written, 5);
        assert_eq!(*written.lock().unwrap(), (0..5).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn fatal_error_halts_only_this_camera_and_still_closes_store() {
        let (tx, rx) = flume::bounded(8);
        let counters = Arc::new(CameraCounters::new());
        let store = DyingStore {
            inner: MemStore::default(),
            ok_writes: 3,
        };
        let written = Arc::clone(&store.inner.written);
        let closes = Arc::clone(&store.inner.closes);

        let worker = PersistenceWorker::new(
            1,
            rx,
            Box::new(store),
            Arc::clone(&counters),
            RetryPolicy::default(),
            Duration::from_secs(1),
        );
        let state = worker.state_handle();
        let handle = tokio::spawn(worker.run());

        for seq in 0..8 {
            counters.record_in();
            tx.send_async(frame(1, seq)).await.unwrap();
        }
        drop(tx);

        let report = handle.await.unwrap();
        assert!(report.fatal.is_some());
        assert_eq!(report.written, 3);
        assert!(report.abandoned > 0);
        assert_eq!(state.get(), WorkerState::Closed);
        // The store was still flushed and closed on the failure path.
        assert_eq!(*closes.lock().unwrap(), 1);
        assert_eq!(*written.lock().unwrap(), vec![0, 1, 2]);
        assert!(counters.out_count() <= counters.in_count());
    }

    #[tokio::test]
    async fn no_write_ahead_under_slow_producer() {
        let (tx, rx) = flume::bounded(2);
        let counters = Arc::new(CameraCounters::new());
        let store = MemStore::default();

        let worker = PersistenceWorker::new(
            0,
            rx,
            Box::new(store),
            Arc::clone(&counters),
            RetryPolicy::default(),
            Duration::from_secs(1),
        );
        let handle = tokio::spawn(worker.run());

        for seq in 0..6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            counters.record_in();
            tx.send_async(frame(0, seq)).await.unwrap();
            assert!(counters.out_count() <= counters.in_count());
        }
        drop(tx);
        let report = handle.await.unwrap();
        assert_eq!(report.written, counters.in_count());
    }
}
