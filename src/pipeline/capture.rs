//! Lock-step paced capture loop.
//!
//! One task samples every camera in the same pass each cycle, so a single
//! wall-clock timestamp is valid for the whole cycle and the shared
//! ledger has exactly one writer. Inter-cycle sleep comes from the
//! [`RatePacer`]; a stall on one camera is counted and policy-handled
//! without skewing the cadence of the others.

use bytes::Bytes;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{frame::epoch_seconds, Frame, FrameSource};
use crate::pipeline::counters::CameraCounters;
use crate::pipeline::ledger::TimestampLedger;
use crate::pipeline::pacer::RatePacer;
use crate::{OverflowPolicy, StallPolicy};

/// One camera's end of the pipeline as seen by the capture loop.
pub struct CameraFeed {
    pub camera: usize,
    pub source: Box<dyn FrameSource>,
    tx: flume::Sender<Frame>,
    /// Receiver clone used to discard the oldest buffered frame. Held
    /// only under the drop-oldest overflow policy: under `Block` the
    /// worker must be the channel's sole receiver, so a worker that halts
    /// fatally disconnects it and sends fail instead of waiting forever.
    drain: Option<flume::Receiver<Frame>>,
    pub counters: Arc<CameraCounters>,
    last_payload: Option<Bytes>,
}

impl CameraFeed {
    pub fn new(
        camera: usize,
        source: Box<dyn FrameSource>,
        tx: flume::Sender<Frame>,
        drain: Option<flume::Receiver<Frame>>,
        counters: Arc<CameraCounters>,
    ) -> Self {
        Self {
            camera,
            source,
            tx,
            drain,
            counters,
            last_payload: None,
        }
    }
}

pub struct PacedCapture {
    feeds: Vec<CameraFeed>,
    pacer: RatePacer,
    ledger: TimestampLedger,
    total_cycles: u64,
    resolution: (u32, u32),
    overflow: OverflowPolicy,
    stall: StallPolicy,
    cancel: CancellationToken,
}

impl PacedCapture {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feeds: Vec<CameraFeed>,
        target_rate: f64,
        window: usize,
        total_cycles: u64,
        resolution: (u32, u32),
        overflow: OverflowPolicy,
        stall: StallPolicy,
        ledger: TimestampLedger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            feeds,
            pacer: RatePacer::new(target_rate, window),
            ledger,
            total_cycles,
            resolution,
            overflow,
            stall,
            cancel,
        }
    }

    /// Run to the duration bound (or cancellation), close the sources,
    /// drop the senders so every worker sees its channel closing, and
    /// hand the ledger back for the session summary.
    pub async fn run(mut self) -> TimestampLedger {
        info!(
            "capture running: {} cameras, {} cycles at {:.1} fps target",
            self.feeds.len(),
            self.total_cycles,
            self.pacer.target_rate()
        );

        for cycle in 0..self.total_cycles {
            let interval = self.pacer.next_interval();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("capture cancelled at cycle {cycle}");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            for i in 0..self.feeds.len() {
                self.sample_camera(i).await;
            }

            // One shared timestamp is valid for the whole lock-step pass.
            let now = epoch_seconds();
            self.pacer.observe(now);
            if let Err(e) = self.ledger.record(now) {
                warn!("timestamp sidecar write failed: {e}");
            }
        }

        for feed in &mut self.feeds {
            feed.source.close();
        }
        debug!("capture loop finished; closing channels");
        // Dropping the feeds drops the senders, which is the completion
        // signal the persistence workers drain on.
        drop(self.feeds);
        self.ledger
    }

    async fn sample_camera(&mut self, index: usize) {
        let stall = self.stall;
        let overflow = self.overflow;
        let resolution = self.resolution;
        let feed = &mut self.feeds[index];
        let payload = match feed.source.read() {
            Ok(payload) => {
                feed.last_payload = Some(payload.clone());
                Some(payload)
            }
            Err(e) => {
                feed.counters.record_stall();
                debug!("{e}");
                match stall {
                    // Keep cadence by re-issuing the previous payload
                    // under a fresh sequence number.
                    StallPolicy::RepeatLast => feed.last_payload.clone(),
                    StallPolicy::Skip => None,
                }
            }
        };

        let Some(payload) = payload else { return };
        let sequence = feed.counters.record_in();
        let frame = Frame::new(payload, feed.camera, sequence, resolution);

        match overflow {
            OverflowPolicy::Block => {
                // Natural backpressure: a full channel slows the pass.
                if feed.tx.send_async(frame).await.is_err() {
                    // Worker died fatally; other cameras keep going.
                    feed.counters.record_drop(sequence);
                }
            }
            OverflowPolicy::DropOldest => {
                let Some(drain) = feed.drain.as_ref() else {
                    // No drain handle: a full channel is a plain drop.
                    feed.counters.record_drop(sequence);
                    return;
                };
                let mut frame = frame;
                loop {
                    match feed.tx.try_send(frame) {
                        Ok(()) => break,
                        Err(flume::TrySendError::Full(f)) => {
                            if let Ok(oldest) = drain.try_recv() {
                                feed.counters.record_drop(oldest.meta.sequence);
                            }
                            frame = f;
                        }
                        Err(flume::TrySendError::Disconnected(f)) => {
                            feed.counters.record_drop(f.meta.sequence);
                            break;
                        }
                    }
                }
            }
        }
    }
}
