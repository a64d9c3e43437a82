//! Recording session orchestration.
//!
//! Lifecycle: device discovery -> capture start -> persistence start ->
//! duration-bounded run -> ordered shutdown -> drain confirmation ->
//! summary statistics. Per-camera failures are isolated; the session
//! always emits a final summary, even on partial failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capture::{DeviceProbe, DeviceRegistry, SourceFactory};
use crate::error::{SessionError, StoreError};
use crate::pipeline::capture::{CameraFeed, PacedCapture};
use crate::pipeline::counters::{CameraCounters, CounterSnapshot};
use crate::pipeline::ledger::{LedgerSummary, TimestampLedger};
use crate::pipeline::store::{
    container_path, sidecar_path, stage_dir, Compactor, ContainerStore, DiscreteFileStore,
    FrameStore, StagedStore,
};
use crate::pipeline::worker::{PersistenceWorker, RetryPolicy, WorkerReport};
use crate::{Config, DevicePolicy, OverflowPolicy, PersistMode};

/// Compaction poll cadence for the two-phase strategy, as a fraction of
/// the frame interval.
const COMPACTION_POLL_DIVISOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    DevicesValidated,
    Capturing,
    Draining,
    Closed,
    Failed,
}

/// Terminal status of one requested camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraOutcome {
    Completed,
    DeviceUnavailable,
    FatalIo(String),
}

#[derive(Debug, Clone)]
pub struct CameraReport {
    pub camera: usize,
    pub outcome: CameraOutcome,
    pub counters: CounterSnapshot,
}

/// Final statistics, produced even on partial failure.
#[derive(Debug)]
pub struct SessionSummary {
    pub requested_cameras: usize,
    pub active_cameras: usize,
    pub cameras: Vec<CameraReport>,
    pub ledger: LedgerSummary,
    /// Mean observed frame rate over the whole run, frames per second.
    pub observed_rate: f64,
    pub requested_duration: Duration,
    pub elapsed: Duration,
}

impl SessionSummary {
    /// Difference between what was asked for and what happened.
    pub fn duration_delta(&self) -> f64 {
        self.elapsed.as_secs_f64() - self.requested_duration.as_secs_f64()
    }
}

struct ActiveCamera {
    camera: usize,
    counters: Arc<CameraCounters>,
    worker: JoinHandle<WorkerReport>,
    staging_done: Option<oneshot::Sender<()>>,
    compactor: Option<JoinHandle<Result<u64, StoreError>>>,
}

pub struct RecordingSession {
    config: Config,
    state: SessionState,
    cancel: CancellationToken,
}

impl RecordingSession {
    pub fn new(config: Config) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            state: SessionState::Configured,
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token that stops production when cancelled; buffered frames still
    /// drain and every store is closed before the summary is emitted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(
        &mut self,
        registry: DeviceRegistry,
        probe: Arc<dyn DeviceProbe>,
        factory: Arc<dyn SourceFactory>,
    ) -> Result<SessionSummary, SessionError> {
        if self.state != SessionState::Configured {
            return Err(SessionError::Configuration(
                "session already consumed".into(),
            ));
        }

        let report = match self.validate_devices(registry, probe).await {
            Ok(report) => report,
            Err(e) => return Err(self.fail(e)),
        };
        self.state = SessionState::DevicesValidated;

        let recording = self.config.recording.clone();
        let pipeline = self.config.pipeline.clone();
        let resolution = (recording.width, recording.height);
        let total_cycles = self.config.total_cycles();
        let base = recording.base_name.clone();

        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(self.fail(e.into()));
                }
            }
        }
        if pipeline.persist == PersistMode::TwoPhase {
            if let Err(e) = std::fs::create_dir_all(stage_dir(&base)) {
                return Err(self.fail(e.into()));
            }
        }

        // Surface the validation outcome before anything starts.
        let mut reports: Vec<CameraReport> = report
            .failed
            .iter()
            .map(|&camera| CameraReport {
                camera,
                outcome: CameraOutcome::DeviceUnavailable,
                counters: CounterSnapshot::default(),
            })
            .collect();

        let retry = RetryPolicy {
            max_retries: pipeline.max_write_retries,
            initial_backoff: Duration::from_millis(pipeline.retry_backoff_ms),
        };
        let write_timeout = Duration::from_millis(pipeline.write_timeout_ms);
        let compaction_poll =
            Duration::from_secs_f64(1.0 / (recording.frame_rate * COMPACTION_POLL_DIVISOR));

        let mut feeds = Vec::new();
        let mut active = Vec::new();
        for &(camera, device_id) in &report.usable {
            let source = match factory.open(camera, device_id, resolution) {
                Ok(source) => source,
                Err(e) => {
                    // Probe passed but open failed; same policy applies.
                    warn!("camera {camera} failed to open: {e}");
                    if pipeline.device_policy == DevicePolicy::Abort {
                        return Err(self.fail(e.into()));
                    }
                    reports.push(CameraReport {
                        camera,
                        outcome: CameraOutcome::DeviceUnavailable,
                        counters: CounterSnapshot::default(),
                    });
                    continue;
                }
            };

            let (tx, rx) = flume::bounded(pipeline.channel_depth);
            let counters = Arc::new(CameraCounters::new());
            let mut staging_done = None;
            let mut compactor = None;

            let store: Box<dyn FrameStore> = match pipeline.persist {
                PersistMode::Discrete => Box::new(DiscreteFileStore::new(&base, camera)),
                PersistMode::Container => {
                    match ContainerStore::create(
                        container_path(&base, camera),
                        camera,
                        resolution,
                        total_cycles,
                    ) {
                        Ok(store) => Box::new(store),
                        Err(e) => {
                            error!("camera {camera} container unusable: {e}");
                            reports.push(CameraReport {
                                camera,
                                outcome: CameraOutcome::FatalIo(e.to_string()),
                                counters: CounterSnapshot::default(),
                            });
                            continue;
                        }
                    }
                }
                PersistMode::TwoPhase => {
                    let container = match ContainerStore::create(
                        container_path(&base, camera),
                        camera,
                        resolution,
                        total_cycles,
                    ) {
                        Ok(container) => container,
                        Err(e) => {
                            error!("camera {camera} container unusable: {e}");
                            reports.push(CameraReport {
                                camera,
                                outcome: CameraOutcome::FatalIo(e.to_string()),
                                counters: CounterSnapshot::default(),
                            });
                            continue;
                        }
                    };
                    let (done_tx, done_rx) = oneshot::channel();
                    staging_done = Some(done_tx);
                    compactor = Some(tokio::spawn(
                        Compactor::new(stage_dir(&base), camera, container, compaction_poll)
                            .run(done_rx),
                    ));
                    let stem = base
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "capture".into());
                    Box::new(StagedStore::new(stage_dir(&base), stem, camera))
                }
            };

            // Under `Block` the worker must be the only receiver, so a
            // fatally-halted worker disconnects the channel instead of
            // leaving the capture loop blocked on a full send.
            let drain = matches!(pipeline.overflow, OverflowPolicy::DropOldest)
                .then(|| rx.clone());
            let worker = PersistenceWorker::new(
                camera,
                rx,
                store,
                Arc::clone(&counters),
                retry,
                write_timeout,
            );
            active.push(ActiveCamera {
                camera,
                counters: Arc::clone(&counters),
                worker: tokio::spawn(worker.run()),
                staging_done,
                compactor,
            });
            feeds.push(CameraFeed::new(camera, source, tx, drain, counters));
        }

        if active.is_empty() {
            return Err(self.fail(SessionError::DevicesUnusable {
                failed: reports.iter().map(|r| r.camera).collect(),
            }));
        }

        let ledger = match TimestampLedger::with_sidecar(&sidecar_path(&base)) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!("timestamp sidecar unavailable, keeping ledger in memory: {e}");
                TimestampLedger::new()
            }
        };

        self.state = SessionState::Capturing;
        let active_count = active.len();
        let mut ledger = PacedCapture::new(
            feeds,
            recording.frame_rate,
            pipeline.window,
            total_cycles,
            resolution,
            pipeline.overflow,
            pipeline.stall,
            ledger,
            self.cancel.clone(),
        )
        .run()
        .await;

        // Capture dropped its senders; every worker drains to empty (or
        // reports a fatal error) before this join returns.
        self.state = SessionState::Draining;
        for cam in active {
            let worker_report = match cam.worker.await {
                Ok(report) => report,
                Err(e) => {
                    error!("camera {} worker panicked: {e}", cam.camera);
                    reports.push(CameraReport {
                        camera: cam.camera,
                        outcome: CameraOutcome::FatalIo("worker panicked".into()),
                        counters: cam.counters.snapshot(),
                    });
                    continue;
                }
            };

            let mut outcome = match worker_report.fatal {
                Some(e) => CameraOutcome::FatalIo(e.to_string()),
                None => CameraOutcome::Completed,
            };

            if let Some(done) = cam.staging_done {
                let _ = done.send(());
            }
            if let Some(compactor) = cam.compactor {
                match compactor.await {
                    Ok(Ok(rows)) => {
                        info!("camera {}: {rows} rows archived", cam.camera);
                    }
                    Ok(Err(e)) => {
                        error!("camera {} compaction failed: {e}", cam.camera);
                        if outcome == CameraOutcome::Completed {
                            outcome = CameraOutcome::FatalIo(e.to_string());
                        }
                    }
                    Err(e) => {
                        error!("camera {} compactor panicked: {e}", cam.camera);
                        if outcome == CameraOutcome::Completed {
                            outcome = CameraOutcome::FatalIo("compactor panicked".into());
                        }
                    }
                }
            }

            reports.push(CameraReport {
                camera: cam.camera,
                outcome,
                counters: cam.counters.snapshot(),
            });
        }

        if let Err(e) = ledger.close() {
            warn!("timestamp sidecar close failed: {e}");
        }

        reports.sort_by_key(|r| r.camera);
        let ledger_summary = ledger.summary();
        let observed_rate = if ledger_summary.mean_interval > 0.0 {
            1.0 / ledger_summary.mean_interval
        } else {
            0.0
        };

        let summary = SessionSummary {
            requested_cameras: recording.cam_num,
            active_cameras: active_count,
            cameras: reports,
            ledger: ledger_summary,
            observed_rate,
            requested_duration: Duration::from_secs(recording.duration_secs),
            elapsed: Duration::from_secs_f64(ledger_summary.total_elapsed),
        };

        self.state = SessionState::Closed;
        log_summary(&summary);
        Ok(summary)
    }

    /// Discover devices, then probe each requested camera under its own
    /// timeout. A wedged device counts as one failed camera; it never
    /// masks the validation outcome of the others.
    async fn validate_devices(
        &mut self,
        registry: DeviceRegistry,
        probe: Arc<dyn DeviceProbe>,
    ) -> Result<crate::capture::ValidationReport, SessionError> {
        let requested = self.config.recording.cam_num;
        let probe_timeout = Duration::from_millis(self.config.pipeline.probe_timeout_ms);

        let ids = match tokio::task::spawn_blocking(move || registry.discover()).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(SessionError::Configuration(
                    "device discovery panicked".into(),
                ))
            }
        };

        let mut usable = Vec::new();
        let mut failed = Vec::new();
        for cam in 0..requested {
            let Some(&id) = ids.get(cam) else {
                warn!("camera {cam} has no device entry");
                failed.push(cam);
                continue;
            };
            let probe = Arc::clone(&probe);
            let task = tokio::task::spawn_blocking(move || probe.probe(id));
            match tokio::time::timeout(probe_timeout, task).await {
                Ok(Ok(true)) => usable.push((cam, id)),
                Ok(Ok(false)) => {
                    warn!("camera {cam} (/dev/video{id}) failed probe");
                    failed.push(cam);
                }
                Ok(Err(_)) => {
                    warn!("camera {cam} probe panicked");
                    failed.push(cam);
                }
                Err(_) => {
                    warn!("camera {cam} probe unanswered after {probe_timeout:?}");
                    failed.push(cam);
                }
            }
        }

        let report = crate::capture::ValidationReport {
            requested,
            usable,
            failed,
        };
        info!(
            "validated {} of {requested} requested cameras",
            report.usable.len()
        );

        if !report.is_complete() {
            match self.config.pipeline.device_policy {
                DevicePolicy::Abort => {
                    return Err(SessionError::DevicesUnusable {
                        failed: report.failed,
                    });
                }
                DevicePolicy::ProceedWithAvailable => {
                    warn!(
                        "proceeding with {} of {requested} cameras; unusable: {:?}",
                        report.usable.len(),
                        report.failed
                    );
                }
            }
        }
        Ok(report)
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        error!("session failed: {err}");
        self.state = SessionState::Failed;
        self.cancel.cancel();
        err
    }
}

fn log_summary(summary: &SessionSummary) {
    let lag: Vec<u64> = summary
        .cameras
        .iter()
        .map(|r| r.counters.in_count - r.counters.out_count)
        .collect();
    info!(
        "frame lag = {lag:?}, avg interval = {:.4}s, observed rate = {:.2} fps, total time = {:.3}s (requested {:.3}s)",
        summary.ledger.mean_interval,
        summary.observed_rate,
        summary.elapsed.as_secs_f64(),
        summary.requested_duration.as_secs_f64(),
    );
    for report in &summary.cameras {
        info!(
            "camera {}: {:?}, in={}, out={}, stalls={}, dropped={}, max backlog={}",
            report.camera,
            report.outcome,
            report.counters.in_count,
            report.counters.out_count,
            report.counters.stalls,
            report.counters.dropped,
            report.counters.max_backlog,
        );
    }
}
