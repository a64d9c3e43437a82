//! Aperture multi-camera recorder.

use std::sync::Arc;

use color_eyre::Result;
use tracing::{info, warn};

use aperture::capture::{
    AcceptAllProbe, DeviceProbe, DeviceRegistry, SourceFactory, TestPatternFactory, V4l2Probe,
    V4l2SourceFactory,
};
use aperture::pipeline::RecordingSession;
use aperture::{Config, SourceKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("aperture=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Aperture launching...");

    let config = Config::load()?;
    info!(
        "recording {}s at {} fps from {} cameras into {}",
        config.recording.duration_secs,
        config.recording.frame_rate,
        config.recording.cam_num,
        config.recording.base_name.display()
    );

    let (registry, probe, factory): (DeviceRegistry, Arc<dyn DeviceProbe>, Arc<dyn SourceFactory>) =
        match config.pipeline.source {
            SourceKind::V4l2 => (
                DeviceRegistry::new(),
                Arc::new(V4l2Probe),
                Arc::new(V4l2SourceFactory),
            ),
            SourceKind::TestPattern => (
                DeviceRegistry::fixed((0..config.recording.cam_num as u32).collect()),
                Arc::new(AcceptAllProbe),
                Arc::new(TestPatternFactory),
            ),
        };

    let mut session = RecordingSession::new(config)?;

    let cancel = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping capture and draining");
            cancel.cancel();
        }
    });

    let summary = session.run(registry, probe, factory).await?;

    let persisted: u64 = summary.cameras.iter().map(|c| c.counters.out_count).sum();
    info!(
        "Aperture shutting down: {persisted} frames persisted across {} active cameras \
         ({:+.3}s vs requested duration)",
        summary.active_cameras,
        summary.duration_delta()
    );
    Ok(())
}
