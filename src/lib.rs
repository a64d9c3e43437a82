pub mod capture;
pub mod error;
pub mod pipeline;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// System configuration. Immutable once a session is constructed; there
/// is deliberately no process-wide config global so concurrent sessions
/// and tests stay independent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub recording: RecordingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Recording length in seconds
    pub duration_secs: u64,
    /// Target aggregate frame rate, frames per second
    pub frame_rate: f64,
    /// Number of cameras to record
    pub cam_num: usize,
    /// Output path root; all artifacts derive their names from it
    pub base_name: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded depth of each camera's capture-to-persistence channel
    pub channel_depth: usize,
    /// Moving-window size for rate correction, in cycles
    pub window: usize,
    pub overflow: OverflowPolicy,
    pub stall: StallPolicy,
    pub persist: PersistMode,
    pub device_policy: DevicePolicy,
    pub source: SourceKind,
    pub max_write_retries: u32,
    pub retry_backoff_ms: u64,
    pub write_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

/// What to do when a camera's bounded channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block the producer: natural backpressure, may slow capture pacing.
    Block,
    /// Discard the oldest buffered frame: preserves real-time pacing at
    /// the cost of counted, explicitly-listed data loss.
    DropOldest,
}

/// What to do when a camera read stalls mid-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallPolicy {
    /// Re-issue the previous frame under a fresh sequence number.
    RepeatLast,
    /// The cycle produces nothing for that camera.
    Skip,
}

/// Backing-store strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    /// One file per frame
    Discrete,
    /// Per-camera growable array container
    Container,
    /// Stage as discrete files, compact into the container in the
    /// background
    TwoPhase,
}

/// What to do when device validation comes up short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePolicy {
    Abort,
    ProceedWithAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    V4l2,
    /// Deterministic synthetic frames; no hardware required
    TestPattern,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            frame_rate: 30.0,
            cam_num: 1,
            base_name: PathBuf::from("recordings/outpy"),
            width: 640,
            height: 480,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_depth: 64,
            window: crate::pipeline::pacer::DEFAULT_WINDOW,
            overflow: OverflowPolicy::Block,
            stall: StallPolicy::RepeatLast,
            persist: PersistMode::TwoPhase,
            device_policy: DevicePolicy::Abort,
            source: SourceKind::V4l2,
            max_write_retries: 3,
            retry_backoff_ms: 10,
            write_timeout_ms: 250,
            probe_timeout_ms: 2_000,
        }
    }
}

impl Config {
    /// Layered load: optional `aperture.toml` in the working directory,
    /// overridden by `APERTURE_*` environment variables.
    pub fn load() -> Result<Self, SessionError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("aperture").required(false))
            .add_source(config::Environment::with_prefix("APERTURE").separator("__"))
            .build()
            .map_err(|e| SessionError::Configuration(e.to_string()))?;
        let cfg: Config = settings
            .try_deserialize()
            .map_err(|e| SessionError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        let bad = |msg: &str| Err(SessionError::Configuration(msg.to_string()));
        if self.recording.cam_num == 0 {
            return bad("cam_num must be at least 1");
        }
        if self.recording.duration_secs == 0 {
            return bad("duration_secs must be positive");
        }
        if !(self.recording.frame_rate > 0.0) {
            return bad("frame_rate must be positive");
        }
        if self.recording.width == 0 || self.recording.height == 0 {
            return bad("resolution must be non-zero");
        }
        if self.pipeline.channel_depth == 0 {
            return bad("channel_depth must be at least 1");
        }
        if self.pipeline.window == 0 {
            return bad("window must be at least 1");
        }
        Ok(())
    }

    /// Duration bound expressed in capture cycles.
    pub fn total_cycles(&self) -> u64 {
        (self.recording.duration_secs as f64 * self.recording.frame_rate).round() as u64
    }
}
