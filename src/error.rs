//! Failure taxonomy for the capture pipeline.
//!
//! Per-camera failures are isolated: one camera going dark or one store
//! exhausting its retries never aborts the other cameras' capture or
//! persistence. The session's final summary enumerates every camera-level
//! outcome.

use thiserror::Error;

/// Errors raised while talking to a camera device.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Device could not be opened or probed. Fatal for that camera;
    /// the session may proceed with fewer cameras if policy allows.
    #[error("device {device_id} unavailable: {reason}")]
    DeviceUnavailable { device_id: u32, reason: String },

    /// A single read failed (device hiccup, USB overrun). Transient:
    /// counted, never terminates the capture loop.
    #[error("capture stall on camera {camera}: {reason}")]
    Stall { camera: usize, reason: String },
}

/// Errors raised while persisting frames.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure. Retryable errors trigger bounded backoff-retry;
    /// exhaustion or a fatal error halts only the affected camera's
    /// persistence.
    #[error("store I/O error (retryable: {retryable}): {source}")]
    Io {
        retryable: bool,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Classify an I/O error. Temporary disk pressure and interrupted
    /// syscalls are worth retrying; everything else is fatal.
    pub fn from_io(source: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let retryable = matches!(
            source.kind(),
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
        );
        StoreError::Io { retryable, source }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Io { retryable, .. } => *retryable,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(source: std::io::Error) -> Self {
        StoreError::from_io(source)
    }
}

/// Session-level errors. Anything here stops the session before or during
/// startup; per-camera trouble after startup is reported through the
/// summary instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Device validation failed under the `Abort` policy, or no device
    /// was usable at all.
    #[error("device validation failed: unusable camera indices {failed:?}")]
    DevicesUnusable { failed: Vec<usize> },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
