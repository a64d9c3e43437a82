use bytes::Bytes;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame data with zero-copy semantics.
///
/// Ownership transfers from the capture loop into the per-camera channel
/// and then to the persistence worker; once handed off, the producer keeps
/// no reference to the pixel data.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data, height x width x channels interleaved
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMeta>,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMeta {
    /// Camera index within the session, `[0, cam_num)`
    pub camera: usize,
    /// Per-camera monotonically increasing sequence number
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Wall-clock capture instant, seconds since epoch
    pub timestamp: f64,
}

impl Frame {
    pub fn new(data: Bytes, camera: usize, sequence: u64, resolution: (u32, u32)) -> Self {
        Self {
            data,
            meta: Arc::new(FrameMeta {
                camera,
                sequence,
                width: resolution.0,
                height: resolution.1,
                channels: 3,
                timestamp: epoch_seconds(),
            }),
        }
    }

    /// Expected payload length for the frame's declared shape.
    pub fn expected_len(&self) -> usize {
        (self.meta.width * self.meta.height * self.meta.channels) as usize
    }
}

/// Wall-clock seconds since the Unix epoch, sub-millisecond resolution.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
