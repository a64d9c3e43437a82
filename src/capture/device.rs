//! Camera device discovery and validation.
//!
//! Devices are enumerated from the platform device namespace (`/dev/videoN`),
//! sorted numerically, and probed by opening and immediately releasing them.
//! Probing is fast and idempotent, so there are no retries here; if the
//! physical setup changes the caller simply validates again.

use std::io;
use std::path::PathBuf;

use tracing::{debug, info, warn};
use v4l::capability::Flags as CapFlags;
use v4l::Device;

/// Opens a device to confirm it is usable, then releases it.
///
/// A trait so that validation is testable without camera hardware.
pub trait DeviceProbe: Send + Sync {
    fn probe(&self, device_id: u32) -> bool;
}

/// Real V4L2 probe: open the device node and check for the
/// VIDEO_CAPTURE capability.
pub struct V4l2Probe;

impl DeviceProbe for V4l2Probe {
    fn probe(&self, device_id: u32) -> bool {
        match Device::new(device_id as usize) {
            Ok(dev) => match dev.query_caps() {
                Ok(caps) => {
                    debug!("probed /dev/video{device_id}: {} ({})", caps.card, caps.driver);
                    caps.capabilities.contains(CapFlags::VIDEO_CAPTURE)
                }
                Err(e) => {
                    warn!("query_caps failed for /dev/video{device_id}: {e}");
                    false
                }
            },
            Err(e) => {
                warn!("could not open /dev/video{device_id}: {e}");
                false
            }
        }
    }
}

/// Outcome of validating the first `requested` discovered devices.
///
/// `usable` pairs each surviving camera index with its device id; `failed`
/// lists exactly the camera indices whose device could not be probed (or
/// did not exist). The caller decides whether to proceed with fewer
/// cameras or abort - never silently.
#[derive(Debug)]
pub struct ValidationReport {
    pub requested: usize,
    pub usable: Vec<(usize, u32)>,
    pub failed: Vec<usize>,
}

impl ValidationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.usable.len() == self.requested
    }
}

/// Probe that accepts every device. Pairs with synthetic sources.
pub struct AcceptAllProbe;

impl DeviceProbe for AcceptAllProbe {
    fn probe(&self, _device_id: u32) -> bool {
        true
    }
}

/// Enumerates camera-like device entries under a device root.
pub struct DeviceRegistry {
    dev_root: PathBuf,
    fixed: Option<Vec<u32>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            dev_root: PathBuf::from("/dev"),
            fixed: None,
        }
    }

    /// Scan an alternate directory instead of `/dev`. Used by tests.
    pub fn with_root(dev_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: dev_root.into(),
            fixed: None,
        }
    }

    /// Registry over a fixed id list instead of a filesystem scan.
    /// Backs synthetic-source runs on hosts with no cameras at all.
    pub fn fixed(ids: Vec<u32>) -> Self {
        Self {
            dev_root: PathBuf::new(),
            fixed: Some(ids),
        }
    }

    /// Ordered device ids for every `video<N>` entry under the root.
    pub fn discover(&self) -> io::Result<Vec<u32>> {
        if let Some(ids) = &self.fixed {
            return Ok(ids.clone());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dev_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = parse_video_id(name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        debug!("discovered video devices: {ids:?}");
        Ok(ids)
    }

    /// Probe the first `requested` discovered devices and report exactly
    /// which camera indices are usable.
    pub fn validate(
        &self,
        requested: usize,
        probe: &dyn DeviceProbe,
    ) -> io::Result<ValidationReport> {
        let ids = self.discover()?;
        let mut usable = Vec::new();
        let mut failed = Vec::new();

        for cam in 0..requested {
            match ids.get(cam) {
                Some(&id) if probe.probe(id) => usable.push((cam, id)),
                Some(&id) => {
                    warn!("camera {cam} (/dev/video{id}) failed probe");
                    failed.push(cam);
                }
                None => {
                    warn!("camera {cam} has no device entry");
                    failed.push(cam);
                }
            }
        }

        info!(
            "validated {} of {requested} requested cameras",
            usable.len()
        );
        Ok(ValidationReport {
            requested,
            usable,
            failed,
        })
    }
}

/// Parse the numeric suffix out of a `video<N>` entry name.
fn parse_video_id(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("video")?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    struct FixedProbe {
        bad: Vec<u32>,
    }

    impl DeviceProbe for FixedProbe {
        fn probe(&self, device_id: u32) -> bool {
            !self.bad.contains(&device_id)
        }
    }

    fn fake_dev_root(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            File::create(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn discover_sorts_numerically_and_ignores_noise() {
        let dir = fake_dev_root(&["video10", "video2", "video0", "sda", "videoctl", "tty0"]);
        let registry = DeviceRegistry::with_root(dir.path());
        assert_eq!(registry.discover().unwrap(), vec![0, 2, 10]);
    }

    #[test]
    fn validate_reports_failed_indices() {
        let dir = fake_dev_root(&["video0", "video1", "video2"]);
        let registry = DeviceRegistry::with_root(dir.path());
        let report = registry
            .validate(3, &FixedProbe { bad: vec![1] })
            .unwrap();
        assert_eq!(report.usable, vec![(0, 0), (2, 2)]);
        assert_eq!(report.failed, vec![1]);
        assert!(!report.is_complete());
    }

    #[test]
    fn validate_flags_missing_devices() {
        let dir = fake_dev_root(&["video0"]);
        let registry = DeviceRegistry::with_root(dir.path());
        let report = registry
            .validate(3, &FixedProbe { bad: vec![] })
            .unwrap();
        assert_eq!(report.usable, vec![(0, 0)]);
        assert_eq!(report.failed, vec![1, 2]);
    }

    #[test]
    fn complete_validation() {
        let dir = fake_dev_root(&["video0", "video1"]);
        let registry = DeviceRegistry::with_root(dir.path());
        let report = registry
            .validate(2, &FixedProbe { bad: vec![] })
            .unwrap();
        assert!(report.is_complete());
    }
}
