//! One file per frame.
//!
//! Simplest and most failure-isolated strategy: a corrupt write affects a
//! single file, at the cost of filesystem metadata overhead per frame.

use std::path::PathBuf;

use tracing::debug;

use super::{discrete_path, write_atomic, FrameStore};
use crate::capture::Frame;
use crate::error::StoreError;

pub struct DiscreteFileStore {
    base: PathBuf,
    camera: usize,
    closed: bool,
}

impl DiscreteFileStore {
    pub fn new(base: impl Into<PathBuf>, camera: usize) -> Self {
        Self {
            base: base.into(),
            camera,
            closed: false,
        }
    }
}

impl FrameStore for DiscreteFileStore {
    fn write(&mut self, frame: &Frame) -> Result<(), StoreError> {
        let path = discrete_path(&self.base, self.camera, frame.meta.sequence);
        write_atomic(&path, &frame.data)?;
        Ok(())
    }

    fn flush_and_close(&mut self) -> Result<(), StoreError> {
        // Every frame is already durable on its own; nothing buffered.
        if !self.closed {
            self.closed = true;
            debug!("discrete store for camera {} closed", self.camera);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(camera: usize, seq: u64) -> Frame {
        Frame::new(Bytes::from(vec![seq as u8; 12]), camera, seq, (2, 2))
    }

    #[test]
    fn writes_deterministic_names() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("outpy");
        let mut store = DiscreteFileStore::new(&base, 0);

        for seq in 0..3 {
            store.write(&frame(0, seq)).unwrap();
        }
        store.flush_and_close().unwrap();

        for seq in 0..3u64 {
            let path = dir.path().join(format!("outpy_cam0_{seq:06}"));
            assert_eq!(std::fs::read(path).unwrap(), vec![seq as u8; 12]);
        }
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiscreteFileStore::new(dir.path().join("outpy"), 1);
        store.write(&frame(1, 0)).unwrap();
        store.flush_and_close().unwrap();
        store.flush_and_close().unwrap();
    }
}
