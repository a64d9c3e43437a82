//! Two-phase stage-then-archive persistence.
//!
//! The fast path lands each frame as a discrete staged file so a slow
//! structured write can never stall capture pacing. A background
//! compactor folds accumulated staged files into the per-camera array
//! container in sequence order and deletes the originals; a final sweep
//! runs once staging is signalled complete.
//!
//! Staged record layout: `sequence u64 LE | timestamp f64 LE | payload`.
//! Staged files are internal to this strategy and never survive a clean
//! session.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{container::ContainerStore, write_atomic, FrameStore};
use crate::capture::Frame;
use crate::error::StoreError;

/// Fast-path store: frames land as staged files in `{base}_stage/`.
pub struct StagedStore {
    dir: PathBuf,
    stem: String,
    camera: usize,
    closed: bool,
}

impl StagedStore {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>, camera: usize) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            camera,
            closed: false,
        }
    }

    fn staged_path(&self, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("{}_cam{}_{sequence:06}", self.stem, self.camera))
    }
}

impl FrameStore for StagedStore {
    fn write(&mut self, frame: &Frame) -> Result<(), StoreError> {
        let mut record = Vec::with_capacity(16 + frame.data.len());
        record.extend_from_slice(&frame.meta.sequence.to_le_bytes());
        record.extend_from_slice(&frame.meta.timestamp.to_le_bytes());
        record.extend_from_slice(&frame.data);
        write_atomic(&self.staged_path(frame.meta.sequence), &record)?;
        Ok(())
    }

    fn flush_and_close(&mut self) -> Result<(), StoreError> {
        if !self.closed {
            self.closed = true;
            debug!("staging for camera {} complete", self.camera);
        }
        Ok(())
    }
}

/// Staged files for one camera, ordered by sequence number.
///
/// Recovers the sequence from the file name the way the original
/// staged-file listing did; dot-prefixed in-flight temp files are skipped.
pub fn list_staged(dir: &Path, camera: usize) -> io::Result<Vec<(u64, PathBuf)>> {
    let marker = format!("_cam{camera}_");
    let mut staged = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') {
            continue;
        }
        let Some(idx) = name.rfind(&marker) else { continue };
        let digits = &name[idx + marker.len()..];
        if let Ok(seq) = digits.parse::<u64>() {
            staged.push((seq, entry.path()));
        }
    }
    staged.sort_unstable_by_key(|(seq, _)| *seq);
    Ok(staged)
}

/// Background task folding staged files into the container.
pub struct Compactor {
    stage_dir: PathBuf,
    camera: usize,
    container: ContainerStore,
    poll: Duration,
}

impl Compactor {
    pub fn new(
        stage_dir: impl Into<PathBuf>,
        camera: usize,
        container: ContainerStore,
        poll: Duration,
    ) -> Self {
        Self {
            stage_dir: stage_dir.into(),
            camera,
            container,
            poll,
        }
    }

    /// Fold staged files until `staging_done` fires and the directory is
    /// empty for this camera, then close the container. Returns the total
    /// number of rows archived.
    pub async fn run(mut self, mut staging_done: oneshot::Receiver<()>) -> Result<u64, StoreError> {
        let mut done = false;
        loop {
            let folded = self.sweep()?;
            if done && folded == 0 {
                break;
            }
            if !done {
                match staging_done.try_recv() {
                    Ok(()) => done = true,
                    Err(oneshot::error::TryRecvError::Closed) => done = true,
                    Err(oneshot::error::TryRecvError::Empty) => {}
                }
            }
            if folded == 0 {
                tokio::time::sleep(self.poll).await;
            }
        }

        let rows = self.container.rows_written();
        self.container.flush_and_close()?;
        info!("camera {} compaction archived {rows} rows", self.camera);
        Ok(rows)
    }

    /// One pass over the staging directory. Returns how many files were
    /// folded.
    fn sweep(&mut self) -> Result<usize, StoreError> {
        let staged = list_staged(&self.stage_dir, self.camera)?;
        let count = staged.len();
        for (name_seq, path) in staged {
            let mut file = std::fs::File::open(&path)?;
            let mut record = Vec::new();
            file.read_to_end(&mut record)?;
            if record.len() < 16 {
                warn!("short staged record {}, skipping", path.display());
                std::fs::remove_file(&path)?;
                continue;
            }

            let sequence = u64::from_le_bytes(record[0..8].try_into().unwrap());
            let timestamp = f64::from_le_bytes(record[8..16].try_into().unwrap());
            if sequence != name_seq {
                warn!(
                    "staged record {} disagrees with its name ({sequence} vs {name_seq})",
                    path.display()
                );
            }
            self.container.append(sequence, timestamp, &record[16..])?;
            std::fs::remove_file(&path)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::container::ContainerReader;
    use bytes::Bytes;

    fn frame(camera: usize, seq: u64) -> Frame {
        Frame::new(Bytes::from(vec![seq as u8; 12]), camera, seq, (2, 2))
    }

    #[test]
    fn list_staged_orders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "outpy_cam0_000002",
            "outpy_cam0_000000",
            "outpy_cam1_000001",
            ".outpy_cam0_000003.tmp",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let staged = list_staged(dir.path(), 0).unwrap();
        let seqs: Vec<u64> = staged.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![0, 2]);
    }

    #[tokio::test]
    async fn compactor_folds_everything_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let stage = dir.path().join("outpy_stage");
        std::fs::create_dir_all(&stage).unwrap();

        let mut staged = StagedStore::new(&stage, "outpy", 0);
        for seq in 0..5 {
            staged.write(&frame(0, seq)).unwrap();
        }
        staged.flush_and_close().unwrap();

        let container_path = dir.path().join("outpy_cam0.arr");
        let container = ContainerStore::create(&container_path, 0, (2, 2), 5).unwrap();
        let compactor = Compactor::new(&stage, 0, container, Duration::from_millis(5));

        let (done_tx, done_rx) = oneshot::channel();
        done_tx.send(()).unwrap();
        let rows = compactor.run(done_rx).await.unwrap();
        assert_eq!(rows, 5);

        let mut reader = ContainerReader::open(&container_path).unwrap();
        let records = reader.records().unwrap();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.sequence, i as u64);
            assert_eq!(record.payload, vec![i as u8; 12]);
        }
        assert!(list_staged(&stage, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn compactor_waits_for_late_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let stage = dir.path().join("s_stage");
        std::fs::create_dir_all(&stage).unwrap();

        let container_path = dir.path().join("s_cam0.arr");
        let container = ContainerStore::create(&container_path, 0, (2, 2), 2).unwrap();
        let compactor = Compactor::new(&stage, 0, container, Duration::from_millis(5));
        let (done_tx, done_rx) = oneshot::channel();

        let stage_clone = stage.clone();
        let writer = tokio::spawn(async move {
            let mut staged = StagedStore::new(&stage_clone, "s", 0);
            for seq in 0..2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                staged.write(&frame(0, seq)).unwrap();
            }
            staged.flush_and_close().unwrap();
            done_tx.send(()).unwrap();
        });

        let rows = compactor.run(done_rx).await.unwrap();
        writer.await.unwrap();
        assert_eq!(rows, 2);
    }
}
