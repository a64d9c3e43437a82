//! Backing stores for persisted frames.
//!
//! Three interchangeable strategies sit behind [`FrameStore`]:
//! discrete one-file-per-frame, a growable per-camera array container, and
//! a two-phase stage-then-archive pipeline. All of them preserve strict
//! per-camera arrival order and guarantee no partially written file is
//! ever visible under its final name.

pub mod container;
pub mod discrete;
pub mod two_phase;

pub use container::{ContainerReader, ContainerStore};
pub use discrete::DiscreteFileStore;
pub use two_phase::{list_staged, Compactor, StagedStore};

use std::path::{Path, PathBuf};

use crate::capture::Frame;
use crate::error::StoreError;

/// Destination for one camera's ordered frame sequence.
pub trait FrameStore: Send {
    /// Durably write one frame. Implementations surface transient
    /// failures as retryable [`StoreError`]s; retry scheduling belongs to
    /// the persistence worker.
    fn write(&mut self, frame: &Frame) -> Result<(), StoreError>;

    /// Flush buffered data and release the store. Idempotent; must be
    /// safe on every exit path, including early cancellation.
    fn flush_and_close(&mut self) -> Result<(), StoreError>;
}

fn base_stem(base: &Path) -> String {
    base.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".to_string())
}

/// `{base}_cam{camera}_{sequence:06}` - lexicographically sortable by
/// sequence, the contract downstream encoders rely on.
pub fn discrete_path(base: &Path, camera: usize, sequence: u64) -> PathBuf {
    base.with_file_name(format!("{}_cam{camera}_{sequence:06}", base_stem(base)))
}

/// `{base}_cam{camera}.arr` - one logical array group per camera.
pub fn container_path(base: &Path, camera: usize) -> PathBuf {
    base.with_file_name(format!("{}_cam{camera}.arr", base_stem(base)))
}

/// `{base}_time_list.txt` - the timestamp sidecar.
pub fn sidecar_path(base: &Path) -> PathBuf {
    base.with_file_name(format!("{}_time_list.txt", base_stem(base)))
}

/// `{base}_stage/` - staging directory for the two-phase strategy.
pub fn stage_dir(base: &Path) -> PathBuf {
    base.with_file_name(format!("{}_stage", base_stem(base)))
}

/// Write `payload` to a dot-prefixed temporary sibling, then rename into
/// place. A crash mid-write leaves only the invisible temp file.
pub(crate) fn write_atomic(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let tmp_name = format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "frame".to_string())
    );
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, payload)?;
    std::fs::rename(&tmp, path)
}
