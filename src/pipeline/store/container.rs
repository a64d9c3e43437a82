//! Growable per-camera array container.
//!
//! All frames for one camera append into a single self-describing file:
//!
//! ```text
//! magic "APERARR1" | header_len: u32 LE | header JSON | records...
//! record: sequence u64 LE | timestamp f64 LE | payload_len u32 LE | payload
//! ```
//!
//! The header pins the frame shape and an expected-rows hint. Appends are
//! buffered, so the container must be explicitly flushed and closed on
//! shutdown; a crash mid-session loses only the unflushed tail. The
//! original recordings used blosc-compressed HDF5 earrays; records here
//! are stored raw and the header says so.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::FrameStore;
use crate::capture::Frame;
use crate::error::StoreError;

const MAGIC: &[u8; 8] = b"APERARR1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerHeader {
    pub version: u32,
    pub camera: usize,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Sizing hint, like the `expectedrows` of an HDF5 earray.
    pub expected_rows: u64,
    pub compression: String,
}

pub struct ContainerStore {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    camera: usize,
    rows_written: u64,
}

impl ContainerStore {
    pub fn create(
        path: impl Into<PathBuf>,
        camera: usize,
        resolution: (u32, u32),
        expected_rows: u64,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let header = ContainerHeader {
            version: 1,
            camera,
            width: resolution.0,
            height: resolution.1,
            channels: 3,
            expected_rows,
            compression: "none".to_string(),
        };
        let header_bytes = serde_json::to_vec(&header)
            .map_err(|e| StoreError::from_io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&header_bytes)?;

        info!(
            "container {} created for camera {camera} (expecting {expected_rows} rows)",
            path.display()
        );
        Ok(Self {
            path,
            writer: Some(writer),
            camera,
            rows_written: 0,
        })
    }

    /// Append one record. Used both by [`FrameStore::write`] and by the
    /// two-phase compactor, which replays staged records.
    pub fn append(&mut self, sequence: u64, timestamp: f64, payload: &[u8]) -> Result<(), StoreError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            StoreError::from_io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "container already closed",
            ))
        })?;
        writer.write_all(&sequence.to_le_bytes())?;
        writer.write_all(&timestamp.to_le_bytes())?;
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(payload)?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

impl FrameStore for ContainerStore {
    fn write(&mut self, frame: &Frame) -> Result<(), StoreError> {
        self.append(frame.meta.sequence, frame.meta.timestamp, &frame.data)
    }

    fn flush_and_close(&mut self) -> Result<(), StoreError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            debug!(
                "container {} closed after {} rows (camera {})",
                self.path.display(),
                self.rows_written,
                self.camera
            );
        }
        Ok(())
    }
}

impl Drop for ContainerStore {
    fn drop(&mut self) {
        let _ = self.flush_and_close();
    }
}

/// One decoded container record.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub sequence: u64,
    pub timestamp: f64,
    pub payload: Vec<u8>,
}

/// Sequential reader over a container file.
pub struct ContainerReader {
    header: ContainerHeader,
    reader: BufReader<File>,
}

impl ContainerReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }

        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let mut header_bytes = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut header_bytes)?;
        let header: ContainerHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Self { header, reader })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> io::Result<Option<ContainerRecord>> {
        let mut seq = [0u8; 8];
        match self.reader.read_exact(&mut seq) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let mut ts = [0u8; 8];
        self.reader.read_exact(&mut ts)?;
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        self.reader.read_exact(&mut payload)?;

        Ok(Some(ContainerRecord {
            sequence: u64::from_le_bytes(seq),
            timestamp: f64::from_le_bytes(ts),
            payload,
        }))
    }

    /// Read every remaining record.
    pub fn records(&mut self) -> io::Result<Vec<ContainerRecord>> {
        let mut out = Vec::new();
        while let Some(record) = self.next_record()? {
            out.push(record);
        }
        Ok(out)
    }
}
