//! Frame-sequence backend.
//!
//! Writes three files per recording:
//!
//! - `<stem>.frames`: raw element bytes of every array/frame entry, back to back
//! - `<stem>.frames.json`: header with session, dtype and shape information
//! - `<stem>.frames.csv`: one row per frame with its source, index, time and byte offset

use super::backend::{FlushSummary, SaverBackend};
use super::cache::CachedEntry;
use super::session::RecordingTarget;
use crate::error::{FleetError, FleetResult};
use crate::wire::DType;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Serialize)]
struct FrameRow<'a> {
    frame: usize,
    source: &'a str,
    index: Option<i64>,
    time: f64,
    offset: u64,
    bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
struct SourceLayout {
    dtype: String,
    shape: Vec<u32>,
    frames: usize,
}

#[derive(Debug, Serialize)]
struct Header<'a> {
    session_id: String,
    recording: u32,
    started_at: String,
    data_file: String,
    index_file: String,
    frames: usize,
    bytes: u64,
    sources: &'a BTreeMap<String, SourceLayout>,
}

struct Open {
    target: RecordingTarget,
    data_path: PathBuf,
    data: BufWriter<File>,
    offset: u64,
    rows: Vec<(String, Option<i64>, f64, u64, usize)>,
    layouts: BTreeMap<String, SourceLayout>,
}

/// Writes frames and arrays to a raw `.frames` file with a JSON sidecar and an index CSV.
pub struct FramesBackend {
    suffix: Option<String>,
    open: Option<Open>,
    skipped: usize,
}

impl FramesBackend {
    /// A backend appending `suffix` to every file stem.
    pub fn new(suffix: Option<String>) -> Self {
        Self {
            suffix,
            open: None,
            skipped: 0,
        }
    }
}

fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::U8 => "u8",
        DType::U16 => "u16",
        DType::F32 => "f32",
        DType::F64 => "f64",
    }
}

fn side_path(data_path: &std::path::Path, extension: &str) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

impl SaverBackend for FramesBackend {
    fn name(&self) -> &str {
        "frames"
    }

    fn start_recording(&mut self, target: &RecordingTarget, _sources: &[String]) -> FleetResult<()> {
        target.ensure_directory()?;
        let data_path = target.output_path(self.suffix.as_deref(), "frames");
        let data = BufWriter::new(File::create(&data_path)?);
        self.skipped = 0;
        self.open = Some(Open {
            target: target.clone(),
            data_path,
            data,
            offset: 0,
            rows: Vec::new(),
            layouts: BTreeMap::new(),
        });
        Ok(())
    }

    fn accept(&mut self, entry: &CachedEntry) -> FleetResult<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| FleetError::Storage("frames backend has no open recording".into()))?;
        let Some(buffer) = entry.buffer() else {
            self.skipped += 1;
            return Ok(());
        };

        let layout = open
            .layouts
            .entry(entry.source.clone())
            .or_insert_with(|| SourceLayout {
                dtype: dtype_name(buffer.dtype()).to_string(),
                shape: buffer.shape().to_vec(),
                frames: 0,
            });
        // a source that changes shape mid-recording is recorded as variable
        if layout.shape != buffer.shape() {
            layout.shape.clear();
        }
        layout.frames += 1;

        open.data.write_all(buffer.data())?;
        let bytes = buffer.data().len();
        open.rows
            .push((entry.source.clone(), entry.index, entry.time, open.offset, bytes));
        open.offset += bytes as u64;
        Ok(())
    }

    fn stop_recording(&mut self) -> FleetResult<FlushSummary> {
        let mut open = self
            .open
            .take()
            .ok_or_else(|| FleetError::Storage("frames backend stopped without a recording".into()))?;
        open.data.flush()?;

        let index_path = side_path(&open.data_path, "csv");
        let mut index = csv::Writer::from_path(&index_path)?;
        for (frame, (source, idx, time, offset, bytes)) in open.rows.iter().enumerate() {
            index.serialize(FrameRow {
                frame,
                source,
                index: *idx,
                time: *time,
                offset: *offset,
                bytes: *bytes,
            })?;
        }
        index.flush()?;

        let file_name = |path: &PathBuf| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let header = Header {
            session_id: open.target.session_id.to_string(),
            recording: open.target.index,
            started_at: open.target.started_at.to_rfc3339(),
            data_file: file_name(&open.data_path),
            index_file: file_name(&index_path),
            frames: open.rows.len(),
            bytes: open.offset,
            sources: &open.layouts,
        };
        let header_path = side_path(&open.data_path, "json");
        let json = serde_json::to_vec_pretty(&header)
            .map_err(|e| FleetError::Storage(format!("frame header: {e}")))?;
        std::fs::write(&header_path, json)?;

        info!(path = %open.data_path.display(), frames = open.rows.len(), bytes = open.offset, "frame recording written");
        Ok(FlushSummary {
            entries: open.rows.len(),
            skipped: std::mem::take(&mut self.skipped),
            paths: vec![open.data_path, header_path, index_path],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::cache::Sample;
    use crate::recording::RecordingSession;
    use crate::wire::{Buffer, DataShape, Mapping};

    fn frame(index: i64, fill: u8) -> CachedEntry {
        CachedEntry {
            source: "cam".into(),
            shape: DataShape::Frame,
            time: 10.0 + index as f64,
            index: Some(index),
            sample: Sample::Buffer(Buffer::from_u8(vec![2, 3], vec![fill; 6]).unwrap()),
        }
    }

    #[test]
    fn test_writes_data_header_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = RecordingSession::new();
        let target = session.start(dir.path(), "scan").cloned().unwrap();

        let mut backend = FramesBackend::new(Some("video".into()));
        backend.start_recording(&target, &["cam".into()]).unwrap();
        backend.accept(&frame(0, 1)).unwrap();
        backend.accept(&frame(1, 2)).unwrap();
        backend
            .accept(&CachedEntry {
                source: "cam".into(),
                shape: DataShape::Timestamped,
                time: 11.5,
                index: None,
                sample: Sample::Values(Mapping::new()),
            })
            .unwrap();
        let summary = backend.stop_recording().unwrap();

        assert_eq!(summary.entries, 2);
        assert_eq!(summary.skipped, 1);
        let data_path = dir.path().join("scan_001_video.frames");
        assert_eq!(summary.paths[0], data_path);

        let raw = std::fs::read(&data_path).unwrap();
        assert_eq!(raw, [vec![1u8; 6], vec![2u8; 6]].concat());

        let header: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("scan_001_video.frames.json")).unwrap())
                .unwrap();
        assert_eq!(header["frames"], 2);
        assert_eq!(header["sources"]["cam"]["shape"], serde_json::json!([2, 3]));
        assert_eq!(header["sources"]["cam"]["dtype"], "u8");

        let index = std::fs::read_to_string(dir.path().join("scan_001_video.frames.csv")).unwrap();
        let lines: Vec<&str> = index.lines().collect();
        assert_eq!(lines[0], "frame,source,index,time,offset,bytes");
        assert!(lines[2].starts_with("1,cam,1,11"));
        assert!(lines[2].ends_with(",6,6"));
    }
}
