//! Fleet-wide recording admission gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where one recording writes its files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingTarget {
    /// Directory the files go into
    pub directory: PathBuf,
    /// Base name shared by every recording of the session
    pub filename: String,
    /// Session the recording belongs to
    pub session_id: Uuid,
    /// Counts recordings within this session, starting at 1.
    pub index: u32,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
}

impl RecordingTarget {
    /// `<filename>_<index>`, the index zero-padded to three digits.
    pub fn stem(&self) -> String {
        format!("{}_{:03}", self.filename, self.index)
    }

    /// `<directory>/<filename>_<index>[_<suffix>].<extension>`
    ///
    /// Every recording of a session gets its own files.
    pub fn output_path(&self, suffix: Option<&str>, extension: &str) -> PathBuf {
        let stem = match suffix {
            Some(suffix) if !suffix.is_empty() => format!("{}_{suffix}", self.stem()),
            _ => self.stem(),
        };
        self.directory.join(format!("{stem}.{extension}"))
    }

    /// Creates the target directory if needed.
    pub fn ensure_directory(&self) -> std::io::Result<&Path> {
        std::fs::create_dir_all(&self.directory)?;
        Ok(&self.directory)
    }
}

/// Idle or recording. Only one recording at a time; starting twice changes nothing.
#[derive(Debug)]
pub struct RecordingSession {
    session_id: Uuid,
    recordings: u32,
    active: Option<RecordingTarget>,
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSession {
    /// An idle session with a fresh id.
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            recordings: 0,
            active: None,
        }
    }

    /// Id shared by every recording of this session.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether a recording is open.
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// The open recording.
    pub fn target(&self) -> Option<&RecordingTarget> {
        self.active.as_ref()
    }

    /// Moves idle to recording. Returns the new target, or `None` if already recording.
    pub fn start(
        &mut self,
        directory: impl Into<PathBuf>,
        filename: impl Into<String>,
    ) -> Option<&RecordingTarget> {
        let next = self.recordings + 1;
        self.start_numbered(directory, filename, next)
    }

    /// Like [`start`](Self::start), but with the index chosen by the caller, so that a
    /// saver numbers its files the way the orchestrator numbered the recording.
    pub fn start_numbered(
        &mut self,
        directory: impl Into<PathBuf>,
        filename: impl Into<String>,
        index: u32,
    ) -> Option<&RecordingTarget> {
        if self.active.is_some() {
            return None;
        }
        self.recordings = index;
        self.active = Some(RecordingTarget {
            directory: directory.into(),
            filename: filename.into(),
            session_id: self.session_id,
            index: self.recordings,
            started_at: Utc::now(),
        });
        self.active.as_ref()
    }

    /// Moves recording to idle, returning the finished target.
    pub fn stop(&mut self) -> Option<RecordingTarget> {
        self.active.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_idempotent() {
        let mut session = RecordingSession::new();
        let first = session.start("/tmp/a", "run").cloned().unwrap();
        assert!(session.start("/tmp/b", "other").is_none());
        assert_eq!(session.target(), Some(&first));
        assert_eq!(first.index, 1);

        let stopped = session.stop().unwrap();
        assert_eq!(stopped.filename, "run");
        assert!(!session.is_recording());
        assert!(session.stop().is_none());

        let second = session.start("/tmp/a", "run").cloned().unwrap();
        assert_eq!(second.index, 2);
        assert_eq!(second.session_id, session.session_id());
    }

    #[test]
    fn test_output_path() {
        let mut session = RecordingSession::new();
        let target = session.start("/data/day1", "scan").unwrap();
        assert_eq!(
            target.output_path(None, "csv"),
            PathBuf::from("/data/day1/scan_001.csv")
        );
        assert_eq!(
            target.output_path(Some("video"), "frames"),
            PathBuf::from("/data/day1/scan_001_video.frames")
        );
        assert_eq!(
            target.output_path(Some(""), "h5"),
            PathBuf::from("/data/day1/scan_001.h5")
        );
    }

    #[test]
    fn test_consecutive_recordings_get_distinct_paths() {
        let mut session = RecordingSession::new();
        let first = session.start("/data", "scan").unwrap().output_path(None, "csv");
        session.stop();
        let second = session.start("/data", "scan").unwrap().output_path(None, "csv");
        assert_ne!(first, second);
        assert_eq!(second, PathBuf::from("/data/scan_002.csv"));
    }

    #[test]
    fn test_start_numbered_follows_the_given_index() {
        let mut session = RecordingSession::new();
        let target = session.start_numbered("/data", "scan", 7).unwrap();
        assert_eq!(target.stem(), "scan_007");
        assert!(session.start_numbered("/data", "scan", 8).is_none());
        session.stop();
        assert_eq!(session.start("/data", "scan").unwrap().index, 8);
    }
}
