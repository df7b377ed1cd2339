//! CSV backend: one row per DATA entry.
//!
//! Columns are `time`, `source`, `index`, then one `source.parameter` column per value seen
//! during the recording, sorted. Cells a row has no value for stay empty. Array and frame
//! entries have no tabular form and are skipped.

use super::backend::{FlushSummary, SaverBackend};
use super::cache::CachedEntry;
use super::session::RecordingTarget;
use crate::error::{FleetError, FleetResult};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info};

/// Writes timestamped and indexed values to one CSV file per recording.
pub struct TabularBackend {
    suffix: Option<String>,
    path: Option<PathBuf>,
    rows: Vec<CachedEntry>,
    skipped: usize,
}

impl TabularBackend {
    /// A backend appending `suffix` to the file stem.
    pub fn new(suffix: Option<String>) -> Self {
        Self {
            suffix,
            path: None,
            rows: Vec::new(),
            skipped: 0,
        }
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SaverBackend for TabularBackend {
    fn name(&self) -> &str {
        "tabular"
    }

    fn start_recording(&mut self, target: &RecordingTarget, _sources: &[String]) -> FleetResult<()> {
        target.ensure_directory()?;
        self.path = Some(target.output_path(self.suffix.as_deref(), "csv"));
        self.rows.clear();
        self.skipped = 0;
        Ok(())
    }

    fn accept(&mut self, entry: &CachedEntry) -> FleetResult<()> {
        if entry.values().is_some() {
            self.rows.push(entry.clone());
        } else {
            self.skipped += 1;
        }
        Ok(())
    }

    fn stop_recording(&mut self) -> FleetResult<FlushSummary> {
        let path = self
            .path
            .take()
            .ok_or_else(|| FleetError::Storage("tabular backend stopped without a recording".into()))?;

        let mut rows = std::mem::take(&mut self.rows);
        rows.sort_by(|a, b| a.time.total_cmp(&b.time));

        let columns: BTreeSet<String> = rows
            .iter()
            .filter_map(|row| row.values().map(|v| (row, v)))
            .flat_map(|(row, values)| values.keys().map(move |k| format!("{}.{k}", row.source)))
            .collect();

        let mut writer = csv::Writer::from_path(&path)?;
        let mut header = vec!["time".to_string(), "source".into(), "index".into()];
        header.extend(columns.iter().cloned());
        writer.write_record(&header)?;

        for row in &rows {
            let mut record = vec![
                row.time.to_string(),
                row.source.clone(),
                row.index.map(|i| i.to_string()).unwrap_or_default(),
            ];
            let prefix = format!("{}.", row.source);
            for column in &columns {
                let value = column
                    .strip_prefix(&prefix)
                    .and_then(|param| row.values().and_then(|v| v.get(param)));
                record.push(value.map(cell).unwrap_or_default());
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;

        if self.skipped > 0 {
            debug!(skipped = self.skipped, "array entries have no tabular form");
        }
        info!(path = %path.display(), rows = rows.len(), "tabular recording written");
        Ok(FlushSummary {
            entries: rows.len(),
            skipped: std::mem::take(&mut self.skipped),
            paths: vec![path],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::cache::Sample;
    use crate::recording::RecordingSession;
    use crate::wire::{Buffer, DataShape};
    use serde_json::json;

    fn row(source: &str, time: f64, index: Option<i64>, values: serde_json::Value) -> CachedEntry {
        let Value::Object(map) = values else {
            panic!("values must be an object")
        };
        CachedEntry {
            source: source.into(),
            shape: if index.is_some() {
                DataShape::Indexed
            } else {
                DataShape::Timestamped
            },
            time,
            index,
            sample: Sample::Values(map),
        }
    }

    #[test]
    fn test_writes_sorted_rows_with_union_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = RecordingSession::new();
        let target = session.start(dir.path(), "run").cloned().unwrap();

        let mut backend = TabularBackend::new(None);
        backend
            .start_recording(&target, &["w1".into(), "w2".into()])
            .unwrap();
        backend
            .accept(&row("w2", 2.0, Some(3), json!({"x": 1.5, "label": "b"})))
            .unwrap();
        backend
            .accept(&row("w1", 1.0, None, json!({"value": 42})))
            .unwrap();
        backend
            .accept(&CachedEntry {
                source: "w1".into(),
                shape: DataShape::Frame,
                time: 1.5,
                index: Some(0),
                sample: Sample::Buffer(Buffer::from_u8(vec![1], vec![9]).unwrap()),
            })
            .unwrap();
        let summary = backend.stop_recording().unwrap();

        assert_eq!(summary.entries, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.paths, [dir.path().join("run_001.csv")]);

        let text = std::fs::read_to_string(&summary.paths[0]).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time,source,index,w1.value,w2.label,w2.x");
        assert_eq!(lines[1], "1,w1,,42,,");
        assert_eq!(lines[2], "2,w2,3,,b,1.5");
    }

    #[test]
    fn test_stop_without_start_fails() {
        let mut backend = TabularBackend::new(None);
        assert!(backend.stop_recording().is_err());
    }
}
