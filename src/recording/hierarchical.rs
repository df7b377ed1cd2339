//! HDF5 backend: one group per worker, one dataset per parameter.
//!
//! Layout of `<stem>.h5`:
//!
//! ```text
//! /<source>/time               f64, one per value entry
//! /<source>/index              i64, -1 where the entry carried no index
//! /<source>/values/<parameter> f64 with NaN for gaps, or UTF-8 strings with "" for gaps
//! /<source>/buffers/<n>        one dataset per array/frame entry, attributes time, index, shape
//! ```
//!
//! Parameters live in their own `values` group, so a parameter called `time` or `index`
//! cannot collide with the bookkeeping datasets. Group and dataset names are escaped:
//! `%` becomes `%25` and `/` becomes `%2F`. A parameter whose values are all numbers (or
//! bools) is numeric; any other value makes the whole column text, with non-string values
//! stored as their JSON.
//!
//! The layout is computed without touching the file so it can be checked in every build;
//! writing it requires the `storage_hdf5` feature.

use super::cache::CachedEntry;
use crate::wire::Buffer;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Sentinel stored in `index` for entries without one.
pub const NO_INDEX: i64 = -1;

/// Subgroup holding one dataset per parameter.
pub const VALUES_GROUP: &str = "values";

/// Subgroup holding one dataset per array or frame.
pub const BUFFERS_GROUP: &str = "buffers";

/// Escapes `name` for use as one HDF5 path component.
pub fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// One parameter dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Every present value was a number or bool
    Numeric(Vec<f64>),
    /// At least one value was something else
    Text(Vec<String>),
}

impl Column {
    /// Rows in the column.
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Text(values) => values.len(),
        }
    }

    /// Whether the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Datasets of one source group.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GroupLayout {
    /// Acquisition time of every value entry
    pub time: Vec<f64>,
    /// Sample index of every value entry
    pub index: Vec<i64>,
    /// Columns by escaped parameter name
    pub parameters: BTreeMap<String, Column>,
    /// Arrays and frames, in arrival order
    pub buffers: Vec<BufferEntry>,
}

impl GroupLayout {
    /// Dataset paths relative to the group, in write order.
    pub fn dataset_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if !self.time.is_empty() {
            paths.push("time".to_string());
            paths.push("index".to_string());
            paths.extend(
                self.parameters
                    .keys()
                    .map(|name| format!("{VALUES_GROUP}/{name}")),
            );
        }
        paths.extend((0..self.buffers.len()).map(|n| format!("{BUFFERS_GROUP}/{n:06}")));
        paths
    }
}

/// One array or frame entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    /// Acquisition time
    pub time: f64,
    /// Sample index, [`NO_INDEX`] if none
    pub index: i64,
    /// The data
    pub buffer: Buffer,
}

/// Lays cached entries out into groups and datasets, keyed by escaped source name.
pub fn layout(entries: &[CachedEntry]) -> BTreeMap<String, GroupLayout> {
    // per source: parameter name -> whether every value seen so far is numeric
    let mut kinds: BTreeMap<&str, BTreeMap<&str, bool>> = BTreeMap::new();
    for entry in entries {
        let Some(values) = entry.values() else {
            continue;
        };
        let columns = kinds.entry(entry.source.as_str()).or_default();
        for (name, value) in values {
            let is_numeric = numeric(value).is_some();
            columns
                .entry(name.as_str())
                .and_modify(|numeric| *numeric &= is_numeric)
                .or_insert(is_numeric);
        }
    }

    let mut groups: BTreeMap<String, GroupLayout> = BTreeMap::new();
    for entry in entries {
        let group = groups.entry(escape_name(&entry.source)).or_default();
        if let Some(buffer) = entry.buffer() {
            group.buffers.push(BufferEntry {
                time: entry.time,
                index: entry.index.unwrap_or(NO_INDEX),
                buffer: buffer.clone(),
            });
            continue;
        }
        let Some(values) = entry.values() else {
            continue;
        };
        group.time.push(entry.time);
        group.index.push(entry.index.unwrap_or(NO_INDEX));
        let columns = kinds.get(entry.source.as_str()).into_iter().flatten();
        for (name, is_numeric) in columns {
            let value = values.get(*name);
            let column = group
                .parameters
                .entry(escape_name(name))
                .or_insert_with(|| {
                    if *is_numeric {
                        Column::Numeric(Vec::new())
                    } else {
                        Column::Text(Vec::new())
                    }
                });
            match column {
                Column::Numeric(rows) => rows.push(value.and_then(numeric).unwrap_or(f64::NAN)),
                Column::Text(rows) => rows.push(value.map(text).unwrap_or_default()),
            }
        }
    }
    groups
}

#[cfg(feature = "storage_hdf5")]
pub use writer::HierarchicalBackend;

#[cfg(feature = "storage_hdf5")]
mod writer {
    use super::{layout, Column, GroupLayout, BUFFERS_GROUP, VALUES_GROUP};
    use crate::error::{FleetError, FleetResult};
    use crate::recording::backend::{FlushSummary, SaverBackend};
    use crate::recording::cache::CachedEntry;
    use crate::recording::session::RecordingTarget;
    use crate::wire::{Buffer, DType};
    use hdf5::types::VarLenUnicode;
    use std::path::{Path, PathBuf};
    use tracing::info;

    fn storage(e: hdf5::Error) -> FleetError {
        FleetError::Storage(format!("hdf5: {e}"))
    }

    /// Writes every recording to one HDF5 file.
    pub struct HierarchicalBackend {
        suffix: Option<String>,
        target: Option<RecordingTarget>,
        entries: Vec<CachedEntry>,
    }

    impl HierarchicalBackend {
        /// A backend appending `suffix` to the file stem.
        pub fn new(suffix: Option<String>) -> Self {
            Self {
                suffix,
                target: None,
                entries: Vec::new(),
            }
        }
    }

    fn elements<T: Copy, const N: usize>(data: &[u8], from: fn([u8; N]) -> T) -> Vec<T> {
        data.chunks_exact(N)
            .filter_map(|chunk| chunk.try_into().ok().map(from))
            .collect()
    }

    fn write_buffer(group: &hdf5::Group, name: &str, buffer: &Buffer) -> hdf5::Result<hdf5::Dataset> {
        let builder = group.new_dataset_builder();
        match buffer.dtype() {
            DType::U8 => builder.with_data(buffer.data().as_ref()).create(name),
            DType::U16 => builder
                .with_data(&elements(buffer.data(), u16::from_le_bytes))
                .create(name),
            DType::F32 => builder
                .with_data(&elements(buffer.data(), f32::from_le_bytes))
                .create(name),
            DType::F64 => builder
                .with_data(&elements(buffer.data(), f64::from_le_bytes))
                .create(name),
        }
    }

    fn write_column(group: &hdf5::Group, name: &str, column: &Column) -> hdf5::Result<()> {
        let builder = group.new_dataset_builder();
        match column {
            Column::Numeric(values) => {
                builder.with_data(values).create(name)?;
            }
            Column::Text(values) => {
                let values = values
                    .iter()
                    .map(|v| v.replace('\0', "").parse::<VarLenUnicode>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| hdf5::Error::from(e.to_string()))?;
                builder.with_data(&values).create(name)?;
            }
        }
        Ok(())
    }

    fn write_group(file: &hdf5::File, source: &str, data: &GroupLayout) -> hdf5::Result<()> {
        let group = file.create_group(source)?;
        if !data.time.is_empty() {
            group.new_dataset_builder().with_data(&data.time).create("time")?;
            group.new_dataset_builder().with_data(&data.index).create("index")?;
            if !data.parameters.is_empty() {
                let values = group.create_group(VALUES_GROUP)?;
                for (name, column) in &data.parameters {
                    write_column(&values, name, column)?;
                }
            }
        }
        if !data.buffers.is_empty() {
            let buffers = group.create_group(BUFFERS_GROUP)?;
            for (n, entry) in data.buffers.iter().enumerate() {
                let dataset = write_buffer(&buffers, &format!("{n:06}"), &entry.buffer)?;
                dataset
                    .new_attr_builder()
                    .with_data(&[entry.time])
                    .create("time")?;
                dataset
                    .new_attr_builder()
                    .with_data(&[entry.index])
                    .create("index")?;
                dataset
                    .new_attr_builder()
                    .with_data(entry.buffer.shape())
                    .create("shape")?;
            }
        }
        Ok(())
    }

    fn write_file(path: &Path, entries: &[CachedEntry]) -> hdf5::Result<()> {
        let file = hdf5::File::create(path)?;
        for (source, data) in layout(entries) {
            write_group(&file, &source, &data)?;
        }
        Ok(())
    }

    impl SaverBackend for HierarchicalBackend {
        fn name(&self) -> &str {
            "hierarchical"
        }

        fn start_recording(&mut self, target: &RecordingTarget, _sources: &[String]) -> FleetResult<()> {
            target.ensure_directory()?;
            self.target = Some(target.clone());
            self.entries.clear();
            Ok(())
        }

        fn accept(&mut self, entry: &CachedEntry) -> FleetResult<()> {
            self.entries.push(entry.clone());
            Ok(())
        }

        fn stop_recording(&mut self) -> FleetResult<FlushSummary> {
            let target = self.target.take().ok_or_else(|| {
                FleetError::Storage("hierarchical backend stopped without a recording".into())
            })?;
            let path: PathBuf = target.output_path(self.suffix.as_deref(), "h5");
            let entries = std::mem::take(&mut self.entries);
            write_file(&path, &entries).map_err(storage)?;
            info!(path = %path.display(), entries = entries.len(), "hierarchical recording written");
            Ok(FlushSummary {
                entries: entries.len(),
                skipped: 0,
                paths: vec![path],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::cache::Sample;
    use crate::wire::DataShape;
    use serde_json::json;

    fn values(source: &str, time: f64, index: Option<i64>, v: Value) -> CachedEntry {
        let Value::Object(map) = v else {
            panic!("object expected")
        };
        CachedEntry {
            source: source.into(),
            shape: DataShape::Timestamped,
            time,
            index,
            sample: Sample::Values(map),
        }
    }

    fn numeric_column(group: &GroupLayout, name: &str) -> Vec<f64> {
        match &group.parameters[name] {
            Column::Numeric(values) => values.clone(),
            Column::Text(values) => panic!("{name} is text: {values:?}"),
        }
    }

    #[test]
    fn test_layout_groups_and_fills_gaps() {
        let entries = vec![
            values("w1", 1.0, None, json!({"a": 1.0})),
            values("w1", 2.0, Some(4), json!({"b": 2, "note": "text", "on": true})),
            values("w2", 1.5, None, json!({"a": 3.0})),
            CachedEntry {
                source: "w2".into(),
                shape: DataShape::Array,
                time: 1.6,
                index: Some(0),
                sample: Sample::Buffer(Buffer::from_f64(vec![2], &[0.5, 0.25]).unwrap()),
            },
        ];
        let groups = layout(&entries);

        let w1 = &groups["w1"];
        assert_eq!(w1.time, [1.0, 2.0]);
        assert_eq!(w1.index, [NO_INDEX, 4]);
        let a = numeric_column(w1, "a");
        assert_eq!(a[0], 1.0);
        assert!(a[1].is_nan());
        let b = numeric_column(w1, "b");
        assert!(b[0].is_nan());
        assert_eq!(b[1], 2.0);
        assert_eq!(numeric_column(w1, "on")[1], 1.0);
        assert_eq!(
            w1.parameters["note"],
            Column::Text(vec![String::new(), "text".into()])
        );

        let w2 = &groups["w2"];
        assert_eq!(w2.time, [1.5]);
        assert_eq!(w2.buffers.len(), 1);
        assert_eq!(w2.buffers[0].index, 0);
        assert_eq!(w2.dataset_paths(), ["time", "index", "values/a", "buffers/000000"]);
    }

    #[test]
    fn test_parameters_named_like_bookkeeping_do_not_collide() {
        let entries = vec![values("w1", 5.0, Some(2), json!({"time": 99.0, "index": 7}))];
        let w1 = &layout(&entries)["w1"];
        assert_eq!(w1.time, [5.0]);
        assert_eq!(w1.index, [2]);
        assert_eq!(numeric_column(w1, "time"), [99.0]);
        assert_eq!(
            w1.dataset_paths(),
            ["time", "index", "values/index", "values/time"]
        );
    }

    #[test]
    fn test_names_are_escaped() {
        assert_eq!(escape_name("stage/x"), "stage%2Fx");
        assert_eq!(escape_name("50%/50"), "50%25%2F50");
        assert_eq!(escape_name("plain"), "plain");

        let entries = vec![values("rig/cam", 1.0, None, json!({"pos/x": 0.5}))];
        let groups = layout(&entries);
        let group = &groups["rig%2Fcam"];
        assert_eq!(group.dataset_paths(), ["time", "index", "values/pos%2Fx"]);
    }

    #[test]
    fn test_mixed_column_becomes_text() {
        let entries = vec![
            values("w1", 1.0, None, json!({"state": 1})),
            values("w1", 2.0, None, json!({"state": "armed"})),
            values("w1", 3.0, None, json!({"state": {"nested": true}})),
        ];
        let w1 = &layout(&entries)["w1"];
        assert_eq!(
            w1.parameters["state"],
            Column::Text(vec!["1".into(), "armed".into(), r#"{"nested":true}"#.into()])
        );
    }
}
