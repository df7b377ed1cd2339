//! Per-source bounded caches fed by DATA messages while a recording is active.
//!
//! Each source gets three ring buffers: scalar series (timestamped), indexed series, and
//! array/frame series. When a ring is full the oldest entry is overwritten and counted as
//! evicted.

//!
//! Only sources declared when the cache is built are kept. DATA from any other source is
//! dropped and counted; the first message of each such source is logged.

use crate::wire::{Buffer, DataShape, Mapping, Message, Payload};
use ringbuf::{HeapRb, Rb};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// The sample carried by one cached DATA message.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// Named values of a timestamped or indexed message
    Values(Mapping),
    /// Array or frame payload
    Buffer(Buffer),
}

/// One DATA message as kept by a saver.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    /// Worker that sent the message
    pub source: String,
    /// DATA flag the message carried
    pub shape: DataShape,
    /// Acquisition time, UNIX seconds
    pub time: f64,
    /// Sample index; `None` for timestamped data
    pub index: Option<i64>,
    /// The data itself
    pub sample: Sample,
}

impl CachedEntry {
    /// Extracts the entry from a DATA message; any other kind yields `None`.
    pub fn from_message(message: &Message) -> Option<Self> {
        let source = message.source().to_string();
        let entry = match message.payload() {
            Payload::Timestamped { time, data } => Self {
                source,
                shape: DataShape::Timestamped,
                time: *time,
                index: None,
                sample: Sample::Values(data.clone()),
            },
            Payload::Indexed { time, index, data } => Self {
                source,
                shape: DataShape::Indexed,
                time: *time,
                index: Some(*index),
                sample: Sample::Values(data.clone()),
            },
            Payload::Array {
                time,
                index,
                buffer,
            } => Self {
                source,
                shape: DataShape::Array,
                time: *time,
                index: Some(*index),
                sample: Sample::Buffer(buffer.clone()),
            },
            Payload::Frame {
                time,
                index,
                buffer,
            } => Self {
                source,
                shape: DataShape::Frame,
                time: *time,
                index: Some(*index),
                sample: Sample::Buffer(buffer.clone()),
            },
            _ => return None,
        };
        Some(entry)
    }

    /// Named values, unless this is an array or frame.
    pub fn values(&self) -> Option<&Mapping> {
        match &self.sample {
            Sample::Values(values) => Some(values),
            Sample::Buffer(_) => None,
        }
    }

    /// Array or frame payload, if any.
    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.sample {
            Sample::Buffer(buffer) => Some(buffer),
            Sample::Values(_) => None,
        }
    }
}

/// Bounded storage for one source.
pub struct SourceCache {
    scalars: HeapRb<CachedEntry>,
    indexed: HeapRb<CachedEntry>,
    buffers: HeapRb<CachedEntry>,
    evicted: u64,
}

impl std::fmt::Debug for SourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCache")
            .field("scalars", &self.scalars.len())
            .field("indexed", &self.indexed.len())
            .field("buffers", &self.buffers.len())
            .field("evicted", &self.evicted)
            .finish()
    }
}

impl SourceCache {
    /// Rings of `capacity` entries each; at least one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            scalars: HeapRb::new(capacity),
            indexed: HeapRb::new(capacity),
            buffers: HeapRb::new(capacity),
            evicted: 0,
        }
    }

    fn ring(&mut self, shape: DataShape) -> &mut HeapRb<CachedEntry> {
        match shape {
            DataShape::Timestamped => &mut self.scalars,
            DataShape::Indexed => &mut self.indexed,
            DataShape::Array | DataShape::Frame => &mut self.buffers,
        }
    }

    /// Appends to the series of the entry's shape, evicting the oldest when full.
    pub fn push(&mut self, entry: CachedEntry) {
        let ring = self.ring(entry.shape);
        let full = ring.len() == ring.capacity();
        ring.push_overwrite(entry);
        if full {
            self.evicted += 1;
        }
    }

    /// Entries held across all series.
    pub fn len(&self) -> usize {
        self.scalars.len() + self.indexed.len() + self.buffers.len()
    }

    /// Whether no entry is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries overwritten since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Drains every series, scalars first, each in arrival order.
    pub fn take(&mut self) -> Vec<CachedEntry> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.scalars.pop_iter());
        out.extend(self.indexed.pop_iter());
        out.extend(self.buffers.pop_iter());
        out
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.scalars.clear();
        self.indexed.clear();
        self.buffers.clear();
    }
}

/// All source caches of one saver plus the recording gate they obey.
#[derive(Debug)]
pub struct RecordingCache {
    recording: bool,
    sources: BTreeMap<String, SourceCache>,
    undeclared: BTreeSet<String>,
    discarded: u64,
    rejected: u64,
}

impl RecordingCache {
    /// Caches for the declared `sources`, `capacity` entries per series.
    pub fn new<I, S>(sources: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            recording: false,
            sources: sources
                .into_iter()
                .map(|s| (s.into(), SourceCache::new(capacity)))
                .collect(),
            undeclared: BTreeSet::new(),
            discarded: 0,
            rejected: 0,
        }
    }

    /// Whether `source` was declared at construction.
    pub fn declares(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    /// Whether the gate is open.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Opens the gate with empty caches.
    pub fn begin(&mut self) {
        self.sources.values_mut().for_each(SourceCache::clear);
        self.recording = true;
    }

    /// Caches the DATA in `message` if recording. Returns whether it was kept.
    pub fn admit(&mut self, message: &Message) -> bool {
        if !self.recording {
            self.discarded += 1;
            return false;
        }
        let Some(entry) = CachedEntry::from_message(message) else {
            return false;
        };
        let Some(cache) = self.sources.get_mut(&entry.source) else {
            self.rejected += 1;
            if self.undeclared.insert(entry.source.clone()) {
                warn!(source = %entry.source, "dropping data from undeclared source");
            }
            return false;
        };
        cache.push(entry);
        true
    }

    /// Closes the gate and drains every cache, sources in name order.
    pub fn finish(&mut self) -> Vec<CachedEntry> {
        self.recording = false;
        self.sources
            .values_mut()
            .flat_map(|cache| cache.take())
            .collect()
    }

    /// Declared sources, in name order.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Entries currently held.
    pub fn cached(&self) -> usize {
        self.sources.values().map(SourceCache::len).sum()
    }

    /// Entries overwritten across all sources.
    pub fn evicted(&self) -> u64 {
        self.sources.values().map(SourceCache::evicted).sum()
    }

    /// DATA messages dropped because no recording was active.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// DATA messages dropped because their source was not declared.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    fn values(v: f64) -> Mapping {
        let mut map = Mapping::new();
        map.insert("value".into(), json!(v));
        map
    }

    fn timestamped(source: &str, time: f64) -> Message {
        Message::new(
            source,
            Payload::Timestamped {
                time,
                data: values(time),
            },
        )
    }

    #[test]
    fn test_idle_data_is_discarded() {
        let mut cache = RecordingCache::new(["w1", "w2"], 8);
        assert!(!cache.admit(&timestamped("w1", 1.0)));
        assert_eq!(cache.cached(), 0);
        assert_eq!(cache.discarded(), 1);

        cache.begin();
        assert!(cache.admit(&timestamped("w1", 2.0)));
        assert!(cache.admit(&timestamped("w2", 3.0)));
        let flushed = cache.finish();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].source, "w1");
        assert!(!cache.is_recording());
        assert!(!cache.admit(&timestamped("w1", 4.0)));
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut cache = SourceCache::new(2);
        for t in 0..5 {
            let message = timestamped("w1", f64::from(t));
            cache.push(CachedEntry::from_message(&message).unwrap());
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evicted(), 3);
        let times: Vec<f64> = cache.take().iter().map(|e| e.time).collect();
        assert_eq!(times, [3.0, 4.0]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_shapes_go_to_separate_series() {
        let mut cache = SourceCache::new(1);
        let frame = Message::new(
            "cam",
            Payload::Frame {
                time: 1.0,
                index: 7,
                buffer: Buffer::from_u8(vec![2, 2], vec![0, 1, 2, 3]).unwrap(),
            },
        );
        let indexed = Message::new(
            "cam",
            Payload::Indexed {
                time: 1.5,
                index: 7,
                data: values(0.5),
            },
        );
        cache.push(CachedEntry::from_message(&frame).unwrap());
        cache.push(CachedEntry::from_message(&indexed).unwrap());
        cache.push(CachedEntry::from_message(&timestamped("cam", 2.0)).unwrap());
        assert_eq!(cache.evicted(), 0);

        let entries = cache.take();
        let shapes: Vec<DataShape> = entries.iter().map(|e| e.shape).collect();
        assert_eq!(
            shapes,
            [DataShape::Timestamped, DataShape::Indexed, DataShape::Frame]
        );
        assert_eq!(entries[2].index, Some(7));
        assert!(entries[2].buffer().is_some());
    }

    #[test]
    fn test_non_data_is_not_cached() {
        let mut cache = RecordingCache::new(["w1"], 4);
        cache.begin();
        assert!(!cache.admit(&Message::new("w1", Payload::Trigger)));
        assert_eq!(cache.cached(), 0);
    }

    #[traced_test]
    #[test]
    fn test_undeclared_source_is_dropped() {
        let mut cache = RecordingCache::new(["w1"], 4);
        cache.begin();
        for t in 0..3 {
            assert!(!cache.admit(&timestamped("stranger", f64::from(t))));
        }
        assert!(cache.admit(&timestamped("w1", 1.0)));

        assert_eq!(cache.sources().collect::<Vec<_>>(), ["w1"]);
        assert_eq!(cache.cached(), 1);
        assert_eq!(cache.rejected(), 3);
        assert!(!cache.declares("stranger"));
        assert!(logs_contain("undeclared source"));
    }
}
