//! What a saver keeps besides recording caches, whether or not a recording is active.
//!
//! - an EVENT log: every event the saver received, drained by `query_events`
//! - a STRING log: every text message, drained by `query_messages`
//! - a live view per source: the latest timestamped values, the indexed entries since the
//!   last query and the latest array or frame, drained by `query_data`
//!
//! The logs are rings: once full, the oldest record is overwritten.

use super::cache::CachedEntry;
use crate::wire::{DataShape, Mapping, Message, Payload};
use ringbuf::{HeapRb, Rb};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// REQUEST draining the STRING log.
pub const QUERY_MESSAGES: &str = "query_messages";
/// REQUEST draining the EVENT log.
pub const QUERY_EVENTS: &str = "query_events";
/// REQUEST draining the live data view.
pub const QUERY_DATA: &str = "query_data";

/// One logged EVENT.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEvent {
    /// Sender
    pub source: String,
    /// Send time, UNIX seconds
    pub time: f64,
    /// Event name
    pub name: String,
    /// Event arguments
    pub kwargs: Mapping,
}

/// One logged STRING message.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedString {
    /// Sender
    pub source: String,
    /// Send time, UNIX seconds
    pub time: f64,
    /// Message text
    pub text: String,
}

#[derive(Debug, Default)]
struct LiveData {
    timestamped: Option<CachedEntry>,
    indexed: Vec<CachedEntry>,
    buffer: Option<CachedEntry>,
}

impl LiveData {
    fn to_json(&self) -> Value {
        let mut out = Mapping::new();
        if let Some(entry) = &self.timestamped {
            out.insert(
                "timestamped".into(),
                json!({"time": entry.time, "values": entry.values()}),
            );
        }
        if !self.indexed.is_empty() {
            let rows: Vec<Value> = self
                .indexed
                .iter()
                .map(|e| json!({"time": e.time, "index": e.index, "values": e.values()}))
                .collect();
            out.insert("indexed".into(), Value::Array(rows));
        }
        if let Some(entry) = &self.buffer {
            let buffer = entry.buffer();
            out.insert(
                "buffer".into(),
                json!({
                    "time": entry.time,
                    "index": entry.index,
                    "shape": entry.shape.flag().to_string(),
                    "dtype": buffer.map(|b| b.dtype()),
                    "dims": buffer.map(|b| b.shape().to_vec()),
                }),
            );
        }
        Value::Object(out)
    }
}

/// Logs and live view of one saver.
pub struct Journal {
    events: HeapRb<LoggedEvent>,
    messages: HeapRb<LoggedString>,
    live: BTreeMap<String, LiveData>,
    capacity: usize,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("events", &self.events.len())
            .field("messages", &self.messages.len())
            .field("live", &self.live.len())
            .finish()
    }
}

impl Journal {
    /// Keeps at most `capacity` records per log and indexed entries per source.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: HeapRb::new(capacity),
            messages: HeapRb::new(capacity),
            live: BTreeMap::new(),
            capacity,
        }
    }

    /// Logs an EVENT message. Returns false for anything else.
    pub fn record_event(&mut self, message: &Message) -> bool {
        let Payload::Event { name, kwargs } = message.payload() else {
            return false;
        };
        self.events.push_overwrite(LoggedEvent {
            source: message.source().to_string(),
            time: message.timestamp(),
            name: name.clone(),
            kwargs: kwargs.clone(),
        });
        true
    }

    /// Logs a STRING message. Returns false for anything else.
    pub fn record_string(&mut self, message: &Message) -> bool {
        let Payload::String(text) = message.payload() else {
            return false;
        };
        self.messages.push_overwrite(LoggedString {
            source: message.source().to_string(),
            time: message.timestamp(),
            text: text.clone(),
        });
        true
    }

    /// Updates the live view of the entry's source.
    pub fn observe(&mut self, entry: &CachedEntry) {
        let live = self.live.entry(entry.source.clone()).or_default();
        match entry.shape {
            DataShape::Timestamped => live.timestamped = Some(entry.clone()),
            DataShape::Indexed => {
                if live.indexed.len() == self.capacity {
                    live.indexed.remove(0);
                }
                live.indexed.push(entry.clone());
            }
            DataShape::Array | DataShape::Frame => live.buffer = Some(entry.clone()),
        }
    }

    /// Logged events not yet drained.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Logged strings not yet drained.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Drains the EVENT log, oldest first.
    pub fn take_events(&mut self) -> Vec<LoggedEvent> {
        self.events.pop_iter().collect()
    }

    /// Drains the STRING log, oldest first.
    pub fn take_messages(&mut self) -> Vec<LoggedString> {
        self.messages.pop_iter().collect()
    }

    /// Reply kwargs for `query_events`; drains the log.
    pub fn events_reply(&mut self) -> Mapping {
        let events: Vec<Value> = self
            .take_events()
            .into_iter()
            .map(|e| json!({"source": e.source, "time": e.time, "name": e.name, "kwargs": e.kwargs}))
            .collect();
        let mut reply = Mapping::new();
        reply.insert("events".into(), Value::Array(events));
        reply
    }

    /// Reply kwargs for `query_messages`; drains the log.
    pub fn messages_reply(&mut self) -> Mapping {
        let messages: Vec<Value> = self
            .take_messages()
            .into_iter()
            .map(|m| json!({"source": m.source, "time": m.time, "text": m.text}))
            .collect();
        let mut reply = Mapping::new();
        reply.insert("messages".into(), Value::Array(messages));
        reply
    }

    /// Reply kwargs for `query_data`, one entry per source; clears the live view.
    pub fn data_reply(&mut self) -> Mapping {
        std::mem::take(&mut self.live)
            .into_iter()
            .map(|(source, live)| (source, live.to_json()))
            .collect()
    }
}
