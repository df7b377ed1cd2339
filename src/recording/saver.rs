//! The saver participant: caches DATA while recording and flushes it to a backend.
//!
//! Whether or not a recording is open, a saver also keeps a [`Journal`] of the events and
//! text messages it received and of the latest data per source. The orchestrator reads it
//! with REQUEST queries; every reply is an EVENT named after the query.
//!
//! | Query            | Reply kwargs                                  | Drains |
//! |------------------|-----------------------------------------------|--------|
//! | `connection`     | (CONNECTION, not an EVENT)                    | -      |
//! | `status`         | recording state and counters                  | no     |
//! | `query_messages` | `messages`: `[{source, time, text}]`          | yes    |
//! | `query_events`   | `events`: `[{source, time, name, kwargs}]`    | yes    |
//! | `query_data`     | one entry per source, see [`Journal`]         | yes    |

use super::backend::{FlushSummary, SaverBackend};
use super::cache::{CachedEntry, RecordingCache};
use super::journal::{Journal, QUERY_DATA, QUERY_EVENTS, QUERY_MESSAGES};
use super::session::{RecordingSession, RecordingTarget};
use crate::error::ConfigError;
use crate::participant::{Context, Dispatch, Worker};
use crate::wire::{ErrorReport, Mapping, Message, Payload, Topic};
use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// EVENT that opens a recording; kwargs `directory`, `filename` and `idx`.
pub const START_RECORDING: &str = "start_recording";
/// EVENT that closes the recording and flushes every cache.
pub const STOP_RECORDING: &str = "stop_recording";
/// Query (and reply EVENT) for the saver's counters.
pub const STATUS: &str = "status";
/// Query answered with CONNECTION.
pub const CONNECTION: &str = "connection";

/// Every query a saver answers.
pub const QUERIES: [&str; 5] = [CONNECTION, STATUS, QUERY_MESSAGES, QUERY_EVENTS, QUERY_DATA];

const JOURNAL_CAPACITY: usize = 1000;

/// Arguments of [`START_RECORDING`]. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
struct StartRequest {
    directory: PathBuf,
    filename: String,
    /// Recording index chosen by the orchestrator
    #[serde(default)]
    idx: Option<u32>,
}

/// Records its workers through one backend.
pub struct Saver {
    backend: Box<dyn SaverBackend>,
    sources: Vec<String>,
    session: RecordingSession,
    cache: RecordingCache,
    journal: Journal,
    flushed: usize,
    last_flush: Option<FlushSummary>,
}

impl Saver {
    /// A saver for `sources`, keeping up to `cache_size` entries per source and shape.
    pub fn new(backend: Box<dyn SaverBackend>, sources: Vec<String>, cache_size: usize) -> Self {
        Self {
            backend,
            cache: RecordingCache::new(sources.iter().cloned(), cache_size),
            sources,
            session: RecordingSession::new(),
            journal: Journal::new(JOURNAL_CAPACITY),
            flushed: 0,
            last_flush: None,
        }
    }

    fn status(&self) -> Mapping {
        let mut status = Mapping::new();
        status.insert("recording".into(), json!(self.session.is_recording()));
        if let Some(target) = self.session.target() {
            status.insert("index".into(), json!(target.index));
        }
        status.insert("cached".into(), json!(self.cache.cached()));
        status.insert("flushed".into(), json!(self.flushed));
        status.insert("evicted".into(), json!(self.cache.evicted()));
        status.insert("discarded".into(), json!(self.cache.discarded()));
        status.insert("rejected".into(), json!(self.cache.rejected()));
        status.insert("events".into(), json!(self.journal.event_count()));
        status.insert("messages".into(), json!(self.journal.message_count()));
        status.insert("backend".into(), json!(self.backend.name()));
        if let Some(summary) = &self.last_flush {
            let paths: Vec<String> = summary
                .paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            status.insert("paths".into(), json!(paths));
        }
        status
    }

    /// Reply to every query except `connection`; `None` for queries the saver does not know.
    fn answer(&mut self, query: &str) -> Option<Payload> {
        let kwargs = match query {
            STATUS => self.status(),
            QUERY_MESSAGES => self.journal.messages_reply(),
            QUERY_EVENTS => self.journal.events_reply(),
            QUERY_DATA => self.journal.data_reply(),
            _ => return None,
        };
        Some(Payload::event(query, kwargs))
    }

    fn admit(&mut self, message: &Message) -> bool {
        if let Some(entry) = CachedEntry::from_message(message) {
            if self.cache.declares(&entry.source) {
                self.journal.observe(&entry);
            }
        }
        self.cache.admit(message)
    }

    /// Opens a recording. `Ok(None)` if one is already open; the caches are left untouched.
    fn begin(&mut self, kwargs: &Mapping) -> anyhow::Result<Option<RecordingTarget>> {
        let request: StartRequest = serde_json::from_value(Value::Object(kwargs.clone()))
            .context("invalid start_recording arguments")?;
        let started = match request.idx {
            Some(idx) => self
                .session
                .start_numbered(request.directory, request.filename, idx),
            None => self.session.start(request.directory, request.filename),
        };
        let Some(target) = started.cloned() else {
            return Ok(None);
        };
        if let Err(e) = self.backend.start_recording(&target, &self.sources) {
            self.session.stop();
            return Err(e).context("backend refused to start recording");
        }
        self.cache.begin();
        Ok(Some(target))
    }

    /// Closes the recording and flushes every cache. `Ok(None)` if none was open.
    fn finish(&mut self) -> anyhow::Result<Option<FlushSummary>> {
        if self.session.stop().is_none() {
            return Ok(None);
        }
        let entries = self.cache.finish();
        let mut failed = None;
        for entry in &entries {
            if let Err(e) = self.backend.accept(entry) {
                failed = Some(e);
                break;
            }
        }
        // the backend is closed even when an entry was refused
        let summary = self.backend.stop_recording();
        if let Some(e) = failed {
            return Err(e).context("backend refused an entry");
        }
        let summary = summary.context("backend failed to finish recording")?;
        self.flushed += summary.entries;
        self.last_flush = Some(summary.clone());
        Ok(Some(summary))
    }

    fn on_data(&mut self, _ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        self.admit(message);
        Ok(())
    }

    fn on_trigger(&mut self, ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        debug!(saver = %ctx.name(), source = message.source(), "trigger ignored");
        Ok(())
    }

    fn on_string(&mut self, _ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        self.journal.record_string(message);
        Ok(())
    }

    fn on_event(&mut self, _ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        self.journal.record_event(message);
        Ok(())
    }

    fn on_request(&mut self, ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        let Payload::Request(query) = message.payload() else {
            return Ok(());
        };
        if query == CONNECTION {
            ctx.report(Payload::Connection(ctx.is_connected()))?;
            return Ok(());
        }
        match self.answer(query) {
            Some(reply) => ctx.report(reply)?,
            None => {
                let report = ErrorReport {
                    kind: "UnknownQuery".into(),
                    message: format!("unknown request '{query}'"),
                    critical: false,
                };
                warn!(saver = %ctx.name(), query = %query, "unknown request");
                let trace = format!(
                    "{} received request '{query}' from {}",
                    ctx.name(),
                    message.source()
                );
                ctx.report_error(report, trace)?;
            }
        }
        Ok(())
    }

    fn on_start_recording(&mut self, ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        self.journal.record_event(message);
        let Payload::Event { kwargs, .. } = message.payload() else {
            return Ok(());
        };
        match self.begin(kwargs)? {
            Some(target) => {
                info!(saver = %ctx.name(), recording = target.index, directory = %target.directory.display(), "recording started");
            }
            None => debug!(saver = %ctx.name(), "already recording"),
        }
        Ok(())
    }

    fn on_stop_recording(&mut self, ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        self.journal.record_event(message);
        match self.finish()? {
            Some(summary) => {
                info!(saver = %ctx.name(), entries = summary.entries, skipped = summary.skipped, "recording flushed");
            }
            None => debug!(saver = %ctx.name(), "not recording"),
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for Saver {
    fn register(dispatch: &mut Dispatch<Self>) -> Result<(), ConfigError> {
        dispatch.on_topic(Topic::Data, Self::on_data)?;
        dispatch.on_topic(Topic::Request, Self::on_request)?;
        dispatch.on_topic(Topic::Trigger, Self::on_trigger)?;
        dispatch.on_topic(Topic::String, Self::on_string)?;
        dispatch.on_event(START_RECORDING, Self::on_start_recording)?;
        dispatch.on_event(STOP_RECORDING, Self::on_stop_recording)?;
        dispatch.on_other_events(Self::on_event)?;
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        if self.session.is_recording() {
            warn!(saver = %ctx.name(), "exiting while recording, flushing");
            if let Some(summary) = self.finish()? {
                info!(saver = %ctx.name(), entries = summary.entries, "recording flushed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetResult;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Keeps whatever it is given.
    #[derive(Default, Clone)]
    struct Memory {
        started: Arc<Mutex<Vec<RecordingTarget>>>,
        pending: Arc<Mutex<Vec<CachedEntry>>>,
        written: Arc<Mutex<Vec<CachedEntry>>>,
    }

    impl SaverBackend for Memory {
        fn name(&self) -> &str {
            "memory"
        }

        fn start_recording(&mut self, target: &RecordingTarget, _: &[String]) -> FleetResult<()> {
            self.started.lock().push(target.clone());
            Ok(())
        }

        fn accept(&mut self, entry: &CachedEntry) -> FleetResult<()> {
            self.pending.lock().push(entry.clone());
            Ok(())
        }

        fn stop_recording(&mut self) -> FleetResult<FlushSummary> {
            let entries = std::mem::take(&mut *self.pending.lock());
            let count = entries.len();
            self.written.lock().extend(entries);
            Ok(FlushSummary {
                entries: count,
                skipped: 0,
                paths: self
                    .started
                    .lock()
                    .last()
                    .map(|t| t.output_path(None, "mem"))
                    .into_iter()
                    .collect(),
            })
        }
    }

    fn saver(memory: &Memory) -> Saver {
        Saver::new(Box::new(memory.clone()), vec!["w1".into(), "w2".into()], 16)
    }

    fn start_kwargs(idx: u32) -> Mapping {
        let mut kwargs = Mapping::new();
        kwargs.insert("directory".into(), json!("/data/day1"));
        kwargs.insert("filename".into(), json!("run"));
        kwargs.insert("idx".into(), json!(idx));
        kwargs.insert("session_id".into(), json!("ignored"));
        kwargs
    }

    fn sample(source: &str, time: f64) -> Message {
        let mut data = Mapping::new();
        data.insert("value".into(), json!(time));
        Message::new(source, Payload::Timestamped { time, data })
    }

    #[test]
    fn test_second_start_keeps_cached_data() {
        let memory = Memory::default();
        let mut saver = saver(&memory);

        assert!(saver.begin(&start_kwargs(1)).unwrap().is_some());
        assert!(saver.admit(&sample("w1", 1.0)));
        assert!(saver.admit(&sample("w2", 2.0)));

        assert!(saver.begin(&start_kwargs(2)).unwrap().is_none());
        assert_eq!(saver.cache.cached(), 2);
        assert_eq!(memory.started.lock().len(), 1);

        let summary = saver.finish().unwrap().unwrap();
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.paths, [PathBuf::from("/data/day1/run_001.mem")]);
    }

    #[test]
    fn test_idle_then_record_then_flush() {
        let memory = Memory::default();
        let mut saver = saver(&memory);

        assert!(!saver.admit(&sample("w1", 0.5)));
        assert!(saver.finish().unwrap().is_none());

        saver.begin(&start_kwargs(3)).unwrap();
        assert!(saver.admit(&sample("w1", 1.0)));
        let summary = saver.finish().unwrap().unwrap();
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.paths, [PathBuf::from("/data/day1/run_003.mem")]);

        let written = memory.written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].time, 1.0);
        drop(written);

        let Some(Payload::Event { name, kwargs }) = saver.answer(STATUS) else {
            panic!("no status reply");
        };
        assert_eq!(name, STATUS);
        assert_eq!(kwargs["recording"], false);
        assert_eq!(kwargs["flushed"], 1);
        assert_eq!(kwargs["discarded"], 1);
    }

    #[test]
    fn test_start_without_directory_is_an_error() {
        let mut saver = saver(&Memory::default());
        let mut kwargs = start_kwargs(1);
        kwargs.remove("directory");
        assert!(saver.begin(&kwargs).is_err());
        assert!(!saver.session.is_recording());
    }

    #[test]
    fn test_queries_drain_the_journal() {
        let mut saver = saver(&Memory::default());
        saver
            .journal
            .record_event(&Message::new("orchestrator", Payload::event("flash", Mapping::new())));
        saver
            .journal
            .record_string(&Message::new("w1", Payload::String("lamp on".into())));
        saver.admit(&sample("w2", 4.0));
        saver.admit(&sample("ghost", 5.0));

        let Some(Payload::Event { name, kwargs }) = saver.answer(QUERY_MESSAGES) else {
            panic!("no messages reply");
        };
        assert_eq!(name, QUERY_MESSAGES);
        assert_eq!(kwargs["messages"][0]["text"], "lamp on");

        let Some(Payload::Event { kwargs, .. }) = saver.answer(QUERY_EVENTS) else {
            panic!("no events reply");
        };
        assert_eq!(kwargs["events"][0]["name"], "flash");
        let Some(Payload::Event { kwargs, .. }) = saver.answer(QUERY_EVENTS) else {
            panic!("no events reply");
        };
        assert_eq!(kwargs["events"], json!([]));

        let Some(Payload::Event { kwargs, .. }) = saver.answer(QUERY_DATA) else {
            panic!("no data reply");
        };
        assert_eq!(kwargs["w2"]["timestamped"]["time"], 4.0);
        assert!(!kwargs.contains_key("ghost"));

        assert!(saver.answer("bogus").is_none());
        assert!(saver.answer(CONNECTION).is_none());
    }
}
