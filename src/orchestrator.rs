//! The orchestrator: owns the fleet.
//!
//! It holds a publisher every participant subscribes to, a subscriber on every worker
//! (CONNECTION and ERROR), a point-to-point link to every saver, the recording session and
//! the supervisor with one handle per participant.
//!
//! ```text
//!                  EXIT/EVENT/TRIGGER
//!   orchestrator ──────────────────────> workers ──data──> savers
//!        ^  ^                                │               │
//!        │  └──────── CONNECTION/ERROR ──────┘               │
//!        └──────────── REQUEST / replies (point-to-point) ───┘
//! ```

use crate::config::{FleetConfig, TriggerKind};
use crate::error::{ConfigError, FleetError, FleetResult};
use crate::handshake::{self, HandshakeReport};
use crate::recording::saver::CONNECTION;
use crate::recording::{BackendRegistry, RecordingSession, START_RECORDING, STOP_RECORDING};
use crate::supervisor::{Body, LifecycleState, ParticipantLauncher, ParticipantSpec, Supervisor, WorkerHandle};
use crate::topology::{Topology, ORCHESTRATOR};
use crate::transport::{Inbox, LinkSettings, Publisher, Receiver, Subscriber};
use crate::wire::{ErrorReport, Mapping, Message, Payload};
use crate::workers::WorkerRegistry;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// An ERROR a participant reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    /// Participant that reported it
    pub source: String,
    /// Classification and message
    pub report: ErrorReport,
    /// Where it happened
    pub trace: String,
}

#[derive(Debug)]
struct IntervalTrigger {
    name: String,
    period: Duration,
    next: Instant,
}

/// Owns the fleet: its sockets, its participant processes and the recording session.
pub struct Orchestrator {
    config: FleetConfig,
    topology: Topology,
    publisher: Publisher,
    subscriber: Subscriber,
    receiver: Receiver,
    inbox: Inbox,
    supervisor: Supervisor,
    session: RecordingSession,
    triggers: Vec<IntervalTrigger>,
    connected: BTreeSet<String>,
    pending: VecDeque<Message>,
    errors: Vec<ErrorRecord>,
    shutdown_requests: Vec<ErrorRecord>,
}

impl Orchestrator {
    /// Builds the topology, binds the orchestrator's publisher and starts one process per
    /// participant with `launcher`.
    ///
    /// Every worker and backend is constructed once here before the first process starts,
    /// so a bad module or saver leaves nothing running. The launcher's program must know
    /// the same worker kinds and backends as `workers` and `backends`.
    pub async fn launch(
        config: FleetConfig,
        workers: &WorkerRegistry,
        backends: &BackendRegistry,
        launcher: ParticipantLauncher,
    ) -> FleetResult<Self> {
        config.validate()?;
        let topology = Topology::build(&config)?;
        let settings = LinkSettings::from(&config.transport);

        let mut bodies: HashMap<String, Body> = HashMap::new();
        for module in &config.modules {
            workers.create(module)?;
            bodies.insert(
                module.name.clone(),
                Body::Worker {
                    module: module.clone(),
                },
            );
        }
        for saver in &config.savers {
            backends.create(saver)?;
            bodies.insert(
                saver.name.clone(),
                Body::Saver {
                    saver: saver.clone(),
                    sources: topology.saver_workers(&saver.name).to_vec(),
                },
            );
        }

        let own = topology
            .orchestrator()
            .cloned()
            .ok_or_else(|| FleetError::UnknownParticipant(ORCHESTRATOR.into()))?;
        let publisher = Publisher::bind(ORCHESTRATOR, &own.address.bind_addr(), &settings).await?;
        let inbox = Inbox::new(settings.inbox_capacity);

        let mut supervisor = Supervisor::new(launcher, inbox.sender());
        for wiring in topology.participants() {
            let body = bodies
                .remove(&wiring.name)
                .ok_or_else(|| FleetError::UnknownParticipant(wiring.name.clone()))?;
            supervisor.spawn(&ParticipantSpec {
                wiring: wiring.clone(),
                transport: config.transport.clone(),
                logging: config.logging.clone(),
                body,
            })?;
        }

        let mut subscriber = Subscriber::new(ORCHESTRATOR, inbox.sender(), settings.clone());
        for sub in &own.subscriptions {
            subscriber.add_subscription(&sub.producer, sub.address.connect_addr(), sub.kinds);
        }
        let mut receiver = Receiver::new(ORCHESTRATOR, inbox.sender(), settings.clone());
        for peer in &own.peers {
            receiver.add_peer(&peer.peer, peer.address.connect_addr());
        }

        let now = Instant::now();
        let triggers = config
            .triggers
            .iter()
            .filter(|t| t.kind == TriggerKind::Interval)
            .filter_map(|t| {
                t.period.map(|period| IntervalTrigger {
                    name: t.name.clone(),
                    period,
                    next: now + period,
                })
            })
            .collect();

        info!(
            participants = supervisor.handles().len(),
            address = %own.address,
            "fleet launched"
        );
        Ok(Self {
            config,
            topology,
            publisher,
            subscriber,
            receiver,
            inbox,
            supervisor,
            session: RecordingSession::new(),
            triggers,
            connected: BTreeSet::new(),
            pending: VecDeque::new(),
            errors: Vec::new(),
            shutdown_requests: Vec::new(),
        })
    }

    /// Addresses and edges of the fleet.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The validated configuration.
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Participant process handles.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Worker and saver names in startup order.
    pub fn participant_names(&self) -> Vec<String> {
        self.topology
            .participants()
            .map(|w| w.name.clone())
            .collect()
    }

    /// Whether `name` has answered CONNECTION(true).
    pub fn is_connected(&self, name: &str) -> bool {
        self.connected.contains(name)
    }

    /// Last lifecycle state `name` reported.
    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.supervisor.get(name).map(|h| h.state())
    }

    /// Whether the process of `name` has ended, cleanly or not.
    pub fn has_exited(&self, name: &str) -> bool {
        self.supervisor
            .get(name)
            .is_some_and(WorkerHandle::is_finished)
    }

    /// Runs the connection handshake with the configured timing.
    pub async fn connect(&mut self) -> HandshakeReport {
        let config = self.config.handshake.clone();
        handshake::run(self, &config).await
    }

    fn broadcast(&self, payload: Payload) -> FleetResult<usize> {
        Ok(self.publisher.publish(&Message::new(ORCHESTRATOR, payload))?)
    }

    /// Broadcasts an EVENT to every participant.
    pub fn send_event(&self, name: &str, kwargs: Mapping) -> FleetResult<()> {
        let reached = self.broadcast(Payload::event(name, kwargs))?;
        debug!(event = name, subscribers = reached, "event broadcast");
        Ok(())
    }

    /// Broadcasts a STRING to every participant.
    pub fn send_string(&self, text: impl Into<String>) -> FleetResult<()> {
        self.broadcast(Payload::String(text.into()))?;
        Ok(())
    }

    /// Broadcasts a TRIGGER to every participant.
    pub fn send_trigger(&self) -> FleetResult<()> {
        self.broadcast(Payload::Trigger)?;
        Ok(())
    }

    /// Whether a recording is open.
    pub fn is_recording(&self) -> bool {
        self.session.is_recording()
    }

    /// Opens recording `idx` fleet-wide, written into `directory` under `<filename>_<idx>`.
    ///
    /// Returns false, changing nothing, if one is already open. `filename` must be a bare
    /// name without path separators.
    pub fn start_recording(
        &mut self,
        directory: impl Into<PathBuf>,
        filename: impl Into<String>,
    ) -> FleetResult<bool> {
        let filename = filename.into();
        if filename.is_empty() || filename.contains(['/', '\\']) {
            return Err(FleetError::Configuration(ConfigError::Invalid(format!(
                "recording filename '{filename}' must be a bare name"
            ))));
        }
        let Some(target) = self.session.start(directory, filename) else {
            debug!("recording already active");
            return Ok(false);
        };
        let mut kwargs = Mapping::new();
        kwargs.insert(
            "directory".into(),
            json!(target.directory.display().to_string()),
        );
        kwargs.insert("filename".into(), json!(target.filename));
        kwargs.insert("idx".into(), json!(target.index));
        kwargs.insert("session_id".into(), json!(target.session_id.to_string()));
        info!(recording = target.index, directory = %target.directory.display(), "recording started");

        self.supervisor.start_all();
        self.send_event(START_RECORDING, kwargs)?;
        Ok(true)
    }

    /// Closes the open recording. Returns false if none was open.
    pub fn stop_recording(&mut self) -> FleetResult<bool> {
        let Some(target) = self.session.stop() else {
            debug!("no recording to stop");
            return Ok(false);
        };
        info!(recording = target.index, "recording stopped");
        self.supervisor.stop_all();
        self.send_event(STOP_RECORDING, Mapping::new())?;
        Ok(true)
    }

    /// Sends a REQUEST to one saver and waits for its reply.
    ///
    /// Messages that arrive meanwhile are handled as usual and kept for the next [`poll`](Self::poll).
    pub async fn request(&mut self, saver: &str, query: &str, timeout: Duration) -> FleetResult<Message> {
        self.receiver
            .send_to(saver, &Message::new(ORCHESTRATOR, Payload::Request(query.to_string())))?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FleetError::RequestTimeout {
                    saver: saver.to_string(),
                    query: query.to_string(),
                });
            }
            let mut reply = None;
            for message in self.inbox.poll(remaining).await {
                self.handle(&message);
                if reply.is_none() && message.source() == saver && is_reply(query, &message) {
                    reply = Some(message);
                } else {
                    self.pending.push_back(message);
                }
            }
            if let Some(reply) = reply {
                return Ok(reply);
            }
        }
    }

    /// Waits up to `timeout` for inbound messages, handles them and returns them.
    pub async fn poll(&mut self, timeout: Duration) -> Vec<Message> {
        if !self.pending.is_empty() {
            return self.pending.drain(..).collect();
        }
        let batch = self.inbox.poll(timeout).await;
        for message in &batch {
            self.handle(message);
        }
        batch
    }

    /// Handles whatever arrives within `timeout`, keeping it for the next [`poll`](Self::poll).
    pub(crate) async fn pump(&mut self, timeout: Duration) {
        for message in self.inbox.poll(timeout).await {
            self.handle(&message);
            self.pending.push_back(message);
        }
    }

    fn handle(&mut self, message: &Message) {
        match message.payload() {
            Payload::Connection(true) => {
                if self.connected.insert(message.source().to_string()) {
                    debug!(participant = message.source(), "participant connected");
                }
            }
            Payload::Connection(false) => {
                debug!(participant = message.source(), "participant reports incomplete wiring");
            }
            Payload::Error { report, trace } => {
                error!(
                    source = message.source(),
                    kind = %report.kind,
                    critical = report.critical,
                    trace = %trace,
                    "{}", report.message
                );
                let record = ErrorRecord {
                    source: message.source().to_string(),
                    report: report.clone(),
                    trace: trace.clone(),
                };
                if report.critical {
                    warn!(source = message.source(), "participant requested fleet shutdown");
                    self.shutdown_requests.push(record.clone());
                }
                self.errors.push(record);
            }
            Payload::Trigger => {
                debug!(source = message.source(), "remote trigger");
                if let Err(e) = self.send_trigger() {
                    warn!(error = %e, "failed to rebroadcast remote trigger");
                }
            }
            _ => {}
        }
    }

    /// Fires every interval trigger that is due. Returns how many fired.
    pub fn check_triggers(&mut self) -> FleetResult<usize> {
        let now = Instant::now();
        let mut fired = 0;
        for trigger in &mut self.triggers {
            if now < trigger.next {
                continue;
            }
            trigger.next += trigger.period;
            if trigger.next <= now {
                // fell behind; do not fire a burst
                trigger.next = now + trigger.period;
            }
            debug!(trigger = %trigger.name, "interval trigger fired");
            fired += 1;
        }
        for _ in 0..fired {
            self.send_trigger()?;
        }
        Ok(fired)
    }

    /// Time until the next interval trigger is due.
    pub fn next_trigger_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.triggers
            .iter()
            .map(|t| t.next.saturating_duration_since(now))
            .min()
    }

    /// Sends new parameters to one participant through its control pipe.
    pub async fn update_params(&self, name: &str, params: serde_json::Value) -> FleetResult<()> {
        let handle = self
            .supervisor
            .get(name)
            .ok_or_else(|| FleetError::UnknownParticipant(name.to_string()))?;
        handle
            .update_params(params, self.config.handshake.join_timeout)
            .await
    }

    /// Every ERROR received so far.
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// Critical ERRORs: participants asking for the fleet to shut down.
    pub fn shutdown_requests(&self) -> &[ErrorRecord] {
        &self.shutdown_requests
    }

    /// Whether every orchestrator subscription is connected.
    pub fn subscriptions_live(&self) -> bool {
        self.subscriber.all_connected()
    }

    /// Closes any open recording, broadcasts EXIT and joins every participant.
    pub async fn shutdown(mut self, timeout: Duration) -> FleetResult<()> {
        if self.session.is_recording() {
            self.stop_recording()?;
        }
        if let Err(e) = self.broadcast(Payload::Exit) {
            warn!(error = %e, "failed to broadcast exit");
        }
        self.supervisor.exit_all();
        let joined = self.supervisor.join_all(timeout).await;
        match &joined {
            Ok(()) => info!("fleet shut down"),
            Err(e) => error!(error = %e, "fleet shut down with errors"),
        }
        joined
    }
}

/// Savers answer `connection` with CONNECTION and every other query with an EVENT of the
/// same name, or an ERROR.
fn is_reply(query: &str, message: &Message) -> bool {
    match message.payload() {
        Payload::Error { .. } => true,
        Payload::Connection(_) => query == CONNECTION,
        Payload::Event { name, .. } => name == query,
        _ => false,
    }
}
