//! Participants: the [`Worker`] trait, the per-participant [`Context`] and message dispatch.
//!
//! A participant is one worker or saver running in its own process. Its behaviour is a
//! [`Worker`] implementation; its connection to the fleet is a [`Context`] built from the
//! topology wiring.

pub mod dispatch;

pub use dispatch::{Dispatch, Handler, TEST_CONNECTION};

use crate::error::{ConfigError, FleetError, FleetResult};
use crate::supervisor::Boot;
use crate::topology::{Role, Wiring};
use crate::transport::{Inbox, LinkSettings, Publisher, Sender, Subscriber};
use crate::wire::{Buffer, ErrorReport, Mapping, Message, Payload};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Poll timeout used when a worker does not override [`Worker::poll_timeout`].
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Return this (or wrap it with `anyhow`) to ask the orchestrator for a fleet shutdown.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct CriticalError(pub String);

/// Behaviour of a participant.
///
/// All hooks run inside the participant's own process. Errors and panics raised inside them are
/// reported to the orchestrator as ERROR messages; the participant keeps running.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Registers message handlers. Called once before `setup`.
    fn register(_dispatch: &mut Dispatch<Self>) -> Result<(), ConfigError>
    where
        Self: Sized,
    {
        Ok(())
    }

    async fn setup(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// One unit of work, run once per loop iteration after inbound messages are handled.
    async fn step(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on each rising edge of the start flag.
    async fn on_start(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on each rising edge of the stop flag.
    async fn on_stop(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Applies new constructor parameters received over the control pipe.
    fn update_params(&mut self, _params: &serde_json::Value) -> anyhow::Result<()> {
        Err(anyhow!("this worker has no adjustable parameters"))
    }

    /// How long each loop iteration waits for inbound messages.
    fn poll_timeout(&self) -> Duration {
        DEFAULT_POLL_TIMEOUT
    }
}

/// Type-erased entry point a participant process runs.
pub struct Launch(Box<dyn FnOnce(Boot) -> LocalBoxFuture<'static, FleetResult<()>> + Send>);

impl Launch {
    /// Wraps `worker` in the participant main loop.
    pub fn new<W: Worker>(worker: W) -> Self {
        Self(Box::new(move |boot| {
            crate::supervisor::run_participant(worker, boot).boxed_local()
        }))
    }

    pub(crate) fn into_future(self, boot: Boot) -> LocalBoxFuture<'static, FleetResult<()>> {
        (self.0)(boot)
    }
}

/// A participant's view of the fleet: its capabilities and its inbox.
pub struct Context {
    name: String,
    publisher: Option<Publisher>,
    sender: Option<Sender>,
    subscriber: Subscriber,
    inbox: Inbox,
    exit_requested: bool,
}

impl Context {
    /// Binds and connects the capabilities `wiring` calls for.
    pub async fn connect(wiring: &Wiring, settings: &LinkSettings) -> FleetResult<Self> {
        let inbox = Inbox::new(settings.inbox_capacity);
        let bind_addr = wiring.address.bind_addr();
        let (publisher, sender) = match wiring.role {
            Role::Worker => (
                Some(Publisher::bind(&wiring.name, &bind_addr, settings).await?),
                None,
            ),
            Role::Saver => (
                None,
                Some(Sender::bind(&wiring.name, &bind_addr, inbox.sender(), settings).await?),
            ),
            Role::Orchestrator => {
                return Err(FleetError::Configuration(ConfigError::Invalid(
                    "the orchestrator does not run as a participant".into(),
                )))
            }
        };

        let mut subscriber = Subscriber::new(&wiring.name, inbox.sender(), settings.clone());
        for sub in &wiring.subscriptions {
            subscriber.add_subscription(&sub.producer, sub.address.connect_addr(), sub.kinds);
        }

        Ok(Self {
            name: wiring.name.clone(),
            publisher,
            sender,
            subscriber,
            inbox,
            exit_requested: false,
        })
    }

    /// The participant name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes to subscribers. A saver, which has no publisher, sends to the orchestrator.
    pub fn publish(&self, payload: Payload) -> FleetResult<()> {
        let message = Message::new(&self.name, payload);
        match (&self.publisher, &self.sender) {
            (Some(publisher), _) => {
                publisher.publish(&message)?;
                Ok(())
            }
            (None, Some(sender)) => sender.send(&message),
            (None, None) => Ok(()),
        }
    }

    /// Sends to the orchestrator: over the point-to-point link if there is one, otherwise
    /// through the publisher (the orchestrator subscribes to every worker).
    pub fn report(&self, payload: Payload) -> FleetResult<()> {
        let message = Message::new(&self.name, payload);
        match (&self.sender, &self.publisher) {
            (Some(sender), _) => sender.send(&message),
            (None, Some(publisher)) => {
                publisher.publish(&message)?;
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    /// Publishes timestamped values stamped now.
    pub fn publish_timestamped(&self, data: Mapping) -> FleetResult<()> {
        self.publish(Payload::Timestamped {
            time: crate::wire::now(),
            data,
        })
    }

    /// Publishes values of sample `index`.
    pub fn publish_indexed(&self, index: i64, data: Mapping) -> FleetResult<()> {
        self.publish(Payload::Indexed {
            time: crate::wire::now(),
            index,
            data,
        })
    }

    /// Publishes an array for sample `index`.
    pub fn publish_array(&self, index: i64, buffer: Buffer) -> FleetResult<()> {
        self.publish(Payload::Array {
            time: crate::wire::now(),
            index,
            buffer,
        })
    }

    /// Publishes image frame `index`.
    pub fn publish_frame(&self, index: i64, buffer: Buffer) -> FleetResult<()> {
        self.publish(Payload::Frame {
            time: crate::wire::now(),
            index,
            buffer,
        })
    }

    /// Publishes an EVENT.
    pub fn send_event(&self, name: &str, kwargs: Mapping) -> FleetResult<()> {
        self.publish(Payload::event(name, kwargs))
    }

    /// Publishes a STRING.
    pub fn send_string(&self, text: impl Into<String>) -> FleetResult<()> {
        self.publish(Payload::String(text.into()))
    }

    /// Sends an ERROR to the orchestrator.
    pub fn report_error(&self, report: ErrorReport, trace: String) -> FleetResult<()> {
        self.report(Payload::Error { report, trace })
    }

    /// Answers the connection check, but only once every subscription is live.
    pub(crate) fn answer_connection_check(&self) {
        if !self.is_connected() {
            tracing::debug!(participant = %self.name, pending = ?self.subscriber.pending(), "not fully wired yet");
            return;
        }
        if let Err(e) = self.report(Payload::Connection(true)) {
            warn!(participant = %self.name, error = %e, "failed to answer the connection check");
        }
    }

    /// Whether every subscription of this participant is live.
    pub fn is_connected(&self) -> bool {
        self.subscriber.all_connected()
    }

    /// Leaves the main loop after the current iteration.
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    /// Whether exit was requested by EXIT or [`request_exit`](Self::request_exit).
    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub(crate) async fn poll(&mut self, timeout: Duration) -> Vec<Message> {
        self.inbox.poll(timeout).await
    }
}
