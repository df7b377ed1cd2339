//! Explicit handler table, built once per participant.

use super::Context;
use crate::error::ConfigError;
use crate::wire::{Message, Topic};
use std::collections::HashMap;

/// Event name of the built-in connection check.
pub const TEST_CONNECTION: &str = "test_connection";

/// A message handler. Handlers run inside the participant loop and must not block.
pub type Handler<W> = fn(&mut W, &mut Context, &Message) -> anyhow::Result<()>;

/// Behaviour every participant gets without registering anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// EXIT: leave the running loop.
    Exit,
    /// EVENT `test_connection`: reply CONNECTION(true).
    TestConnection,
}

/// Where an inbound message goes.
pub enum Route<W> {
    /// Handled by the participant loop itself.
    Builtin(Builtin),
    /// A registered handler.
    Handler(Handler<W>),
    /// EVENT with a name nobody registered; harmless.
    UnknownEvent,
    /// Topic with no handler; dropped with a warning.
    Unhandled,
}

/// Topic handlers plus named event handlers.
pub struct Dispatch<W> {
    topics: HashMap<Topic, Handler<W>>,
    events: HashMap<String, Handler<W>>,
    other_events: Option<Handler<W>>,
}

impl<W> Default for Dispatch<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Dispatch<W> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
            events: HashMap::new(),
            other_events: None,
        }
    }

    /// Registers the handler for every message of `topic`.
    ///
    /// EXIT is built in and EVENT is routed by name, so neither can be registered here.
    pub fn on_topic(&mut self, topic: Topic, handler: Handler<W>) -> Result<(), ConfigError> {
        if matches!(topic, Topic::Exit | Topic::Event) {
            return Err(ConfigError::ReservedHandler(format!("topic '{topic}'")));
        }
        if self.topics.insert(topic, handler).is_some() {
            return Err(ConfigError::DuplicateHandler(format!("topic '{topic}'")));
        }
        Ok(())
    }

    /// Registers the handler for EVENT messages named `name`.
    pub fn on_event(&mut self, name: &str, handler: Handler<W>) -> Result<(), ConfigError> {
        if name == TEST_CONNECTION {
            return Err(ConfigError::ReservedHandler(format!("event '{name}'")));
        }
        if self.events.insert(name.to_string(), handler).is_some() {
            return Err(ConfigError::DuplicateHandler(format!("event '{name}'")));
        }
        Ok(())
    }

    /// Registers the handler for EVENT messages no named handler claims.
    pub fn on_other_events(&mut self, handler: Handler<W>) -> Result<(), ConfigError> {
        if self.other_events.replace(handler).is_some() {
            return Err(ConfigError::DuplicateHandler("unnamed events".into()));
        }
        Ok(())
    }

    /// Picks the destination of `message`.
    pub fn route(&self, message: &Message) -> Route<W> {
        match message.topic() {
            Topic::Exit => Route::Builtin(Builtin::Exit),
            Topic::Event => match message.event_name() {
                Some(TEST_CONNECTION) => Route::Builtin(Builtin::TestConnection),
                Some(name) => self
                    .events
                    .get(name)
                    .or(self.other_events.as_ref())
                    .map_or(Route::UnknownEvent, |h| Route::Handler(*h)),
                None => Route::UnknownEvent,
            },
            topic => self
                .topics
                .get(&topic)
                .map_or(Route::Unhandled, |h| Route::Handler(*h)),
        }
    }

    /// Registered event names, sorted.
    pub fn events(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.events.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
