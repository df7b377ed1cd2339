//! Startup connection handshake.
//!
//! The orchestrator broadcasts the `test_connection` event until every participant has
//! answered CONNECTION(true) or the timeout expires. A participant only answers once all of
//! its own subscriptions are live, so a complete handshake means the whole fleet is wired.
//!
//! Checks sent before a subscriber connects are lost; rebroadcasting covers that. Timing out
//! is not an error: the fleet keeps running with the unresponsive participants logged.
//! A participant whose process already ended is not waited for; it is reported as exited.

use crate::config::HandshakeConfig;
use crate::orchestrator::Orchestrator;
use crate::participant::TEST_CONNECTION;
use crate::wire::Mapping;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of one handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandshakeReport {
    /// Participants that answered, with the time it took.
    pub responded: BTreeMap<String, Duration>,
    /// Participants that never answered, with how long they were waited for.
    pub unresponsive: Vec<(String, Duration)>,
    /// Participants whose process ended before answering.
    pub exited: Vec<String>,
}

impl HandshakeReport {
    /// Whether every participant answered.
    pub fn is_complete(&self) -> bool {
        self.unresponsive.is_empty() && self.exited.is_empty()
    }
}

/// Checks every participant of `orchestrator` until all answered or `config.timeout` elapsed.
pub async fn run(orchestrator: &mut Orchestrator, config: &HandshakeConfig) -> HandshakeReport {
    let expected = orchestrator.participant_names();
    let interval = config.rebroadcast_interval.max(Duration::from_millis(1));
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut responded = BTreeMap::new();
    let mut exited = Vec::new();
    let mut next_check = started;

    loop {
        for name in &expected {
            if responded.contains_key(name) || exited.contains(name) {
                continue;
            }
            if orchestrator.is_connected(name) {
                responded.insert(name.clone(), started.elapsed());
            } else if orchestrator.has_exited(name) {
                warn!(participant = %name, "participant exited before answering the connection check");
                exited.push(name.clone());
            }
        }
        if responded.len() + exited.len() == expected.len() {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if now >= next_check {
            if let Err(e) = orchestrator.send_event(TEST_CONNECTION, Mapping::new()) {
                warn!(error = %e, "failed to broadcast the connection check");
            }
            next_check = now + interval;
        }
        let wait = next_check.min(deadline).saturating_duration_since(Instant::now());
        orchestrator.pump(wait).await;
    }

    let waited = started.elapsed();
    let unresponsive: Vec<(String, Duration)> = expected
        .into_iter()
        .filter(|name| !responded.contains_key(name) && !exited.contains(name))
        .map(|name| (name, waited))
        .collect();
    for (name, waited) in &unresponsive {
        warn!(participant = %name, waited = ?waited, "participant did not answer the connection check");
    }
    if unresponsive.is_empty() && exited.is_empty() {
        info!(participants = responded.len(), elapsed = ?waited, "fleet connected");
    }
    HandshakeReport {
        responded,
        unresponsive,
        exited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_completeness() {
        let mut report = HandshakeReport::default();
        assert!(report.is_complete());
        report
            .unresponsive
            .push(("cam".into(), Duration::from_secs(1)));
        assert!(!report.is_complete());

        let exited = HandshakeReport {
            exited: vec!["cam".into()],
            ..HandshakeReport::default()
        };
        assert!(!exited.is_complete());
    }
}
