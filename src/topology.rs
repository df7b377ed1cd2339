//! Topology builder.
//!
//! Turns a [`FleetConfig`] into concrete wiring: one address per participant and, for each
//! participant, the list of producers it subscribes to (with allowed kinds) and the
//! point-to-point peers it connects to. The result is immutable.
//!
//! Wiring rules:
//!
//! - every worker subscribes to the orchestrator for EXIT, EVENT and TRIGGER
//! - the orchestrator subscribes to every worker for CONNECTION and ERROR
//! - a worker subscribes to each upstream worker it names for data, EVENT, STRING and TRIGGER
//! - a saver subscribes to the orchestrator for EXIT and EVENT, and to each of its workers
//!   for data, EVENT, STRING and TRIGGER
//! - the orchestrator holds a point-to-point link to every saver (REQUEST out; CONNECTION,
//!   ERROR and replies back)
//! - remote triggers add an orchestrator subscription for TRIGGER

use crate::config::{FleetConfig, TriggerKind};
use crate::error::ConfigError;
use crate::wire::{KindSet, MessageKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Name the orchestrator uses on the wire.
pub const ORCHESTRATOR: &str = "orchestrator";

/// A point-to-point network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// An address on `host`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`.
    pub fn parse(text: &str) -> Option<Self> {
        let (host, port) = text.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?))
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Form used by the side that listens.
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Form used by the side that connects.
    pub fn connect_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Hands out ports in increasing order; a port is never handed out twice in a run.
#[derive(Debug)]
pub struct PortAllocator {
    next: Option<u16>,
    used: HashSet<u16>,
}

impl PortAllocator {
    /// Allocates upwards from `base_port`.
    pub fn new(base_port: u16) -> Self {
        Self {
            next: Some(base_port),
            used: HashSet::new(),
        }
    }

    /// Next free port.
    pub fn allocate(&mut self) -> Result<u16, ConfigError> {
        loop {
            let port = self.next.ok_or(ConfigError::PortsExhausted(u16::MAX))?;
            self.next = port.checked_add(1);
            if self.used.insert(port) {
                return Ok(port);
            }
        }
    }

    /// Reserves an explicit port. Returns false if it was already taken.
    pub fn claim(&mut self, port: u16) -> bool {
        self.used.insert(port)
    }
}

/// Which capabilities a participant is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publisher + subscriber + receiver.
    Orchestrator,
    /// Publisher + subscriber.
    Worker,
    /// Sender + subscriber.
    Saver,
}

/// One subscription edge. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Worker being subscribed to
    pub producer: String,
    /// Where the producer publishes
    pub address: Address,
    /// Kinds admitted on this edge
    pub kinds: KindSet,
}

/// One point-to-point link the participant initiates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLink {
    /// Sender on the other end
    pub peer: String,
    /// Where the peer listens
    pub address: Address,
}

/// Everything a participant needs to set up its capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wiring {
    /// Participant name
    pub name: String,
    /// Which capabilities it gets
    pub role: Role,
    /// Address it binds
    pub address: Address,
    /// Publishers it subscribes to
    pub subscriptions: Vec<Subscription>,
    /// Senders it connects to
    pub peers: Vec<PeerLink>,
}

impl Wiring {
    fn new(name: &str, role: Role, address: Address) -> Self {
        Self {
            name: name.to_string(),
            role,
            address,
            subscriptions: Vec::new(),
            peers: Vec::new(),
        }
    }
}

/// Kinds a consumer accepts from a worker it records or processes.
pub fn upstream_kinds() -> KindSet {
    KindSet::data().union(KindSet::of(&[
        MessageKind::Event,
        MessageKind::String,
        MessageKind::Trigger,
    ]))
}

/// Resolved fleet wiring.
#[derive(Debug, Clone)]
pub struct Topology {
    order: Vec<String>,
    wiring: HashMap<String, Wiring>,
    saver_workers: BTreeMap<String, Vec<String>>,
}

impl Topology {
    /// Builds the wiring, rejecting inconsistent configurations.
    pub fn build(config: &FleetConfig) -> Result<Self, ConfigError> {
        let host = config.transport.host.as_str();
        let auto = config.gui_params.auto_config;

        // names
        let mut workers = HashSet::new();
        let mut savers = HashSet::new();
        for module in &config.modules {
            check_name(&module.name)?;
            if !workers.insert(module.name.as_str()) {
                return Err(ConfigError::DuplicateParticipant(module.name.clone()));
            }
        }
        for saver in &config.savers {
            check_name(&saver.name)?;
            if workers.contains(saver.name.as_str()) || !savers.insert(saver.name.as_str()) {
                return Err(ConfigError::DuplicateParticipant(saver.name.clone()));
            }
        }

        // addresses: orchestrator, then workers, then savers
        let mut ports = PortAllocator::new(config.transport.base_port);
        let mut owners: HashMap<u16, String> = HashMap::new();
        let explicit = config
            .modules
            .iter()
            .map(|m| (m.name.as_str(), m.port))
            .chain(config.savers.iter().map(|s| (s.name.as_str(), s.port)));
        for (name, port) in explicit {
            match port {
                Some(port) => {
                    if let Some(first) = owners.get(&port) {
                        return Err(ConfigError::DuplicatePort {
                            port,
                            first: first.clone(),
                            second: name.to_string(),
                        });
                    }
                    ports.claim(port);
                    owners.insert(port, name.to_string());
                }
                None if !auto => return Err(ConfigError::MissingPort(name.to_string())),
                None => {}
            }
        }

        let mut order = vec![ORCHESTRATOR.to_string()];
        let mut wiring = HashMap::new();
        let orchestrator_port = ports.allocate()?;
        let orchestrator_addr = Address::new(host, orchestrator_port);
        wiring.insert(
            ORCHESTRATOR.to_string(),
            Wiring::new(ORCHESTRATOR, Role::Orchestrator, orchestrator_addr.clone()),
        );

        for module in &config.modules {
            let port = match module.port {
                Some(port) => port,
                None => ports.allocate()?,
            };
            order.push(module.name.clone());
            wiring.insert(
                module.name.clone(),
                Wiring::new(&module.name, Role::Worker, Address::new(host, port)),
            );
        }
        for saver in &config.savers {
            let port = match saver.port {
                Some(port) => port,
                None => ports.allocate()?,
            };
            order.push(saver.name.clone());
            wiring.insert(
                saver.name.clone(),
                Wiring::new(&saver.name, Role::Saver, Address::new(host, port)),
            );
        }

        // saver -> workers, merging modules that name their saver
        let mut saver_workers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for saver in &config.savers {
            let list = saver_workers.entry(saver.name.clone()).or_default();
            for worker in &saver.workers {
                if savers.contains(worker.as_str()) {
                    return Err(ConfigError::SaverSubscribesSaver {
                        saver: saver.name.clone(),
                        target: worker.clone(),
                    });
                }
                if !workers.contains(worker.as_str()) {
                    return Err(ConfigError::UnknownUpstream {
                        subscriber: saver.name.clone(),
                        target: worker.clone(),
                    });
                }
                if !list.contains(worker) {
                    list.push(worker.clone());
                }
            }
        }
        for module in &config.modules {
            if let Some(saver) = &module.saver {
                let list = saver_workers
                    .get_mut(saver)
                    .ok_or_else(|| ConfigError::UnknownSaver {
                        worker: module.name.clone(),
                        saver: saver.clone(),
                    })?;
                if !list.contains(&module.name) {
                    list.push(module.name.clone());
                }
            }
        }

        let address_of = |wiring: &HashMap<String, Wiring>, name: &str| {
            wiring.get(name).map(|w| w.address.clone())
        };

        // worker edges
        for module in &config.modules {
            let mut subs = vec![Subscription {
                producer: ORCHESTRATOR.to_string(),
                address: orchestrator_addr.clone(),
                kinds: KindSet::of(&[MessageKind::Exit, MessageKind::Event, MessageKind::Trigger]),
            }];
            for upstream in &module.subscriptions {
                if upstream == &module.name {
                    return Err(ConfigError::SelfSubscription {
                        participant: module.name.clone(),
                    });
                }
                let address = match address_of(&wiring, upstream) {
                    Some(address) if workers.contains(upstream.as_str()) => address,
                    _ => {
                        return Err(ConfigError::UnknownUpstream {
                            subscriber: module.name.clone(),
                            target: upstream.clone(),
                        })
                    }
                };
                subs.push(Subscription {
                    producer: upstream.clone(),
                    address,
                    kinds: upstream_kinds(),
                });
            }
            if let Some(w) = wiring.get_mut(&module.name) {
                w.subscriptions = subs;
            }
        }

        // saver edges
        for (saver, sources) in &saver_workers {
            let mut subs = vec![Subscription {
                producer: ORCHESTRATOR.to_string(),
                address: orchestrator_addr.clone(),
                kinds: KindSet::of(&[MessageKind::Exit, MessageKind::Event]),
            }];
            for worker in sources {
                if let Some(address) = address_of(&wiring, worker) {
                    subs.push(Subscription {
                        producer: worker.clone(),
                        address,
                        kinds: upstream_kinds(),
                    });
                }
            }
            if let Some(w) = wiring.get_mut(saver) {
                w.subscriptions = subs;
            }
        }

        // orchestrator edges
        let mut orchestrator_subs = Vec::new();
        for module in &config.modules {
            if let Some(address) = address_of(&wiring, &module.name) {
                orchestrator_subs.push(Subscription {
                    producer: module.name.clone(),
                    address,
                    kinds: KindSet::of(&[MessageKind::Connection, MessageKind::Error]),
                });
            }
        }
        for trigger in &config.triggers {
            if trigger.kind != TriggerKind::Remote {
                continue;
            }
            let address = trigger
                .address
                .as_deref()
                .and_then(Address::parse)
                .ok_or_else(|| ConfigError::InvalidTrigger {
                    name: trigger.name.clone(),
                    reason: "address must be host:port".into(),
                })?;
            orchestrator_subs.push(Subscription {
                producer: trigger.name.clone(),
                address,
                kinds: KindSet::of(&[MessageKind::Trigger]),
            });
        }
        let orchestrator_peers = config
            .savers
            .iter()
            .filter_map(|s| {
                address_of(&wiring, &s.name).map(|address| PeerLink {
                    peer: s.name.clone(),
                    address,
                })
            })
            .collect();
        if let Some(w) = wiring.get_mut(ORCHESTRATOR) {
            w.subscriptions = orchestrator_subs;
            w.peers = orchestrator_peers;
        }

        // two savers must not write the same files
        let mut outputs: HashMap<(String, Option<String>), String> = HashMap::new();
        for saver in &config.savers {
            let key = (saver.backend.clone(), saver.file_suffix.clone());
            if let Some(first) = outputs.insert(key, saver.name.clone()) {
                return Err(ConfigError::DuplicateOutput {
                    first,
                    second: saver.name.clone(),
                    output: format!(
                        "{} output{}",
                        saver.backend,
                        saver
                            .file_suffix
                            .as_deref()
                            .map(|s| format!(" with suffix '{s}'"))
                            .unwrap_or_default()
                    ),
                });
            }
        }

        Ok(Self {
            order,
            wiring,
            saver_workers,
        })
    }

    /// Participant names in startup order, orchestrator first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Wiring of `name`.
    pub fn wiring(&self, name: &str) -> Option<&Wiring> {
        self.wiring.get(name)
    }

    /// Wiring of the orchestrator.
    pub fn orchestrator(&self) -> Option<&Wiring> {
        self.wiring.get(ORCHESTRATOR)
    }

    /// Workers recorded by `saver`.
    pub fn saver_workers(&self, saver: &str) -> &[String] {
        self.saver_workers
            .get(saver)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Everything except the orchestrator, in startup order.
    pub fn participants(&self) -> impl Iterator<Item = &Wiring> {
        self.order
            .iter()
            .skip(1)
            .filter_map(|name| self.wiring.get(name))
    }
}

fn check_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }
    if name == ORCHESTRATOR {
        return Err(ConfigError::ReservedName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> FleetConfig {
        FleetConfig::from_toml_str(toml).unwrap()
    }

    const FLEET: &str = r#"
        [transport]
        base_port = 7000

        [[modules]]
        name = "camera"
        worker = "mock_camera"

        [[modules]]
        name = "tracker"
        worker = "relay"
        subscriptions = ["camera"]
        saver = "table"

        [[savers]]
        name = "table"
        backend = "tabular"
        workers = ["camera"]
    "#;

    #[test]
    fn test_ports_allocated_in_order() {
        let topo = Topology::build(&config(FLEET)).unwrap();
        assert_eq!(topo.order(), ["orchestrator", "camera", "tracker", "table"]);
        assert_eq!(topo.orchestrator().unwrap().address.port(), 7000);
        assert_eq!(topo.wiring("camera").unwrap().address.port(), 7001);
        assert_eq!(topo.wiring("table").unwrap().address.port(), 7003);
        assert_eq!(
            topo.wiring("table").unwrap().address.connect_addr(),
            "127.0.0.1:7003"
        );
    }

    #[test]
    fn test_edges() {
        let topo = Topology::build(&config(FLEET)).unwrap();

        let tracker = topo.wiring("tracker").unwrap();
        assert_eq!(tracker.role, Role::Worker);
        let producers: Vec<_> = tracker.subscriptions.iter().map(|s| s.producer.as_str()).collect();
        assert_eq!(producers, ["orchestrator", "camera"]);
        assert!(tracker.subscriptions[0].kinds.contains(MessageKind::Exit));
        assert!(!tracker.subscriptions[0].kinds.contains(MessageKind::Frame));
        assert!(tracker.subscriptions[1].kinds.contains(MessageKind::Frame));

        let table = topo.wiring("table").unwrap();
        let producers: Vec<_> = table.subscriptions.iter().map(|s| s.producer.as_str()).collect();
        assert_eq!(producers, ["orchestrator", "camera", "tracker"]);
        assert!(!table.subscriptions[0].kinds.contains(MessageKind::Request));
        assert_eq!(topo.saver_workers("table"), ["camera", "tracker"]);

        let orch = topo.orchestrator().unwrap();
        assert_eq!(orch.subscriptions.len(), 2);
        assert!(orch.subscriptions[0].kinds.contains(MessageKind::Error));
        assert_eq!(orch.peers.len(), 1);
        assert_eq!(orch.peers[0].peer, "table");
    }

    #[test]
    fn test_unknown_upstream() {
        let err = Topology::build(&config(
            r#"
            [[modules]]
            name = "tracker"
            worker = "relay"
            subscriptions = ["ghost"]
        "#,
        ))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownUpstream {
                subscriber: "tracker".into(),
                target: "ghost".into()
            }
        );
    }

    #[test]
    fn test_duplicate_names() {
        let err = Topology::build(&config(
            r#"
            [[modules]]
            name = "cam"
            worker = "mock_camera"

            [[savers]]
            name = "cam"
            backend = "frames"
        "#,
        ))
        .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateParticipant("cam".into()));
    }

    #[test]
    fn test_reserved_and_self_subscription() {
        let reserved = Topology::build(&config(
            r#"
            [[modules]]
            name = "orchestrator"
            worker = "relay"
        "#,
        ));
        assert!(matches!(reserved, Err(ConfigError::ReservedName(_))));

        let selfish = Topology::build(&config(
            r#"
            [[modules]]
            name = "loop"
            worker = "relay"
            subscriptions = ["loop"]
        "#,
        ));
        assert!(matches!(selfish, Err(ConfigError::SelfSubscription { .. })));
    }

    #[test]
    fn test_saver_cannot_subscribe_to_saver() {
        let err = Topology::build(&config(
            r#"
            [[savers]]
            name = "a"
            backend = "tabular"

            [[savers]]
            name = "b"
            backend = "frames"
            workers = ["a"]
        "#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::SaverSubscribesSaver { .. }));
    }

    #[test]
    fn test_unknown_saver() {
        let err = Topology::build(&config(
            r#"
            [[modules]]
            name = "cam"
            worker = "mock_camera"
            saver = "nowhere"
        "#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSaver { .. }));
    }

    #[test]
    fn test_manual_ports() {
        let missing = Topology::build(&config(
            r#"
            [gui_params]
            auto_config = false

            [[modules]]
            name = "cam"
            worker = "mock_camera"
        "#,
        ));
        assert_eq!(missing.unwrap_err(), ConfigError::MissingPort("cam".into()));

        let clash = Topology::build(&config(
            r#"
            [[modules]]
            name = "a"
            worker = "relay"
            port = 9000

            [[modules]]
            name = "b"
            worker = "relay"
            port = 9000
        "#,
        ));
        assert!(matches!(clash, Err(ConfigError::DuplicatePort { port: 9000, .. })));

        // explicit ports are skipped by the allocator
        let topo = Topology::build(&config(
            r#"
            [transport]
            base_port = 9100

            [[modules]]
            name = "a"
            worker = "relay"
            port = 9101

            [[modules]]
            name = "b"
            worker = "relay"
        "#,
        ))
        .unwrap();
        assert_eq!(topo.orchestrator().unwrap().address.port(), 9100);
        assert_eq!(topo.wiring("b").unwrap().address.port(), 9102);
    }

    #[test]
    fn test_duplicate_output_paths() {
        let err = Topology::build(&config(
            r#"
            [[savers]]
            name = "a"
            backend = "tabular"

            [[savers]]
            name = "b"
            backend = "tabular"
        "#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateOutput { .. }));
    }

    #[test]
    fn test_remote_trigger_edge() {
        let topo = Topology::build(&config(
            r#"
            [[triggers]]
            name = "scope"
            kind = "remote"
            address = "10.0.0.5:6000"
        "#,
        ))
        .unwrap();
        let orch = topo.orchestrator().unwrap();
        assert_eq!(orch.subscriptions[0].producer, "scope");
        assert_eq!(orch.subscriptions[0].address.connect_addr(), "10.0.0.5:6000");
        assert_eq!(
            orch.subscriptions[0].kinds,
            KindSet::of(&[MessageKind::Trigger])
        );
    }

    #[test]
    fn test_port_allocator_never_reuses() {
        let mut ports = PortAllocator::new(65534);
        assert!(ports.claim(65535));
        assert_eq!(ports.allocate().unwrap(), 65534);
        assert!(matches!(ports.allocate(), Err(ConfigError::PortsExhausted(_))));
        assert!(!ports.claim(65534));
    }
}
