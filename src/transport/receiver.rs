use super::link::{self, frame_message};
use super::{InboxSender, LinkSettings};
use crate::error::{FleetError, FleetResult};
use crate::wire::frame::{Hello, LinkRole};
use crate::wire::{KindSet, Message};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Peer {
    outbound: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Connects to many [`Sender`](super::Sender)s; each can be addressed by name.
pub struct Receiver {
    name: String,
    inbox: InboxSender,
    settings: LinkSettings,
    peers: HashMap<String, Peer>,
}

impl Receiver {
    /// A receiver with no peers, feeding `inbox`.
    pub fn new(name: impl Into<String>, inbox: InboxSender, settings: LinkSettings) -> Self {
        Self {
            name: name.into(),
            inbox,
            settings,
            peers: HashMap::new(),
        }
    }

    /// Starts a link to the sender `peer` at `address`. Re-adding a peer replaces its link.
    pub fn add_peer(&mut self, peer: impl Into<String>, address: String) {
        let peer = peer.into();
        let (outbound, outbound_rx) = mpsc::channel(self.settings.publish_queue);
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_peer(
            address,
            self.name.clone(),
            peer.clone(),
            outbound_rx,
            self.inbox.clone(),
            connected.clone(),
            self.settings.clone(),
        ));
        if let Some(old) = self.peers.insert(
            peer,
            Peer {
                outbound,
                connected,
                task,
            },
        ) {
            old.task.abort();
        }
    }

    /// Queues a message for exactly one peer. Never blocks.
    pub fn send_to(&self, peer: &str, message: &Message) -> FleetResult<()> {
        let link = self
            .peers
            .get(peer)
            .ok_or_else(|| FleetError::UnknownPeer(peer.to_string()))?;
        match link.outbound.try_send(frame_message(message)?) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(receiver = %self.name, %peer, kind = %message.kind(), "outbound queue full, dropping message");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(FleetError::UnknownPeer(peer.to_string())),
        }
    }

    /// Whether the link to `peer` is up.
    pub fn is_connected(&self, peer: &str) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|p| p.connected.load(Ordering::Acquire))
    }

    /// Peer names.
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        for peer in self.peers.values() {
            peer.task.abort();
        }
    }
}

async fn run_peer(
    address: String,
    name: String,
    peer: String,
    mut outbound: mpsc::Receiver<Bytes>,
    inbox: InboxSender,
    connected: Arc<AtomicBool>,
    settings: LinkSettings,
) {
    let hello = Hello {
        role: LinkRole::Peer,
        name: name.clone(),
        kinds: KindSet::all(),
    };
    let label = format!("{name}<->{peer}");
    loop {
        match link::open_link(
            &address,
            &hello,
            settings.connect_retry,
            settings.max_frame_bytes,
        )
        .await
        {
            Ok(stream) => {
                connected.store(true, Ordering::Release);
                info!(link = %label, %address, "peer link up");
                link::run_duplex(
                    stream,
                    &mut outbound,
                    inbox.clone(),
                    label.clone(),
                    settings.max_frame_bytes,
                )
                .await;
                connected.store(false, Ordering::Release);
                debug!(link = %label, "peer link down");
            }
            Err(e) => debug!(link = %label, error = %e, "peer handshake failed, retrying"),
        }
        if inbox.is_closed() {
            return;
        }
        tokio::time::sleep(settings.connect_retry).await;
    }
}
