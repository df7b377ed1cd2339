use super::link::{self, frame_message};
use super::{InboxSender, LinkSettings};
use crate::error::{FleetError, FleetResult};
use crate::wire::frame::LinkRole;
use crate::wire::Message;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Point-to-point endpoint with exactly one peer.
///
/// Messages sent before the peer connects are queued (up to the publish queue size) and
/// delivered once it does. Messages from the peer land in the inbox.
pub struct Sender {
    name: String,
    local_addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Sender {
    /// Binds `address` and waits for its peer in the background.
    pub async fn bind(
        name: impl Into<String>,
        address: &str,
        inbox: InboxSender,
        settings: &LinkSettings,
    ) -> FleetResult<Self> {
        let name = name.into();
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| FleetError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(participant = %name, %local_addr, "sender listening");

        let (outbound, outbound_rx) = mpsc::channel(settings.publish_queue);
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(serve_peer(
            listener,
            name.clone(),
            outbound_rx,
            inbox,
            connected.clone(),
            settings.clone(),
        ));

        Ok(Self {
            name,
            local_addr,
            outbound,
            connected,
            task,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the peer is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queues a message for the peer. Never blocks; a full queue drops the message.
    pub fn send(&self, message: &Message) -> FleetResult<()> {
        let frame = frame_message(message)?;
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(sender = %self.name, kind = %message.kind(), "outbound queue full, dropping message");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(FleetError::UnknownPeer(format!(
                "{} has no link task",
                self.name
            ))),
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_peer(
    listener: TcpListener,
    name: String,
    mut outbound: mpsc::Receiver<Bytes>,
    inbox: InboxSender,
    connected: Arc<AtomicBool>,
    settings: LinkSettings,
) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(sender = %name, error = %e, "accept error");
                continue;
            }
        };
        let hello = match link::read_hello(&mut stream, settings.max_frame_bytes).await {
            Ok(hello) if hello.role == LinkRole::Peer => hello,
            Ok(_) => {
                warn!(sender = %name, %addr, "rejecting non-peer connection");
                continue;
            }
            Err(e) => {
                warn!(sender = %name, %addr, error = %e, "peer handshake failed");
                continue;
            }
        };
        if let Err(e) = link::send_ack(&mut stream).await {
            warn!(sender = %name, %addr, error = %e, "peer handshake failed");
            continue;
        }
        connected.store(true, Ordering::Release);
        info!(sender = %name, peer = %hello.name, "peer connected");

        let label = format!("{}<->{}", name, hello.name);
        link::run_duplex(
            stream,
            &mut outbound,
            inbox.clone(),
            label,
            settings.max_frame_bytes,
        )
        .await;
        connected.store(false, Ordering::Release);
        debug!(sender = %name, peer = %hello.name, "peer disconnected");
    }
}
