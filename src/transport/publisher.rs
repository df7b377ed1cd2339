//! Fan-out capability.
//!
//! A publisher drops whatever nobody is subscribed to, with one exception: ERROR and
//! CONNECTION frames published before any subscriber admitting them has connected are kept
//! in a small backlog and replayed, oldest first, to the first such subscriber. A worker that
//! fails during setup therefore still reaches the orchestrator.

use super::link::{self, frame_message};
use super::LinkSettings;
use crate::error::{FleetError, FleetResult};
use crate::wire::frame::LinkRole;
use crate::wire::{CodecError, KindSet, Message, MessageKind};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Frames kept for subscribers that have not connected yet.
const BACKLOG_LIMIT: usize = 32;

fn is_retained(kind: MessageKind) -> bool {
    matches!(kind, MessageKind::Error | MessageKind::Connection)
}

struct Slot {
    id: u64,
    peer: String,
    kinds: KindSet,
    queue: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct Shared {
    slots: Vec<Slot>,
    backlog: VecDeque<(MessageKind, Bytes)>,
}

impl Shared {
    fn retain(&mut self, publisher: &str, kind: MessageKind, frame: Bytes) {
        if self.backlog.len() == BACKLOG_LIMIT {
            if let Some((dropped, _)) = self.backlog.pop_front() {
                warn!(%publisher, kind = %dropped, "backlog full, dropping oldest message");
            }
        }
        self.backlog.push_back((kind, frame));
    }

    /// Registers `slot`, first handing it every backlogged frame it admits.
    fn register(&mut self, slot: Slot) -> usize {
        let mut replayed = 0;
        let mut kept = VecDeque::with_capacity(self.backlog.len());
        for (kind, frame) in self.backlog.drain(..) {
            if slot.kinds.contains(kind) && slot.queue.try_send(frame.clone()).is_ok() {
                replayed += 1;
            } else {
                kept.push_back((kind, frame));
            }
        }
        self.backlog = kept;
        self.slots.push(slot);
        replayed
    }
}

/// Fire-and-forget fan-out to every connected subscriber whose filter admits the message.
pub struct Publisher {
    name: String,
    local_addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    accept_task: JoinHandle<()>,
}

impl Publisher {
    /// Binds `address` and starts accepting subscribers.
    pub async fn bind(
        name: impl Into<String>,
        address: &str,
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
        info!(participant = %name, %local_addr, "publisher listening");

        let shared = Arc::new(Mutex::new(Shared::default()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            name.clone(),
            shared.clone(),
            settings.clone(),
        ));

        Ok(Self {
            name,
            local_addr,
            shared,
            accept_task,
        })
    }

    /// The bound address, with the actual port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of subscribers currently registered.
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Frames waiting for a first subscriber.
    pub fn backlog_len(&self) -> usize {
        self.shared.lock().backlog.len()
    }

    /// Encodes once and queues the frame for each admitting subscriber. Never blocks.
    ///
    /// Returns how many subscribers the message was queued for. An ERROR or CONNECTION
    /// that reached nobody is backlogged instead.
    pub fn publish(&self, message: &Message) -> Result<usize, CodecError> {
        let kind = message.kind();
        let frame = frame_message(message)?;
        let mut delivered = 0;
        let mut shared = self.shared.lock();
        shared.slots.retain(|slot| {
            if !slot.kinds.contains(kind) {
                return true;
            }
            match slot.queue.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(publisher = %self.name, subscriber = %slot.peer, %kind, "queue full, dropping message");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        if delivered == 0 && is_retained(kind) {
            shared.retain(&self.name, kind, frame);
        }
        Ok(delivered)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.accept_task.abort();
        // closing the queues ends every writer task
        self.shared.lock().slots.clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    name: String,
    shared: Arc<Mutex<Shared>>,
    settings: LinkSettings,
) {
    let next_id = Arc::new(AtomicU64::new(0));
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let name = name.clone();
                let shared = shared.clone();
                let settings = settings.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_subscriber(stream, id, &name, shared, &settings).await {
                        warn!(publisher = %name, %addr, error = %e, "subscriber link ended");
                    }
                });
            }
            Err(e) => warn!(publisher = %name, error = %e, "accept error"),
        }
    }
}

async fn serve_subscriber(
    mut stream: TcpStream,
    id: u64,
    name: &str,
    shared: Arc<Mutex<Shared>>,
    settings: &LinkSettings,
) -> std::io::Result<()> {
    let hello = link::read_hello(&mut stream, settings.max_frame_bytes).await?;
    if hello.role != LinkRole::Subscribe {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "publisher only accepts subscribers",
        ));
    }
    let (tx, mut rx) = mpsc::channel(settings.publish_queue.max(BACKLOG_LIMIT));
    let replayed = shared.lock().register(Slot {
        id,
        peer: hello.name.clone(),
        kinds: hello.kinds,
        queue: tx,
    });
    // ack only once registered, so a subscriber that saw the ack never misses a later publish
    link::send_ack(&mut stream).await?;
    debug!(publisher = %name, subscriber = %hello.name, replayed, "subscriber registered");

    let result = async {
        while let Some(frame) = rx.recv().await {
            stream.write_all(&frame).await?;
        }
        Ok::<(), std::io::Error>(())
    }
    .await;

    shared.lock().slots.retain(|slot| slot.id != id);
    debug!(publisher = %name, subscriber = %hello.name, "subscriber removed");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(kinds: KindSet) -> (Slot, mpsc::Receiver<Bytes>) {
        let (queue, rx) = mpsc::channel(BACKLOG_LIMIT);
        let slot = Slot {
            id: 0,
            peer: "orchestrator".into(),
            kinds,
            queue,
        };
        (slot, rx)
    }

    #[test]
    fn test_backlog_is_bounded() {
        let mut shared = Shared::default();
        for i in 0..BACKLOG_LIMIT + 5 {
            shared.retain("cam", MessageKind::Error, Bytes::from(i.to_string()));
        }
        assert_eq!(shared.backlog.len(), BACKLOG_LIMIT);
        assert_eq!(shared.backlog[0].1, Bytes::from("5"));
    }

    #[test]
    fn test_backlog_replays_only_to_admitting_subscriber() {
        let mut shared = Shared::default();
        shared.retain("cam", MessageKind::Connection, Bytes::from_static(b"c"));
        shared.retain("cam", MessageKind::Error, Bytes::from_static(b"e"));

        let (data_only, mut data_rx) = slot(KindSet::data());
        assert_eq!(shared.register(data_only), 0);
        assert!(data_rx.try_recv().is_err());
        assert_eq!(shared.backlog.len(), 2);

        let (errors, mut error_rx) = slot(KindSet::of(&[MessageKind::Error]));
        assert_eq!(shared.register(errors), 1);
        assert_eq!(error_rx.try_recv().unwrap(), Bytes::from_static(b"e"));
        assert_eq!(shared.backlog.len(), 1);
        assert_eq!(shared.slots.len(), 2);
    }
}
