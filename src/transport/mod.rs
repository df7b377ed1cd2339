//! Role capabilities.
//!
//! A participant is composed from independent capabilities:
//!
//! - [`Publisher`]: binds an address and fans messages out to subscribers, filtered by kind.
//!   Publishing never blocks; a subscriber whose queue is full misses the message. ERROR
//!   and CONNECTION frames nobody was subscribed to yet are backlogged for the first
//!   subscriber that admits them.
//! - [`Subscriber`]: connects to any number of publishers with a per-edge kind filter.
//! - [`Sender`]: binds an address and talks to exactly one peer.
//! - [`Receiver`]: connects to many senders and can address each one individually.
//!
//! Every inbound message, whatever capability received it, lands in the participant's single
//! [`Inbox`]. Capabilities share nothing except that inbox handle.

mod link;
mod publisher;
mod receiver;
mod sender;
mod subscriber;

pub use publisher::Publisher;
pub use receiver::Receiver;
pub use sender::Sender;
pub use subscriber::Subscriber;

use crate::config::TransportConfig;
use crate::wire::Message;
use std::time::Duration;
use tokio::sync::mpsc;

/// Socket tuning shared by every capability of a participant.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Largest frame accepted from a peer
    pub max_frame_bytes: usize,
    /// Frames queued per subscriber before publishing drops
    pub publish_queue: usize,
    /// Messages the inbox holds before socket tasks wait
    pub inbox_capacity: usize,
    /// Pause between connection attempts
    pub connect_retry: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for LinkSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            publish_queue: config.publish_queue.max(1),
            inbox_capacity: config.inbox_capacity.max(1),
            connect_retry: config.connect_retry,
        }
    }
}

/// Handle capabilities use to push inbound messages.
pub type InboxSender = mpsc::Sender<Message>;

/// The participant's multiplexed receive queue.
///
/// Ordering is FIFO per edge; messages from different edges interleave arbitrarily.
///
/// ```
/// use daq_fleet::transport::Inbox;
/// use daq_fleet::wire::{Message, Payload};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let mut inbox = Inbox::new(8);
/// inbox.sender().send(Message::new("cam", Payload::Trigger)).await.unwrap();
/// let batch = inbox.poll(Duration::from_millis(10)).await;
/// assert_eq!(batch.len(), 1);
/// # });
/// ```
pub struct Inbox {
    tx: InboxSender,
    rx: mpsc::Receiver<Message>,
}

impl Inbox {
    /// An empty inbox holding up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx }
    }

    /// A handle for capabilities feeding this inbox.
    pub fn sender(&self) -> InboxSender {
        self.tx.clone()
    }

    /// Waits up to `timeout` for a first message, then drains everything already queued.
    ///
    /// A zero timeout yields once to let socket tasks run and returns whatever is queued.
    pub async fn poll(&mut self, timeout: Duration) -> Vec<Message> {
        let mut batch = Vec::new();
        if timeout.is_zero() {
            tokio::task::yield_now().await;
        } else {
            match tokio::time::timeout(timeout, self.rx.recv()).await {
                Ok(Some(first)) => batch.push(first),
                // the inbox holds its own sender, so the channel never closes
                Ok(None) | Err(_) => return batch,
            }
        }
        while let Ok(next) = self.rx.try_recv() {
            batch.push(next);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Payload;

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let mut inbox = Inbox::new(8);
        let started = std::time::Instant::now();
        assert!(inbox.poll(Duration::from_millis(30)).await.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_poll_drains_everything_queued() {
        let mut inbox = Inbox::new(8);
        let tx = inbox.sender();
        for i in 0..3 {
            tx.send(Message::new(format!("w{i}"), Payload::Trigger))
                .await
                .unwrap();
        }
        let batch = inbox.poll(Duration::from_millis(100)).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].source(), "w0");
    }

    #[tokio::test]
    async fn test_zero_timeout_returns_queued() {
        let mut inbox = Inbox::new(8);
        assert!(inbox.poll(Duration::ZERO).await.is_empty());
        inbox
            .sender()
            .send(Message::new("w", Payload::Exit))
            .await
            .unwrap();
        assert_eq!(inbox.poll(Duration::ZERO).await.len(), 1);
    }
}
