use super::link;
use super::{InboxSender, LinkSettings};
use crate::wire::frame::{Hello, LinkRole};
use crate::wire::KindSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Feed {
    producer: String,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Receives from any number of publishers, each edge with its own kind filter.
///
/// Edges connect in the background and reconnect if the producer goes away.
pub struct Subscriber {
    name: String,
    inbox: InboxSender,
    settings: LinkSettings,
    feeds: Vec<Feed>,
}

impl Subscriber {
    /// A subscriber with no edges, feeding `inbox`.
    pub fn new(name: impl Into<String>, inbox: InboxSender, settings: LinkSettings) -> Self {
        Self {
            name: name.into(),
            inbox,
            settings,
            feeds: Vec::new(),
        }
    }

    /// Subscribes to `producer` at `address`, admitting only `kinds`.
    pub fn add_subscription(&mut self, producer: impl Into<String>, address: String, kinds: KindSet) {
        let producer = producer.into();
        let connected = Arc::new(AtomicBool::new(false));
        let hello = Hello {
            role: LinkRole::Subscribe,
            name: self.name.clone(),
            kinds,
        };
        let task = tokio::spawn(run_feed(
            address,
            hello,
            producer.clone(),
            kinds,
            self.inbox.clone(),
            connected.clone(),
            self.settings.clone(),
        ));
        self.feeds.push(Feed {
            producer,
            connected,
            task,
        });
    }

    /// True once every edge has completed its hello/ack exchange.
    pub fn all_connected(&self) -> bool {
        self.feeds.iter().all(|f| f.connected.load(Ordering::Acquire))
    }

    /// Producers whose edge is not connected yet.
    pub fn pending(&self) -> Vec<&str> {
        self.feeds
            .iter()
            .filter(|f| !f.connected.load(Ordering::Acquire))
            .map(|f| f.producer.as_str())
            .collect()
    }

    /// Number of edges.
    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    /// Whether there are no edges.
    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        for feed in &self.feeds {
            feed.task.abort();
        }
    }
}

async fn run_feed(
    address: String,
    hello: Hello,
    producer: String,
    kinds: KindSet,
    inbox: InboxSender,
    connected: Arc<AtomicBool>,
    settings: LinkSettings,
) {
    let label = format!("{}<-{}", hello.name, producer);
    loop {
        let stream = match link::open_link(
            &address,
            &hello,
            settings.connect_retry,
            settings.max_frame_bytes,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                debug!(link = %label, error = %e, "subscription handshake failed, retrying");
                tokio::time::sleep(settings.connect_retry).await;
                continue;
            }
        };
        connected.store(true, Ordering::Release);
        info!(link = %label, %address, "subscribed");

        let result = link::pump_inbound(
            stream,
            inbox.clone(),
            kinds,
            label.clone(),
            settings.max_frame_bytes,
        )
        .await;
        connected.store(false, Ordering::Release);
        match result {
            Ok(()) => debug!(link = %label, "producer closed"),
            Err(e) => warn!(link = %label, error = %e, "subscription dropped"),
        }
        if inbox.is_closed() {
            return;
        }
        tokio::time::sleep(settings.connect_retry).await;
    }
}
