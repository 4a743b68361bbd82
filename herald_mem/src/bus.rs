use herald_core::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Default)]
struct HubData {
    next_endpoint: u64,
    topics: HashMap<String, Vec<Subscriber>>,
    disabled: bool,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<String>,
}

/// An in-memory cross-tab bus.
///
/// Every endpoint opened on a topic receives the messages posted by the other endpoints of
/// that topic, in posting order. Clones share the same topics.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroadcastHub(Arc<Mutex<HubData>>);

impl InMemoryBroadcastHub {
    /// Creates a hub with no topics.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryBroadcastHub");
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, HubData> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes [`open`](CrossTabBus::open) fail, as when the broadcast primitive is missing.
    pub fn set_disabled(&self, disabled: bool) {
        self.data().disabled = disabled;
    }

    /// Delivers `raw` to every endpoint of `topic`, as if posted by a tab that is not
    /// represented here. Returns the number of endpoints reached.
    pub fn inject(&self, topic: &str, raw: &str) -> usize {
        self.deliver(topic, None, raw)
    }

    /// Number of endpoints currently open on `topic`.
    pub fn endpoints(&self, topic: &str) -> usize {
        self.data().topics.get(topic).map_or(0, Vec::len)
    }

    fn deliver(&self, topic: &str, from: Option<u64>, raw: &str) -> usize {
        let mut data = self.data();
        let Some(subscribers) = data.topics.get_mut(topic) else {
            return 0;
        };
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers
            .iter()
            .filter(|s| Some(s.id) != from)
            .filter(|s| s.sender.send(raw.to_string()).is_ok())
            .count()
    }

    fn detach(&self, topic: &str, id: u64) {
        let mut data = self.data();
        if let Some(subscribers) = data.topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                data.topics.remove(topic);
            }
        }
    }
}

impl CrossTabBus for InMemoryBroadcastHub {
    fn open(&self, topic: &str) -> Result<BusEndpoint, BusError> {
        let mut data = self.data();
        if data.disabled {
            return Err(BusError::Unavailable("broadcast disabled".to_string()));
        }
        data.next_endpoint += 1;
        let id = data.next_endpoint;
        let (sender, receiver) = mpsc::unbounded_channel();
        data.topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sender });
        log::debug!("Opened endpoint {} on topic '{}'", id, topic);

        let channel = InMemoryBroadcastChannel {
            hub: self.clone(),
            topic: topic.to_string(),
            id,
            closed: AtomicBool::new(false),
        };
        Ok(BusEndpoint {
            channel: Box::new(channel),
            messages: Box::pin(UnboundedReceiverStream::new(receiver)),
        })
    }
}

/// The posting half of an endpoint opened on an [`InMemoryBroadcastHub`].
#[derive(Debug)]
pub struct InMemoryBroadcastChannel {
    hub: InMemoryBroadcastHub,
    topic: String,
    id: u64,
    closed: AtomicBool,
}

impl BroadcastChannel for InMemoryBroadcastChannel {
    fn post(&self, message: &str) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let reached = self.hub.deliver(&self.topic, Some(self.id), message);
        log::trace!(
            "Endpoint {} posted to '{}', reaching {} endpoints",
            self.id,
            self.topic,
            reached
        );
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("Closing endpoint {} on topic '{}'", self.id, self.topic);
            self.hub.detach(&self.topic, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn posts_reach_every_other_endpoint_in_order() {
        let hub = InMemoryBroadcastHub::new();
        let mut a = hub.open("t").unwrap();
        let mut b = hub.open("t").unwrap();
        let mut other_topic = hub.open("u").unwrap();

        a.channel.post("one").unwrap();
        a.channel.post("two").unwrap();
        b.channel.post("three").unwrap();

        assert_eq!(b.messages.next().await.as_deref(), Some("one"));
        assert_eq!(b.messages.next().await.as_deref(), Some("two"));
        assert_eq!(a.messages.next().await.as_deref(), Some("three"));

        other_topic.channel.close();
        assert_eq!(other_topic.messages.next().await, None);
    }

    #[tokio::test]
    async fn closed_endpoints_stop_posting_and_receiving() {
        let hub = InMemoryBroadcastHub::new();
        let a = hub.open("t").unwrap();
        let mut b = hub.open("t").unwrap();
        assert_eq!(hub.endpoints("t"), 2);

        b.channel.close();
        assert_eq!(hub.endpoints("t"), 1);
        assert!(matches!(b.channel.post("late"), Err(BusError::Closed)));
        a.channel.post("unheard").unwrap();
        assert_eq!(b.messages.next().await, None);

        assert_eq!(hub.inject("t", "injected"), 1);
    }

    #[test]
    fn disabled_hub_refuses_to_open() {
        let hub = InMemoryBroadcastHub::new();
        hub.set_disabled(true);
        assert!(matches!(hub.open("t"), Err(BusError::Unavailable(_))));
    }
}
