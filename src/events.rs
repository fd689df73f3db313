//! Event Bus: publish/subscribe fan-out keyed by container id and task id.
//!
//! Every event goes to the global stream (used by the WebSocket transport
//! when no filter is given) and to each `Topic` it names. Publishing never
//! fails: events without listeners are dropped. A topic channel lives only
//! while it has subscribers; dropping the last [`EventReceiver`] for a topic
//! frees it.

use std::sync::Arc;

use dashmap::DashMap;
use dockyard_common::{Event, Topic};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::trace;

type TopicMap = DashMap<Topic, broadcast::Sender<Event>>;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    topics: Arc<TopicMap>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (all, _rx) = broadcast::channel(capacity);
        Self {
            all,
            topics: Arc::new(DashMap::new()),
            capacity,
        }
    }

    pub fn publish(&self, event: Event) {
        let topics = event.topics();
        for topic in topics {
            let delivered = match self.topics.get(&topic) {
                Some(tx) => tx.send(event.clone()).is_ok(),
                None => continue,
            };
            if !delivered {
                // Last subscriber went away; drop the channel.
                self.topics
                    .remove_if(&topic, |_, tx| tx.receiver_count() == 0);
            }
        }
        if self.all.send(event).is_err() {
            trace!("event published with no global subscribers");
        }
    }

    /// Every event, regardless of topic.
    pub fn subscribe_all(&self) -> EventReceiver {
        EventReceiver {
            rx: Some(self.all.subscribe()),
            topic: None,
        }
    }

    /// Events addressed to one container or task.
    pub fn subscribe(&self, topic: Topic) -> EventReceiver {
        let rx = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        EventReceiver {
            rx: Some(rx),
            topic: Some((topic, Arc::clone(&self.topics))),
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// A bus subscription. Dropping the last receiver of a topic removes the
/// topic channel from the bus.
pub struct EventReceiver {
    rx: Option<broadcast::Receiver<Event>>,
    topic: Option<(Topic, Arc<TopicMap>)>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(RecvError::Closed),
        }
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.try_recv(),
            None => Err(TryRecvError::Closed),
        }
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        // Release our receiver first so the count below excludes it.
        drop(self.rx.take());
        if let Some((topic, topics)) = self.topic.take() {
            topics.remove_if(&topic, |_, tx| tx.receiver_count() == 0);
        }
    }
}
