use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use interpretix_types::events::{RawChange, SubscriptionStatus};

use crate::error::RealtimeError;
use crate::subscription::TableFilter;

/// Presence key -> metas tracked under that key.
pub type PresenceState = HashMap<String, Vec<Value>>;

/// Everything a transport channel can hand to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Change(RawChange),
    Status(SubscriptionStatus),
    /// Liveness signal with no payload (socket heartbeat replies).
    Heartbeat,
}

/// One joined topic on the transport.
pub struct TransportChannel {
    pub topic: String,
    pub messages: mpsc::UnboundedReceiver<TransportMessage>,
}

/// The realtime change feed. Calls are non-blocking: joins complete
/// asynchronously and report through `TransportMessage::Status`.
pub trait RealtimeTransport: Send + Sync + 'static {
    fn subscribe(&self, topic: &str, filter: &TableFilter) -> Result<TransportChannel, RealtimeError>;

    fn unsubscribe(&self, topic: &str);

    fn track(&self, topic: &str, payload: Value) -> Result<(), RealtimeError>;

    fn untrack(&self, topic: &str);

    fn presence_state(&self, topic: &str) -> PresenceState;
}

/// In-process transport. Joins succeed immediately; changes are injected
/// with [`MemoryTransport::publish`] and routed by each topic's filter.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    topics: HashMap<String, MemoryTopic>,
    presence: HashMap<String, PresenceState>,
    opened: usize,
    closed: usize,
    refuse_joins: bool,
}

struct MemoryTopic {
    filter: TableFilter,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

const SELF_PRESENCE_KEY: &str = "self";

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a change to every open topic whose filter accepts it.
    /// Returns the number of topics it reached.
    pub fn publish(&self, change: RawChange) -> usize {
        let inner = self.inner.lock();
        inner
            .topics
            .values()
            .filter(|t| t.filter.matches(&change))
            .filter(|t| t.tx.send(TransportMessage::Change(change.clone())).is_ok())
            .count()
    }

    /// Push a raw message to one topic, bypassing filters.
    pub fn push(&self, topic: &str, message: TransportMessage) -> bool {
        let inner = self.inner.lock();
        match inner.topics.get(topic) {
            Some(t) => t.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Make subsequent joins fail with a subscribe error.
    pub fn refuse_joins(&self, refuse: bool) {
        self.inner.lock().refuse_joins = refuse;
    }

    pub fn is_open(&self, topic: &str) -> bool {
        self.inner.lock().topics.contains_key(topic)
    }

    pub fn open_topics(&self) -> usize {
        self.inner.lock().topics.len()
    }

    /// Total joins performed over the transport's life.
    pub fn open_count(&self) -> usize {
        self.inner.lock().opened
    }

    /// Total leaves performed over the transport's life.
    pub fn close_count(&self) -> usize {
        self.inner.lock().closed
    }
}

impl RealtimeTransport for MemoryTransport {
    fn subscribe(&self, topic: &str, filter: &TableFilter) -> Result<TransportChannel, RealtimeError> {
        let mut inner = self.inner.lock();
        if inner.refuse_joins {
            return Err(RealtimeError::Subscribe {
                topic: topic.to_string(),
                reason: "joins refused".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportMessage::Status(SubscriptionStatus::Subscribed));
        if inner
            .topics
            .insert(
                topic.to_string(),
                MemoryTopic {
                    filter: filter.clone(),
                    tx,
                },
            )
            .is_some()
        {
            debug!("Memory transport rejoined {} over a live topic", topic);
        }
        inner.opened += 1;

        Ok(TransportChannel {
            topic: topic.to_string(),
            messages: rx,
        })
    }

    fn unsubscribe(&self, topic: &str) {
        let mut inner = self.inner.lock();
        if inner.topics.remove(topic).is_some() {
            inner.closed += 1;
        }
        inner.presence.remove(topic);
    }

    fn track(&self, topic: &str, payload: Value) -> Result<(), RealtimeError> {
        let mut inner = self.inner.lock();
        if !inner.topics.contains_key(topic) {
            return Err(RealtimeError::UnknownChannel(topic.to_string()));
        }
        inner
            .presence
            .entry(topic.to_string())
            .or_default()
            .insert(SELF_PRESENCE_KEY.to_string(), vec![payload]);
        Ok(())
    }

    fn untrack(&self, topic: &str) {
        if let Some(state) = self.inner.lock().presence.get_mut(topic) {
            state.remove(SELF_PRESENCE_KEY);
        }
    }

    fn presence_state(&self, topic: &str) -> PresenceState {
        self.inner
            .lock()
            .presence
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}
