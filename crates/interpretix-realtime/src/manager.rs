use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use interpretix_types::events::SubscriptionStatus;

use crate::error::RealtimeError;
use crate::subscription::{
    BatchSink, ChangeBatch, ChannelActivity, DEFAULT_DEBOUNCE, TableFilter, TableSubscription,
    open_table_subscription,
};
use crate::transport::{PresenceState, RealtimeTransport};

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Debounce window for subscriptions that don't set their own.
    pub default_debounce: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            default_debounce: DEFAULT_DEBOUNCE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// When false no channel is opened and the subscription yields nothing.
    pub enabled: bool,
    pub debounce: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: None,
        }
    }
}

/// Read-only view of one registry entry.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub name: String,
    pub refcount: usize,
    pub callback_count: usize,
    pub status: SubscriptionStatus,
    pub idle: Duration,
}

type ConsumerMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<ChangeBatch>>>>;

struct ChannelEntry {
    filter: TableFilter,
    debounce: Duration,
    subscription: TableSubscription,
    refcount: usize,
    consumers: ConsumerMap,
    activity: Arc<ChannelActivity>,
    presence: Option<Value>,
}

/// Registry of live transport channels, shared by every consumer in the
/// process. One transport channel per key; consumers of the same key share
/// it and it is torn down when the last one leaves.
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn RealtimeTransport>,
    config: RealtimeConfig,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    next_consumer: AtomicU64,
}

impl RealtimeManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a consumer to the channel for `filter`, opening it if this is
    /// the first consumer.
    pub fn subscribe_to_table(
        &self,
        filter: TableFilter,
        options: SubscribeOptions,
    ) -> Result<ChangeSubscription, RealtimeError> {
        let key = filter.channel_key();
        if !options.enabled {
            debug!("Realtime channel {} disabled, not subscribing", key);
            return Ok(ChangeSubscription::disabled(key));
        }

        let consumer_id = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channels = self.inner.channels.lock();
        if let Some(entry) = channels.get_mut(&key) {
            entry.refcount += 1;
            entry.consumers.lock().insert(consumer_id, tx);
            debug!(
                "Realtime channel {} shared (refcount {})",
                key, entry.refcount
            );
        } else {
            let debounce = options.debounce.unwrap_or(self.inner.config.default_debounce);
            let consumers: ConsumerMap = Arc::new(Mutex::new(HashMap::new()));
            consumers.lock().insert(consumer_id, tx);
            let activity = Arc::new(ChannelActivity::new());
            let subscription = open_table_subscription(
                self.inner.transport.clone(),
                &filter,
                debounce,
                activity.clone(),
                fan_out(consumers.clone()),
            )?;
            channels.insert(
                key.clone(),
                ChannelEntry {
                    filter,
                    debounce,
                    subscription,
                    refcount: 1,
                    consumers,
                    activity,
                    presence: None,
                },
            );
            info!("Realtime channel {} created", key);
        }
        drop(channels);

        Ok(ChangeSubscription {
            key,
            consumer_id,
            rx: Some(rx),
            manager: Arc::downgrade(&self.inner),
            released: false,
        })
    }

    /// Tear down and recreate the transport channel for `key`, keeping its
    /// consumers, refcount and tracked presence. Returns false if the key
    /// is not registered.
    pub fn reconnect(&self, key: &str) -> Result<bool, RealtimeError> {
        let mut channels = self.inner.channels.lock();
        let Some(entry) = channels.get_mut(key) else {
            return Ok(false);
        };

        entry.subscription.close();
        entry.subscription = open_table_subscription(
            self.inner.transport.clone(),
            &entry.filter,
            entry.debounce,
            entry.activity.clone(),
            fan_out(entry.consumers.clone()),
        )?;

        if let Some(payload) = entry.presence.clone() {
            if let Err(e) = self.inner.transport.track(key, payload) {
                warn!("Realtime channel {} presence re-track failed: {}", key, e);
            }
        }
        info!(
            "Realtime channel {} reconnected (refcount {})",
            key, entry.refcount
        );
        Ok(true)
    }

    pub fn track_presence(&self, key: &str, payload: Value) -> Result<(), RealtimeError> {
        let mut channels = self.inner.channels.lock();
        let entry = channels
            .get_mut(key)
            .ok_or_else(|| RealtimeError::UnknownChannel(key.to_string()))?;
        entry.presence = Some(payload.clone());
        self.inner.transport.track(key, payload)
    }

    pub fn untrack_presence(&self, key: &str) {
        let mut channels = self.inner.channels.lock();
        if let Some(entry) = channels.get_mut(key) {
            if entry.presence.take().is_some() {
                self.inner.transport.untrack(key);
            }
        }
    }

    pub fn presence_state(&self, key: &str) -> PresenceState {
        self.inner.transport.presence_state(key)
    }

    pub fn active_channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        let now = Instant::now();
        let channels = self.inner.channels.lock();
        let mut stats: Vec<ChannelStats> = channels
            .iter()
            .map(|(name, entry)| ChannelStats {
                name: name.clone(),
                refcount: entry.refcount,
                callback_count: entry.consumers.lock().len(),
                status: entry.activity.status(),
                idle: now.saturating_duration_since(entry.activity.last_event_at()),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn last_event_at(&self, key: &str) -> Option<Instant> {
        self.inner
            .channels
            .lock()
            .get(key)
            .map(|e| e.activity.last_event_at())
    }

    pub fn status(&self, key: &str) -> Option<SubscriptionStatus> {
        self.inner
            .channels
            .lock()
            .get(key)
            .map(|e| e.activity.status())
    }

    /// Close every channel. Outstanding subscriptions see their streams end.
    pub fn shutdown(&self) {
        let drained: Vec<(String, ChannelEntry)> = self.inner.channels.lock().drain().collect();
        for (key, mut entry) in drained {
            entry.subscription.close();
            debug!(
                "Realtime channel {} closed at shutdown (refcount {})",
                key, entry.refcount
            );
        }
    }
}

impl ManagerInner {
    fn release(&self, key: &str, consumer_id: u64) {
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get_mut(key) else {
            debug!("Realtime channel {} already gone on release", key);
            return;
        };
        if entry.consumers.lock().remove(&consumer_id).is_none() {
            return;
        }

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            debug!(
                "Realtime channel {} released (refcount {})",
                key, entry.refcount
            );
            return;
        }

        if let Some(mut entry) = channels.remove(key) {
            if entry.presence.take().is_some() {
                self.transport.untrack(key);
            }
            entry.subscription.close();
        }
        info!("Realtime channel {} removed", key);
    }
}

fn fan_out(consumers: ConsumerMap) -> BatchSink {
    Arc::new(move |batch: ChangeBatch| {
        for tx in consumers.lock().values() {
            let _ = tx.send(batch.clone());
        }
    })
}

/// A consumer's handle on a registry channel. Unsubscribes on drop.
pub struct ChangeSubscription {
    key: String,
    consumer_id: u64,
    rx: Option<mpsc::UnboundedReceiver<ChangeBatch>>,
    manager: Weak<ManagerInner>,
    released: bool,
}

impl ChangeSubscription {
    fn disabled(key: String) -> Self {
        Self {
            key,
            consumer_id: 0,
            rx: None,
            manager: Weak::new(),
            released: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_enabled(&self) -> bool {
        self.rx.is_some()
    }

    /// Next debounced batch. `None` once the channel is gone or when the
    /// subscription is disabled.
    pub async fn recv(&mut self) -> Option<ChangeBatch> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(inner) = self.manager.upgrade() {
            inner.release(&self.key, self.consumer_id);
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
