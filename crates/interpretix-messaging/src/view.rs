//! One open conversation: realtime feed, local store, notifications.
//!
//! Batches from the registry are queued and drained one change at a time
//! into the engine. Only one drain runs at once; a batch that arrives
//! mid-drain just extends the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use interpretix_realtime::emitter::{EventEmitter, Unsubscribe};
use interpretix_realtime::health::{HealthConfig, HealthMonitor};
use interpretix_realtime::{ChangeSubscription, RealtimeManager, SubscribeOptions, TableFilter};
use interpretix_types::api::NewMessage;
use interpretix_types::events::{ChangeKind, ReceivedChange};
use interpretix_types::models::{Attachment, Channel, Message};

use crate::backend::MessageBackend;
use crate::error::MessagingError;
use crate::grouping::{MessageGroup, group_messages};
use crate::notify::{NotificationDispatcher, NotificationEvent, NotificationSettings, Notifier};
use crate::queue::{DEFAULT_COOLDOWN, EventQueue, RefetchController, RefetchOutcome};
use crate::reconcile::{Applied, EngineConfig, MessageEngine, ProcessingState, Snapshot};

pub const MESSAGES_TABLE: &str = "messages";

pub const EVENT_INSERTED: &str = "message:inserted";
pub const EVENT_UPDATED: &str = "message:updated";
pub const EVENT_DELETED: &str = "message:deleted";
pub const EVENT_REFETCHED: &str = "messages:refetched";
pub const EVENT_NOTIFICATION: &str = "notification";

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Inserted(Message),
    Updated(Message),
    Deleted(Uuid),
    Refetched { count: usize },
    Notification(NotificationEvent),
}

impl ViewEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Inserted(_) => EVENT_INSERTED,
            Self::Updated(_) => EVENT_UPDATED,
            Self::Deleted(_) => EVENT_DELETED,
            Self::Refetched { .. } => EVENT_REFETCHED,
            Self::Notification(_) => EVENT_NOTIFICATION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub engine: EngineConfig,
    /// `None` uses the registry's default.
    pub debounce: Option<Duration>,
    pub cooldown: Duration,
    /// Delay of the extra republish after a forced refetch.
    pub verify_delay: Duration,
    pub health: HealthConfig,
    pub notifications: NotificationSettings,
    pub realtime_enabled: bool,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            debounce: None,
            cooldown: DEFAULT_COOLDOWN,
            verify_delay: Duration::from_millis(500),
            health: HealthConfig::default(),
            notifications: NotificationSettings::default(),
            realtime_enabled: true,
        }
    }
}

struct ViewInner<B> {
    channel: Channel,
    user_id: Uuid,
    backend: Arc<B>,
    engine: MessageEngine<B>,
    queue: Mutex<EventQueue>,
    refetch: RefetchController,
    notifications: NotificationDispatcher,
    events: EventEmitter<ViewEvent>,
    verify_delay: Duration,
}

impl<B: MessageBackend> ViewInner<B> {
    fn enqueue(&self, batch: &[ReceivedChange]) {
        let mut queue = self.queue.lock();
        for change in batch {
            queue.add_to_queue(change.clone());
        }
    }

    async fn drain(&self) {
        loop {
            let Some(_guard) = self.engine.processing().try_acquire() else {
                debug!("Drain already running for channel {}", self.channel.id);
                return;
            };
            let Some(entry) = self.queue.lock().get_next_from_queue() else {
                return;
            };
            self.process(entry).await;
        }
    }

    async fn process(&self, entry: ReceivedChange) {
        let applied = match self.engine.apply(&entry).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Dropping invalid change on channel {}: {}", self.channel.id, e);
                return;
            }
        };

        match applied {
            Applied::Inserted(message) => {
                self.events.emit(EVENT_INSERTED, &ViewEvent::Inserted(message.clone()));
                if let Some(event) = self.notifications.notify_inserted(&message) {
                    let mention = event.is_mention();
                    self.events.emit(EVENT_NOTIFICATION, &ViewEvent::Notification(event));
                    if mention {
                        self.mark_mentions_read().await;
                    }
                }
            }
            Applied::Updated(message) => {
                self.events.emit(EVENT_UPDATED, &ViewEvent::Updated(message));
            }
            Applied::Deleted(id) => {
                self.events.emit(EVENT_DELETED, &ViewEvent::Deleted(id));
            }
            Applied::Ignored(reason) => {
                debug!("Change on channel {} ignored: {:?}", self.channel.id, reason);
            }
        }
    }

    async fn mark_mentions_read(&self) {
        if let Err(e) = self
            .backend
            .mark_mentions_read(self.channel.id, self.user_id)
            .await
        {
            warn!("Failed to mark mentions read in {}: {}", self.channel.id, e);
        }
    }
}

async fn dispatch_loop<B: MessageBackend>(inner: Arc<ViewInner<B>>, mut subscription: ChangeSubscription) {
    while let Some(batch) = subscription.recv().await {
        inner.enqueue(&batch);
        inner.drain().await;
    }
    debug!("Change stream for channel {} ended", inner.channel.id);
}

pub struct ChannelView<B: MessageBackend> {
    inner: Arc<ViewInner<B>>,
    key: String,
    dispatcher: Option<JoinHandle<()>>,
    health: Option<HealthMonitor>,
}

impl<B: MessageBackend> ChannelView<B> {
    /// Subscribes first and loads second, so changes committed while the
    /// first page is in flight are not missed.
    pub async fn open(
        manager: &RealtimeManager,
        backend: Arc<B>,
        channel: Channel,
        user_id: Uuid,
        notifier: Arc<dyn Notifier>,
        config: ViewConfig,
    ) -> Result<Self, MessagingError> {
        let filter = TableFilter::new(MESSAGES_TABLE, ChangeKind::All)
            .with_filter(format!("channel_id=eq.{}", channel.id));
        let subscription = manager.subscribe_to_table(
            filter,
            SubscribeOptions {
                enabled: config.realtime_enabled,
                debounce: config.debounce,
            },
        )?;
        let key = subscription.key().to_string();
        let health = subscription
            .is_enabled()
            .then(|| HealthMonitor::spawn(manager.clone(), key.clone(), config.health.clone()));

        let inner = Arc::new(ViewInner {
            engine: MessageEngine::new(backend.clone(), channel.id, config.engine),
            notifications: NotificationDispatcher::new(notifier, user_id, config.notifications),
            refetch: RefetchController::new(config.cooldown),
            queue: Mutex::new(EventQueue::new()),
            events: EventEmitter::new(),
            verify_delay: config.verify_delay,
            channel,
            user_id,
            backend,
        });
        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), subscription));

        let view = Self {
            inner,
            key,
            dispatcher: Some(dispatcher),
            health,
        };

        let loaded = view.inner.engine.load_initial().await?;
        view.inner.mark_mentions_read().await;
        info!(
            "Opened channel {} ({} messages)",
            view.inner.channel.name, loaded
        );
        Ok(view)
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn messages(&self) -> Snapshot {
        self.inner.engine.messages()
    }

    pub fn watch(&self) -> tokio::sync::watch::Receiver<Snapshot> {
        self.inner.engine.watch()
    }

    pub fn state(&self) -> ProcessingState {
        self.inner.engine.state()
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn groups(&self, window: ChronoDuration) -> Vec<MessageGroup> {
        group_messages(&self.messages(), window, self.inner.channel.kind)
    }

    /// Stalls seen by the health monitor. Zero when realtime is off.
    pub fn retry_count(&self) -> u32 {
        self.health.as_ref().map_or(0, HealthMonitor::retry_count)
    }

    pub fn on<F>(&self, event: &str, handler: F) -> Unsubscribe<ViewEvent>
    where
        F: Fn(&ViewEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.events.on(event, handler)
    }

    pub fn events(&self) -> &EventEmitter<ViewEvent> {
        &self.inner.events
    }

    pub async fn load_more(&self) -> Result<usize, MessagingError> {
        self.inner.engine.load_more().await
    }

    /// User-triggered full refetch, gated by the cooldown. Queued changes
    /// are discarded afterwards since the fetch already reflects them.
    pub async fn force_refetch(&self) -> Result<RefetchOutcome<usize>, MessagingError> {
        let inner = &self.inner;
        match inner.refetch.run(|| inner.engine.refetch()).await {
            RefetchOutcome::Completed(Ok(count)) => {
                let dropped = inner.queue.lock().clear_queue();
                if dropped > 0 {
                    debug!("Discarded {} queued changes after refetch", dropped);
                }
                if !inner.engine.is_empty() {
                    inner.engine.schedule_refreshes(&[inner.verify_delay]);
                }
                inner
                    .events
                    .emit(EVENT_REFETCHED, &ViewEvent::Refetched { count });
                Ok(RefetchOutcome::Completed(count))
            }
            RefetchOutcome::Completed(Err(e)) => Err(e),
            RefetchOutcome::AlreadyRunning => Ok(RefetchOutcome::AlreadyRunning),
            RefetchOutcome::CoolingDown => Ok(RefetchOutcome::CoolingDown),
        }
    }

    pub async fn send(
        &self,
        content: impl Into<String>,
        parent_id: Option<Uuid>,
        mentions: Vec<Uuid>,
        attachments: Vec<Attachment>,
    ) -> Result<Message, MessagingError> {
        let mut new = NewMessage::new(self.inner.channel.id, self.inner.user_id, content)
            .with_mentions(mentions)
            .with_attachments(attachments);
        if let Some(parent) = parent_id {
            new = new.reply_to(parent);
        }
        self.inner.engine.send(new).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), MessagingError> {
        self.inner.engine.delete(id).await
    }

    /// Stops the dispatcher and health monitor and releases the channel.
    pub async fn close(mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        self.health.take();
        debug!("Closed channel view {}", self.key);
    }
}

impl<B: MessageBackend> Drop for ChannelView<B> {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(ViewEvent::Deleted(Uuid::nil()).name(), EVENT_DELETED);
        assert_eq!(ViewEvent::Refetched { count: 3 }.name(), EVENT_REFETCHED);
    }
}
