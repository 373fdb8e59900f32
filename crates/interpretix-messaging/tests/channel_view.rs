use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use uuid::Uuid;

use interpretix_messaging::backend::{BackendError, MessageBackend};
use interpretix_messaging::grouping::default_window;
use interpretix_messaging::notify::{NotificationEvent, Notifier, PermissionState};
use interpretix_messaging::queue::RefetchOutcome;
use interpretix_messaging::view::EVENT_INSERTED;
use interpretix_messaging::{ChannelView, MessagingError, ViewConfig};
use interpretix_realtime::transport::MemoryTransport;
use interpretix_realtime::{RealtimeConfig, RealtimeManager};
use interpretix_types::api::{NewMessage, ValidationError};
use interpretix_types::events::{ChangeKind, RawChange};
use interpretix_types::models::{
    Channel, ChannelKind, InterpreterStatus, MessageRow, Profile,
};

#[derive(Default)]
struct MemoryBackend {
    rows: Mutex<Vec<MessageRow>>,
    profiles: Vec<Profile>,
    fetches: AtomicUsize,
    inserts: AtomicUsize,
    mentions_read: AtomicUsize,
    /// When set, the next fetch waits on `fetch_release` after reading.
    hold_fetch: AtomicBool,
    fetch_entered: Notify,
    fetch_release: Notify,
}

impl MessageBackend for MemoryBackend {
    async fn fetch_messages(
        &self,
        channel_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageRow>, BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .iter()
            .filter(|r| r.channel_id == channel_id)
            .cloned()
            .collect();
        if self.hold_fetch.swap(false, Ordering::SeqCst) {
            self.fetch_entered.notify_one();
            self.fetch_release.notified().await;
        }
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn fetch_profiles(&self, ids: &[Uuid]) -> Result<Vec<Profile>, BackendError> {
        Ok(self
            .profiles
            .iter()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow, BackendError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let row = row(message.channel_id, message.sender_id, &message.content, Utc::now());
        let row = MessageRow { id: message.id, ..row };
        self.rows.lock().push(row.clone());
        Ok(row)
    }

    async fn delete_message(&self, id: Uuid) -> Result<(), BackendError> {
        self.rows.lock().retain(|r| r.id != id);
        Ok(())
    }

    async fn mark_mentions_read(&self, _channel_id: Uuid, _user_id: Uuid) -> Result<(), BackendError> {
        self.mentions_read.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_status(&self, _user_id: Uuid, _status: InterpreterStatus) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    toasts: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn play_sound(&self, _event: &NotificationEvent) {}

    fn show_toast(&self, title: &str, _body: &str) {
        self.toasts.lock().push(title.to_string());
    }

    fn permission(&self) -> PermissionState {
        PermissionState::Denied
    }

    fn request_permission(&self) -> PermissionState {
        PermissionState::Denied
    }

    fn show_native(&self, _title: &str, _body: &str) {}
}

struct Harness {
    transport: MemoryTransport,
    manager: RealtimeManager,
    backend: Arc<MemoryBackend>,
    notifier: Arc<RecordingNotifier>,
    channel: Channel,
    me: Uuid,
}

impl Harness {
    fn new(rows: Vec<MessageRow>, channel: Channel) -> Self {
        let transport = MemoryTransport::new();
        let manager = RealtimeManager::new(Arc::new(transport.clone()), RealtimeConfig::default());
        Self {
            transport,
            manager,
            backend: Arc::new(MemoryBackend {
                rows: Mutex::new(rows),
                ..Default::default()
            }),
            notifier: Arc::new(RecordingNotifier::default()),
            channel,
            me: Uuid::new_v4(),
        }
    }

    async fn open(&self, config: ViewConfig) -> ChannelView<MemoryBackend> {
        ChannelView::open(
            &self.manager,
            self.backend.clone(),
            self.channel.clone(),
            self.me,
            self.notifier.clone(),
            config,
        )
        .await
        .unwrap()
    }

    fn publish(&self, kind: ChangeKind, row: &MessageRow) -> usize {
        let snapshot = serde_json::to_value(row).unwrap();
        let (new, old) = match kind {
            ChangeKind::Delete => (Value::Null, json!({ "id": row.id, "channel_id": row.channel_id })),
            _ => (snapshot, Value::Null),
        };
        self.transport.publish(RawChange {
            event_type: kind,
            schema: "public".into(),
            table: "messages".into(),
            commit_timestamp: Some(Utc::now()),
            new,
            old,
            errors: None,
        })
    }
}

fn group_channel() -> Channel {
    Channel {
        id: Uuid::new_v4(),
        name: "interpreters".into(),
        kind: ChannelKind::Group,
        members: Vec::new(),
    }
}

fn row(channel_id: Uuid, sender_id: Uuid, content: &str, created_at: DateTime<Utc>) -> MessageRow {
    MessageRow {
        id: Uuid::new_v4(),
        channel_id,
        sender_id,
        content: content.to_string(),
        created_at,
        updated_at: None,
        parent_id: None,
        reactions: Default::default(),
        attachments: Vec::new(),
        mentions: Vec::new(),
    }
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test(start_paused = true)]
async fn test_live_mention_is_applied_and_notified() {
    let h = Harness::new(Vec::new(), group_channel());
    let view = h.open(ViewConfig::default()).await;
    assert_eq!(h.backend.mentions_read.load(Ordering::SeqCst), 1);

    let inserted = Arc::new(AtomicUsize::new(0));
    let counter = inserted.clone();
    let _handle = view.on(EVENT_INSERTED, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let mut mention = row(h.channel.id, Uuid::new_v4(), "can you cover 3pm?", Utc::now());
    mention.mentions = vec![h.me];
    assert_eq!(h.publish(ChangeKind::Insert, &mention), 1);
    settle().await;

    assert_eq!(view.messages().len(), 1);
    assert_eq!(inserted.load(Ordering::SeqCst), 1);
    assert_eq!(h.notifier.toasts.lock().as_slice(), ["Unknown User mentioned you"]);
    assert_eq!(h.backend.mentions_read.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_own_messages_do_not_notify() {
    let h = Harness::new(Vec::new(), group_channel());
    let view = h.open(ViewConfig::default()).await;

    let mine = row(h.channel.id, h.me, "on my way", Utc::now());
    h.publish(ChangeKind::Insert, &mine);
    settle().await;

    assert_eq!(view.messages().len(), 1);
    assert!(h.notifier.toasts.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_replayed_batch_is_idempotent() {
    let h = Harness::new(Vec::new(), group_channel());
    let view = h.open(ViewConfig::default()).await;

    let original = row(h.channel.id, Uuid::new_v4(), "draft", Utc::now());
    let edited = MessageRow {
        content: "final".into(),
        updated_at: Some(Utc::now()),
        ..original.clone()
    };
    for _ in 0..2 {
        h.publish(ChangeKind::Insert, &original);
        h.publish(ChangeKind::Update, &edited);
    }
    settle().await;

    let messages = view.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "final");
    assert_eq!(h.notifier.toasts.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_for_unknown_message_is_dropped() {
    let h = Harness::new(Vec::new(), group_channel());
    let view = h.open(ViewConfig::default()).await;

    let ghost = row(h.channel.id, Uuid::new_v4(), "never inserted", Utc::now());
    h.publish(ChangeKind::Update, &ghost);
    settle().await;
    assert!(view.messages().is_empty());

    h.publish(ChangeKind::Delete, &ghost);
    settle().await;
    assert!(view.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_other_channels_are_filtered_out() {
    let h = Harness::new(Vec::new(), group_channel());
    let view = h.open(ViewConfig::default()).await;

    let elsewhere = row(Uuid::new_v4(), Uuid::new_v4(), "wrong room", Utc::now());
    assert_eq!(h.publish(ChangeKind::Insert, &elsewhere), 0);
    settle().await;
    assert!(view.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_force_refetch_respects_cooldown() {
    let channel = group_channel();
    let rows = vec![row(channel.id, Uuid::new_v4(), "hello", at(9, 0))];
    let h = Harness::new(rows, channel);
    let view = h.open(ViewConfig::default()).await;
    assert_eq!(h.backend.fetches.load(Ordering::SeqCst), 1);

    assert_eq!(view.force_refetch().await.unwrap(), RefetchOutcome::Completed(1));
    assert_eq!(view.force_refetch().await.unwrap(), RefetchOutcome::CoolingDown);
    assert_eq!(h.backend.fetches.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(view.force_refetch().await.unwrap(), RefetchOutcome::Completed(1));
    assert_eq!(h.backend.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_live_insert_survives_overlapping_refetch() {
    let channel = group_channel();
    let rows = vec![row(channel.id, Uuid::new_v4(), "hello", at(9, 0))];
    let h = Harness::new(rows, channel);
    let view = h.open(ViewConfig::default()).await;
    h.backend.hold_fetch.store(true, Ordering::SeqCst);

    let live = row(h.channel.id, Uuid::new_v4(), "on my way", at(9, 5));
    let (outcome, _) = tokio::join!(view.force_refetch(), async {
        h.backend.fetch_entered.notified().await;
        h.publish(ChangeKind::Insert, &live);
        settle().await;
        assert_eq!(view.messages().len(), 2);
        h.backend.fetch_release.notify_one();
    });

    assert_eq!(outcome.unwrap(), RefetchOutcome::Completed(1));
    let contents: Vec<_> = view.messages().iter().map(|m| m.content.clone()).collect();
    assert_eq!(contents, vec!["hello", "on my way"]);
}

#[tokio::test(start_paused = true)]
async fn test_groups_follow_time_window() {
    let channel = group_channel();
    let alice = Uuid::new_v4();
    let rows = vec![
        row(channel.id, alice, "a", at(10, 0)),
        row(channel.id, alice, "b", at(10, 2)),
        row(channel.id, alice, "c", at(10, 3)),
        row(channel.id, alice, "d", at(10, 10)),
    ];
    let h = Harness::new(rows, channel);
    let view = h.open(ViewConfig::default()).await;

    let groups = view.groups(default_window());
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].messages.len(), 3);
    assert!(groups[0].show_sender);
}

#[tokio::test(start_paused = true)]
async fn test_views_share_and_release_channel() {
    let h = Harness::new(Vec::new(), group_channel());
    let first = h.open(ViewConfig::default()).await;
    let second = h.open(ViewConfig::default()).await;

    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.manager.channel_stats()[0].refcount, 2);

    first.close().await;
    assert_eq!(h.manager.active_channel_count(), 1);
    second.close().await;
    assert_eq!(h.manager.active_channel_count(), 0);
    assert_eq!(h.transport.open_topics(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_realtime_skips_registry() {
    let h = Harness::new(Vec::new(), group_channel());
    let view = h
        .open(ViewConfig {
            realtime_enabled: false,
            ..Default::default()
        })
        .await;

    assert_eq!(h.manager.active_channel_count(), 0);
    assert_eq!(view.retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_send_never_reaches_backend() {
    let h = Harness::new(Vec::new(), group_channel());
    let view = h.open(ViewConfig::default()).await;

    let err = view
        .send("x".repeat(4001), None, Vec::new(), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Validation(ValidationError::ContentTooLong { len: 4001, .. })
    ));
    assert_eq!(h.backend.inserts.load(Ordering::SeqCst), 0);
    assert!(view.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sent_message_survives_realtime_echo() {
    let h = Harness::new(Vec::new(), group_channel());
    let view = h.open(ViewConfig::default()).await;

    let sent = view
        .send("running late", None, Vec::new(), Vec::new())
        .await
        .unwrap();
    let echo = h.backend.rows.lock()[0].clone();
    assert_eq!(echo.id, sent.id);
    h.publish(ChangeKind::Insert, &echo);
    settle().await;

    assert_eq!(view.messages().len(), 1);
    assert!(h.notifier.toasts.lock().is_empty());
}
