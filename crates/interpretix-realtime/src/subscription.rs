use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use interpretix_types::events::{ChangeKind, RawChange, ReceivedChange, SubscriptionStatus};

use crate::error::RealtimeError;
use crate::transport::{RealtimeTransport, TransportMessage};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// A burst is flushed after at most this many debounce windows, even if
/// events keep arriving.
const MAX_WAIT_WINDOWS: u32 = 10;

/// Ordered run of changes delivered together after debouncing.
pub type ChangeBatch = Arc<[ReceivedChange]>;

pub type BatchSink = Arc<dyn Fn(ChangeBatch) + Send + Sync>;

/// What to listen for: one table, one operation kind, optional row filter
/// in PostgREST syntax (`channel_id=eq.<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableFilter {
    pub schema: String,
    pub table: String,
    pub event: ChangeKind,
    pub filter: Option<String>,
}

impl TableFilter {
    pub fn new(table: impl Into<String>, event: ChangeKind) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            event,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Registry key. Deterministic, and safe to use as a transport topic.
    pub fn channel_key(&self) -> String {
        let event = match self.event {
            ChangeKind::All => "all".to_string(),
            other => other.as_str().to_ascii_lowercase(),
        };
        let filter = match &self.filter {
            Some(f) => sanitize(f),
            None => "all".to_string(),
        };
        let table = if self.schema == "public" {
            self.table.clone()
        } else {
            format!("{}_{}", sanitize(&self.schema), self.table)
        };
        format!("{}-{}-{}", table, event, filter)
    }

    /// Client-side check mirroring what the server filters on. Only `eq`
    /// is evaluated; other operators, and snapshots that lack the column
    /// (delete events usually carry only the key), are accepted.
    pub fn matches(&self, change: &RawChange) -> bool {
        if change.schema != self.schema || change.table != self.table {
            return false;
        }
        if self.event != ChangeKind::All && self.event != change.event_type {
            return false;
        }
        let Some((column, value)) = self.filter.as_deref().and_then(parse_eq_filter) else {
            return true;
        };
        let snapshot = if change.event_type == ChangeKind::Delete {
            &change.old
        } else {
            &change.new
        };
        match snapshot.get(column) {
            Some(Value::String(s)) => s == value,
            Some(Value::Null) | None => true,
            Some(other) => other.to_string() == value,
        }
    }
}

fn sanitize(filter: &str) -> String {
    filter
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn parse_eq_filter(filter: &str) -> Option<(&str, &str)> {
    let (column, rest) = filter.split_once('=')?;
    let value = rest.strip_prefix("eq.")?;
    Some((column, value))
}

/// Liveness shared between a channel's pump task, the registry and the
/// health monitor. Survives reconnects of the same key.
pub struct ChannelActivity {
    last_event: Mutex<Instant>,
    status: watch::Sender<SubscriptionStatus>,
}

impl ChannelActivity {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SubscriptionStatus::Joining);
        Self {
            last_event: Mutex::new(Instant::now()),
            status,
        }
    }

    pub fn touch(&self) {
        *self.last_event.lock() = Instant::now();
    }

    pub fn last_event_at(&self) -> Instant {
        *self.last_event.lock()
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: SubscriptionStatus) {
        self.status.send_replace(status);
    }

    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.subscribe()
    }
}

impl Default for ChannelActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// A live transport channel plus the task pumping it. Closing (or dropping)
/// aborts the pump and leaves the topic.
pub struct TableSubscription {
    key: String,
    transport: Arc<dyn RealtimeTransport>,
    task: JoinHandle<()>,
    closed: bool,
}

impl TableSubscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.task.abort();
        self.transport.unsubscribe(&self.key);
        info!("Realtime channel {} unsubscribed", self.key);
    }
}

impl Drop for TableSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Join the transport topic for `filter` and start pumping its messages
/// through a debouncer into `sink`. Failed joins are reported, not retried.
pub fn open_table_subscription(
    transport: Arc<dyn RealtimeTransport>,
    filter: &TableFilter,
    debounce: Duration,
    activity: Arc<ChannelActivity>,
    sink: BatchSink,
) -> Result<TableSubscription, RealtimeError> {
    let key = filter.channel_key();
    activity.set_status(SubscriptionStatus::Joining);

    let channel = match transport.subscribe(&key, filter) {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Realtime channel {} failed to join: {}", key, e);
            activity.set_status(SubscriptionStatus::ChannelError);
            return Err(e);
        }
    };
    info!(
        "Realtime channel {} joining ({} {}.{})",
        key, filter.event, filter.schema, filter.table
    );

    let task = tokio::spawn(pump(key.clone(), channel.messages, debounce, activity, sink));

    Ok(TableSubscription {
        key,
        transport,
        task,
        closed: false,
    })
}

async fn pump(
    key: String,
    mut messages: mpsc::UnboundedReceiver<TransportMessage>,
    debounce: Duration,
    activity: Arc<ChannelActivity>,
    sink: BatchSink,
) {
    let max_wait = debounce * MAX_WAIT_WINDOWS;
    let mut pending: Vec<ReceivedChange> = Vec::new();
    let mut burst_started = Instant::now();
    let mut flush_at = Instant::now();

    loop {
        tokio::select! {
            msg = messages.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                activity.touch();
                match msg {
                    TransportMessage::Change(change) => {
                        let now = Instant::now();
                        if pending.is_empty() {
                            burst_started = now;
                        }
                        pending.push(ReceivedChange::now(change));
                        if debounce.is_zero() {
                            flush(&sink, &mut pending);
                        } else {
                            flush_at = (now + debounce).min(burst_started + max_wait);
                        }
                    }
                    TransportMessage::Status(status) => {
                        let previous = activity.status();
                        activity.set_status(status);
                        if status.is_failure() {
                            warn!("Realtime channel {} status {}", key, status);
                        } else if status != previous {
                            info!("Realtime channel {} status {}", key, status);
                        }
                    }
                    TransportMessage::Heartbeat => {}
                }
            }
            _ = sleep_until(flush_at), if !pending.is_empty() => {
                flush(&sink, &mut pending);
            }
        }
    }

    flush(&sink, &mut pending);
    activity.set_status(SubscriptionStatus::Closed);
    debug!("Realtime channel {} message stream ended", key);
}

fn flush(sink: &BatchSink, pending: &mut Vec<ReceivedChange>) {
    if pending.is_empty() {
        return;
    }
    let batch: ChangeBatch = std::mem::take(pending).into();
    sink(batch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn change(id: u32) -> RawChange {
        RawChange {
            event_type: ChangeKind::Insert,
            schema: "public".into(),
            table: "messages".into(),
            commit_timestamp: None,
            new: json!({ "seq": id, "channel_id": "c1" }),
            old: json!({}),
            errors: None,
        }
    }

    fn collecting_sink() -> (BatchSink, Arc<Mutex<Vec<Vec<u64>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let out = batches.clone();
        let sink: BatchSink = Arc::new(move |batch: ChangeBatch| {
            let seqs = batch
                .iter()
                .filter_map(|c| c.change.new.get("seq").and_then(Value::as_u64))
                .collect();
            out.lock().push(seqs);
        });
        (sink, batches)
    }

    #[test]
    fn test_channel_key() {
        let f = TableFilter::new("messages", ChangeKind::All)
            .with_filter("channel_id=eq.0d6c2f36-86b4");
        assert_eq!(f.channel_key(), "messages-all-channel_id_eq_0d6c2f36_86b4");

        let f = TableFilter::new("interpreters", ChangeKind::Update);
        assert_eq!(f.channel_key(), "interpreters-update-all");
    }

    #[test]
    fn test_channel_key_separates_schemas() {
        let public = TableFilter::new("messages", ChangeKind::All);
        let archive = TableFilter::new("messages", ChangeKind::All).with_schema("archive");
        assert_eq!(public.channel_key(), "messages-all-all");
        assert_eq!(archive.channel_key(), "archive_messages-all-all");
    }

    #[test]
    fn test_filter_matching() {
        let f = TableFilter::new("messages", ChangeKind::Insert).with_filter("channel_id=eq.c1");
        assert!(f.matches(&change(1)));

        let mut other_channel = change(1);
        other_channel.new = json!({ "channel_id": "c2" });
        assert!(!f.matches(&other_channel));

        let mut update = change(1);
        update.event_type = ChangeKind::Update;
        assert!(!f.matches(&update));

        let mut other_table = change(1);
        other_table.table = "profiles".into();
        assert!(!f.matches(&other_table));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_burst_in_order() {
        let transport = MemoryTransport::new();
        let filter = TableFilter::new("messages", ChangeKind::All);
        let activity = Arc::new(ChannelActivity::new());
        let (sink, batches) = collecting_sink();

        let _sub = open_table_subscription(
            Arc::new(transport.clone()),
            &filter,
            Duration::from_millis(100),
            activity.clone(),
            sink,
        )
        .unwrap();

        for i in 1..=3 {
            transport.publish(change(i));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(batches.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*batches.lock(), vec![vec![1, 2, 3]]);
        assert_eq!(activity.status(), SubscriptionStatus::Subscribed);

        transport.publish(change(4));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(batches.lock().len(), 2);
        assert_eq!(batches.lock()[1], vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_stream_still_flushes() {
        let transport = MemoryTransport::new();
        let filter = TableFilter::new("messages", ChangeKind::All);
        let (sink, batches) = collecting_sink();

        let _sub = open_table_subscription(
            Arc::new(transport.clone()),
            &filter,
            Duration::from_millis(50),
            Arc::new(ChannelActivity::new()),
            sink,
        )
        .unwrap();

        // One event every 40ms never leaves a quiet window; the max wait
        // of 10 windows forces a flush anyway.
        for i in 0..20 {
            transport.publish(change(i));
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert!(!batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_leaves_topic() {
        let transport = MemoryTransport::new();
        let filter = TableFilter::new("messages", ChangeKind::All);
        let (sink, _) = collecting_sink();

        let mut sub = open_table_subscription(
            Arc::new(transport.clone()),
            &filter,
            DEFAULT_DEBOUNCE,
            Arc::new(ChannelActivity::new()),
            sink,
        )
        .unwrap();
        assert!(transport.is_open(&filter.channel_key()));

        sub.close();
        sub.close();
        assert!(!transport.is_open(&filter.channel_key()));
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_join_is_reported() {
        let transport = MemoryTransport::new();
        transport.refuse_joins(true);
        let activity = Arc::new(ChannelActivity::new());
        let (sink, _) = collecting_sink();

        let result = open_table_subscription(
            Arc::new(transport),
            &TableFilter::new("messages", ChangeKind::All),
            DEFAULT_DEBOUNCE,
            activity.clone(),
            sink,
        );
        assert!(result.is_err());
        assert_eq!(activity.status(), SubscriptionStatus::ChannelError);
    }
}
