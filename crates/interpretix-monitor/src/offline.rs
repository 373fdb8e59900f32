//! In-process stand-ins for running without a Supabase project.

use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use interpretix_messaging::backend::{BackendError, MessageBackend};
use interpretix_realtime::transport::MemoryTransport;
use interpretix_types::api::NewMessage;
use interpretix_types::events::{ChangeKind, RawChange};
use interpretix_types::models::{InterpreterStatus, MessageRow, Profile};

const DEMO_LINES: &[&str] = &[
    "Can someone take the 2pm medical call?",
    "Spanish queue is backing up",
    "Back from break",
    "Client asked for the same interpreter as last week",
];

/// Keeps rows in memory and publishes every write to the transport, the
/// way the database's change feed would.
pub struct OfflineBackend {
    rows: Mutex<Vec<MessageRow>>,
    profiles: Vec<Profile>,
    transport: MemoryTransport,
}

impl OfflineBackend {
    pub fn new(transport: MemoryTransport, profiles: Vec<Profile>) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            profiles,
            transport,
        }
    }

    fn publish(&self, kind: ChangeKind, row: &MessageRow) {
        let snapshot = serde_json::to_value(row).unwrap_or(Value::Null);
        let (new, old) = match kind {
            ChangeKind::Delete => (Value::Null, snapshot),
            _ => (snapshot, Value::Null),
        };
        let reached = self.transport.publish(RawChange {
            event_type: kind,
            schema: "public".into(),
            table: "messages".into(),
            commit_timestamp: Some(Utc::now()),
            new,
            old,
            errors: None,
        });
        debug!("Offline {} for {} reached {} topics", kind, row.id, reached);
    }

    pub fn insert_row(&self, row: MessageRow) {
        self.rows.lock().push(row.clone());
        self.publish(ChangeKind::Insert, &row);
    }
}

impl MessageBackend for OfflineBackend {
    async fn fetch_messages(
        &self,
        channel_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageRow>, BackendError> {
        let mut rows: Vec<MessageRow> = self
            .rows
            .lock()
            .iter()
            .filter(|r| r.channel_id == channel_id)
            .cloned()
            .collect();
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
        let row = MessageRow {
            id: message.id,
            channel_id: message.channel_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            created_at: Utc::now(),
            updated_at: None,
            parent_id: message.parent_id,
            reactions: Default::default(),
            attachments: message.attachments.clone(),
            mentions: message.mentions.clone(),
        };
        self.insert_row(row.clone());
        Ok(row)
    }

    async fn delete_message(&self, id: Uuid) -> Result<(), BackendError> {
        let removed = {
            let mut rows = self.rows.lock();
            let index = rows.iter().position(|r| r.id == id);
            index.map(|i| rows.remove(i))
        };
        match removed {
            Some(row) => {
                self.publish(ChangeKind::Delete, &row);
                Ok(())
            }
            None => Err(BackendError::Rejected {
                status: 404,
                message: format!("message {} not found", id),
            }),
        }
    }

    async fn mark_mentions_read(&self, channel_id: Uuid, user_id: Uuid) -> Result<(), BackendError> {
        debug!("Offline: mentions of {} read in {}", user_id, channel_id);
        Ok(())
    }

    async fn update_status(&self, user_id: Uuid, status: InterpreterStatus) -> Result<(), BackendError> {
        debug!("Offline: {} is now {:?}", user_id, status);
        Ok(())
    }
}

/// Posts a line from a made-up colleague every `every`, mentioning
/// `mention` on every third one.
pub fn spawn_demo_feed(
    backend: std::sync::Arc<OfflineBackend>,
    channel_id: Uuid,
    colleague: Uuid,
    mention: Uuid,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        for n in 0usize.. {
            tick.tick().await;
            let mentions = if n % 3 == 2 { vec![mention] } else { Vec::new() };
            backend.insert_row(MessageRow {
                id: Uuid::new_v4(),
                channel_id,
                sender_id: colleague,
                content: DEMO_LINES[n % DEMO_LINES.len()].to_string(),
                created_at: Utc::now(),
                updated_at: None,
                parent_id: None,
                reactions: Default::default(),
                attachments: Vec::new(),
                mentions,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use interpretix_realtime::TableFilter;
    use interpretix_realtime::transport::{RealtimeTransport, TransportMessage};

    #[tokio::test]
    async fn test_writes_reach_the_feed() {
        let transport = MemoryTransport::new();
        let channel_id = Uuid::new_v4();
        let filter = TableFilter::new("messages", ChangeKind::All)
            .with_filter(format!("channel_id=eq.{}", channel_id));
        let mut feed = transport.subscribe(&filter.channel_key(), &filter).unwrap();
        let backend = Arc::new(OfflineBackend::new(transport.clone(), Vec::new()));

        let row = backend
            .insert_message(&NewMessage::new(channel_id, Uuid::new_v4(), "hello"))
            .await
            .unwrap();
        assert_eq!(backend.fetch_messages(channel_id, 10, 0).await.unwrap().len(), 1);
        backend.delete_message(row.id).await.unwrap();
        assert!(backend.delete_message(row.id).await.is_err());

        let mut kinds = Vec::new();
        while let Ok(message) = feed.messages.try_recv() {
            if let TransportMessage::Change(change) = message {
                kinds.push(change.event_type);
            }
        }
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Delete]);
    }
}
