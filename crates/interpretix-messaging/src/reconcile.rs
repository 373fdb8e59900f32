//! Local copy of a channel's messages kept in step with the server.
//!
//! History comes in through paged fetches, live changes through
//! [`MessageEngine::apply`], and local sends/deletes are applied
//! optimistically before the backend confirms them. Every mutation
//! republishes a sorted snapshot on a `watch` channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use interpretix_types::api::NewMessage;
use interpretix_types::events::{ChangeEvent, PayloadError, ReceivedChange};
use interpretix_types::models::{Message, MessageRow, Profile, Sender};

use crate::backend::MessageBackend;
use crate::error::MessagingError;
use crate::queue::ProcessingFlag;

pub type Snapshot = Arc<Vec<Message>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size: usize,
    pub chunk_size: usize,
    /// Extra republishes after a paged load, measured from its end.
    pub trailing_refreshes: Vec<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            chunk_size: 20,
            trailing_refreshes: vec![Duration::from_millis(50), Duration::from_millis(250)],
        }
    }
}

/// Local write the backend has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingWrite {
    Send,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingState {
    pub loading: bool,
    pub has_more: bool,
    pub processing: bool,
    pub fetched_rows: usize,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub pending: HashMap<Uuid, PendingWrite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    Duplicate,
    UnknownUpdate,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Inserted(Message),
    Updated(Message),
    Deleted(Uuid),
    Ignored(Ignored),
}

struct Stored {
    message: Message,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Written,
    Removed,
}

/// id -> message, ordered on read by (created_at, insertion sequence).
#[derive(Default)]
pub struct MessageStore {
    entries: HashMap<Uuid, Stored>,
    next_seq: u64,
    /// Last write per id since `begin_journal`, while a refetch is out.
    journal: Option<HashMap<Uuid, Touch>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        self.entries.get(&id).map(|s| &s.message)
    }

    /// Returns false and leaves the store untouched if the id exists.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.entries.contains_key(&message.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.record(message.id, Touch::Written);
        self.entries.insert(message.id, Stored { message, seq });
        true
    }

    /// Replaces an existing entry. Unknown ids are not inserted.
    pub fn update(&mut self, message: Message) -> bool {
        let id = message.id;
        match self.entries.get_mut(&id) {
            Some(stored) => {
                stored.message = message;
                self.record(id, Touch::Written);
                true
            }
            None => false,
        }
    }

    /// Journaled even when the id is absent, so a refetch that raced the
    /// removal doesn't bring it back.
    pub fn remove(&mut self, id: Uuid) -> Option<Message> {
        self.record(id, Touch::Removed);
        self.entries.remove(&id).map(|s| s.message)
    }

    fn record(&mut self, id: Uuid, touch: Touch) {
        if let Some(journal) = self.journal.as_mut() {
            journal.insert(id, touch);
        }
    }

    fn begin_journal(&mut self) {
        self.journal = Some(HashMap::new());
    }

    fn end_journal(&mut self) -> HashMap<Uuid, Touch> {
        self.journal.take().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn sorted(&self) -> Vec<Message> {
        let mut stored: Vec<&Stored> = self.entries.values().collect();
        stored.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        stored.into_iter().map(|s| s.message.clone()).collect()
    }
}

struct Shared {
    store: Mutex<MessageStore>,
    snapshot: watch::Sender<Snapshot>,
}

impl Shared {
    fn publish(&self) {
        let sorted = self.store.lock().sorted();
        self.snapshot.send_replace(Arc::new(sorted));
    }
}

pub struct MessageEngine<B> {
    backend: Arc<B>,
    channel_id: Uuid,
    config: EngineConfig,
    shared: Arc<Shared>,
    profiles: Mutex<HashMap<Uuid, Sender>>,
    state: Mutex<ProcessingState>,
    processing: ProcessingFlag,
    load_done: Notify,
    refreshes: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: MessageBackend> MessageEngine<B> {
    pub fn new(backend: Arc<B>, channel_id: Uuid, config: EngineConfig) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            backend,
            channel_id,
            config,
            shared: Arc::new(Shared {
                store: Mutex::new(MessageStore::new()),
                snapshot,
            }),
            profiles: Mutex::new(HashMap::new()),
            state: Mutex::new(ProcessingState {
                has_more: true,
                ..Default::default()
            }),
            processing: ProcessingFlag::new(),
            load_done: Notify::new(),
            refreshes: Mutex::new(Vec::new()),
        }
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    pub fn messages(&self) -> Snapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn len(&self) -> usize {
        self.shared.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store.lock().is_empty()
    }

    pub fn state(&self) -> ProcessingState {
        let mut state = self.state.lock().clone();
        state.processing = self.processing.is_set();
        state
    }

    pub fn processing(&self) -> &ProcessingFlag {
        &self.processing
    }

    /// Drops whatever is loaded and fetches the newest page.
    pub async fn load_initial(&self) -> Result<usize, MessagingError> {
        if !self.begin_loading() {
            return Ok(0);
        }
        self.shared.store.lock().clear();
        {
            let mut state = self.state.lock();
            state.fetched_rows = 0;
            state.has_more = true;
        }
        self.shared.publish();
        let result = self.load_page(0).await;
        self.finish_loading();
        result
    }

    /// Fetches the next older page. No-op once history is exhausted.
    pub async fn load_more(&self) -> Result<usize, MessagingError> {
        let offset = {
            let state = self.state.lock();
            if !state.has_more {
                debug!("No more history for channel {}", self.channel_id);
                return Ok(0);
            }
            state.fetched_rows
        };
        if !self.begin_loading() {
            return Ok(0);
        }
        let result = self.load_page(offset).await;
        self.finish_loading();
        result
    }

    /// Re-fetches everything loaded so far and swaps it in as a whole.
    /// Writes made while the fetch was out (live changes, confirmed or
    /// pending local mutations) are merged over the fetched page.
    pub async fn refetch(&self) -> Result<usize, MessagingError> {
        if !self.begin_loading() {
            return Ok(0);
        }
        let result = self.refetch_inner().await;
        self.finish_loading();
        result
    }

    async fn refetch_inner(&self) -> Result<usize, MessagingError> {
        let limit = self.config.page_size.max(self.state.lock().fetched_rows);
        self.shared.store.lock().begin_journal();
        let rows = match self.backend.fetch_messages(self.channel_id, limit, 0).await {
            Ok(rows) => rows,
            Err(e) => {
                self.shared.store.lock().end_journal();
                return Err(e.into());
            }
        };
        let fetched = rows.len();

        let mut fresh = MessageStore::new();
        for chunk in rows.rchunks(self.config.chunk_size.max(1)) {
            for message in self.format_chunk(chunk).await.into_iter().rev() {
                fresh.insert(message);
            }
            tokio::task::yield_now().await;
        }

        {
            let mut store = self.shared.store.lock();
            let touched = store.end_journal();
            let pending = self.state.lock().pending.clone();
            for (id, touch) in touched {
                match touch {
                    Touch::Written => {
                        if let Some(local) = store.remove(id) {
                            fresh.remove(id);
                            fresh.insert(local);
                        }
                    }
                    Touch::Removed => {
                        fresh.remove(id);
                    }
                }
            }
            for (id, write) in pending {
                match write {
                    PendingWrite::Send => {
                        if !fresh.contains(id) {
                            if let Some(local) = store.remove(id) {
                                fresh.insert(local);
                            }
                        }
                    }
                    PendingWrite::Delete => {
                        fresh.remove(id);
                    }
                }
            }
            *store = fresh;
        }
        {
            let mut state = self.state.lock();
            state.fetched_rows = fetched;
            state.has_more = fetched == limit;
            state.last_fetch_at = Some(Utc::now());
        }
        self.shared.publish();
        info!("Refetched {} messages for channel {}", fetched, self.channel_id);
        Ok(fetched)
    }

    fn begin_loading(&self) -> bool {
        let mut state = self.state.lock();
        if state.loading {
            debug!("Fetch for channel {} already in progress", self.channel_id);
            return false;
        }
        state.loading = true;
        true
    }

    fn finish_loading(&self) {
        self.state.lock().loading = false;
        self.load_done.notify_waiters();
    }

    async fn load_page(&self, offset: usize) -> Result<usize, MessagingError> {
        let limit = self.config.page_size;
        let rows = self
            .backend
            .fetch_messages(self.channel_id, limit, offset)
            .await?;
        let fetched = rows.len();

        for chunk in rows.chunks(self.config.chunk_size.max(1)) {
            let formatted = self.format_chunk(chunk).await;
            {
                let mut store = self.shared.store.lock();
                for message in formatted {
                    store.insert(message);
                }
            }
            self.shared.publish();
            tokio::task::yield_now().await;
        }

        {
            let mut state = self.state.lock();
            state.fetched_rows = offset + fetched;
            state.has_more = fetched == limit;
            state.last_fetch_at = Some(Utc::now());
        }
        debug!(
            "Loaded {} messages for channel {} at offset {}",
            fetched, self.channel_id, offset
        );
        let delays = self.config.trailing_refreshes.clone();
        self.schedule_refreshes(&delays);
        Ok(fetched)
    }

    async fn format_chunk(&self, rows: &[MessageRow]) -> Vec<Message> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.sender_id).collect();
        self.prefetch_profiles(&ids).await;
        join_all(rows.iter().cloned().map(|row| self.format(row))).await
    }

    async fn format(&self, row: MessageRow) -> Message {
        let sender = self.resolve_sender(row.sender_id).await;
        Message::from_row(row, sender)
    }

    async fn resolve_sender(&self, id: Uuid) -> Sender {
        if let Some(sender) = self.profiles.lock().get(&id) {
            return sender.clone();
        }
        self.prefetch_profiles(&[id]).await;
        self.profiles
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Sender::unknown(id))
    }

    /// Fills the profile cache for any ids it lacks, in one request.
    async fn prefetch_profiles(&self, ids: &[Uuid]) {
        let missing: Vec<Uuid> = {
            let cache = self.profiles.lock();
            let mut seen = HashSet::new();
            ids.iter()
                .copied()
                .filter(|id| !cache.contains_key(id) && seen.insert(*id))
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        match self.backend.fetch_profiles(&missing).await {
            Ok(profiles) => self.cache_profiles(&missing, profiles),
            Err(e) => warn!("Profile lookup for {} senders failed: {}", missing.len(), e),
        }
    }

    fn cache_profiles(&self, requested: &[Uuid], profiles: Vec<Profile>) {
        let mut cache = self.profiles.lock();
        for profile in &profiles {
            cache.insert(profile.id, Sender::from_profile(profile));
        }
        // Ids with no profile row get the fallback so they aren't asked for again.
        for id in requested {
            cache.entry(*id).or_insert_with(|| Sender::unknown(*id));
        }
    }

    /// Applies one realtime change. Invalid payloads are rejected before
    /// touching the store.
    pub async fn apply(&self, change: &ReceivedChange) -> Result<Applied, PayloadError> {
        let event = ChangeEvent::<MessageRow>::from_raw(&change.change)?;
        Ok(self.apply_event(event).await)
    }

    pub async fn apply_event(&self, event: ChangeEvent<MessageRow>) -> Applied {
        let applied = match event {
            ChangeEvent::Insert(row) => self.apply_insert(row).await,
            ChangeEvent::Update(row) => self.apply_update(row).await,
            ChangeEvent::Delete { id } => match self.shared.store.lock().remove(id) {
                Some(_) => Applied::Deleted(id),
                None => Applied::Ignored(Ignored::Missing),
            },
        };
        if !matches!(applied, Applied::Ignored(_)) {
            self.shared.publish();
        }
        applied
    }

    async fn apply_insert(&self, row: MessageRow) -> Applied {
        if self.shared.store.lock().contains(row.id) {
            return Applied::Ignored(Ignored::Duplicate);
        }
        let message = self.format(row).await;
        if self.shared.store.lock().insert(message.clone()) {
            Applied::Inserted(message)
        } else {
            Applied::Ignored(Ignored::Duplicate)
        }
    }

    async fn apply_update(&self, row: MessageRow) -> Applied {
        if !self.shared.store.lock().contains(row.id) {
            debug!("Dropping update for unknown message {}", row.id);
            return Applied::Ignored(Ignored::UnknownUpdate);
        }
        let message = self.format(row).await;
        if self.shared.store.lock().update(message.clone()) {
            Applied::Updated(message)
        } else {
            Applied::Ignored(Ignored::UnknownUpdate)
        }
    }

    /// Shows the message immediately, then persists it. On failure the
    /// local copy is dropped, the channel resynced and the error returned.
    pub async fn send(&self, new: NewMessage) -> Result<Message, MessagingError> {
        new.validate()?;

        let sender = self.resolve_sender(new.sender_id).await;
        let optimistic = Message {
            id: new.id,
            channel_id: self.channel_id,
            content: new.content.clone(),
            sender: sender.clone(),
            created_at: Utc::now(),
            edited_at: None,
            parent_id: new.parent_id,
            reactions: Default::default(),
            attachments: new.attachments.clone(),
            mentions: new.mentions.clone(),
        };
        self.shared.store.lock().insert(optimistic);
        self.state.lock().pending.insert(new.id, PendingWrite::Send);
        self.shared.publish();

        // The store is written before the pending mark is cleared so a
        // concurrent refetch always sees one of the two.
        let result = self.backend.insert_message(&new).await;
        let outcome = match result {
            Ok(row) => {
                let confirmed = Message::from_row(row, sender);
                self.shared.store.lock().update(confirmed.clone());
                Ok(confirmed)
            }
            Err(e) => {
                self.shared.store.lock().remove(new.id);
                Err(e)
            }
        };
        self.state.lock().pending.remove(&new.id);
        self.shared.publish();

        match outcome {
            Ok(confirmed) => Ok(confirmed),
            Err(e) => {
                warn!("Send of message {} failed: {}", new.id, e);
                self.resync().await;
                Err(e.into())
            }
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), MessagingError> {
        let removed = self.shared.store.lock().remove(id);
        self.state.lock().pending.insert(id, PendingWrite::Delete);
        self.shared.publish();

        let result = self.backend.delete_message(id).await;
        {
            let mut store = self.shared.store.lock();
            match (&result, removed) {
                (Ok(()), _) => {
                    store.remove(id);
                }
                (Err(_), Some(local)) => {
                    store.insert(local);
                }
                (Err(_), None) => {}
            }
        }
        self.state.lock().pending.remove(&id);
        self.shared.publish();

        if let Err(e) = result {
            warn!("Delete of message {} failed: {}", id, e);
            self.resync().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Refetches once any load in flight has finished.
    async fn resync(&self) {
        loop {
            let idle = self.load_done.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.begin_loading() {
                let result = self.refetch_inner().await;
                self.finish_loading();
                if let Err(e) = result {
                    warn!("Resync of channel {} failed: {}", self.channel_id, e);
                }
                return;
            }
            debug!("Resync of channel {} waiting for the current load", self.channel_id);
            idle.await;
        }
    }

    /// Republishes the current store after each delay.
    pub fn schedule_refreshes(&self, delays: &[Duration]) {
        if delays.is_empty() {
            return;
        }
        let shared = self.shared.clone();
        let delays = delays.to_vec();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            for delay in delays {
                tokio::time::sleep_until(start + delay).await;
                shared.publish();
            }
        });

        let mut refreshes = self.refreshes.lock();
        refreshes.retain(|t| !t.is_finished());
        refreshes.push(task);
    }
}

impl<B> Drop for MessageEngine<B> {
    fn drop(&mut self) {
        for task in self.refreshes.lock().drain(..) {
            task.abort();
        }
    }
}
