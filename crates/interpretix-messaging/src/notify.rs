use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use interpretix_types::models::Message;

const DEFAULT_SEEN_CAPACITY: usize = 500;
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    NewMessage(Message),
    NewMention(Message),
}

impl NotificationEvent {
    /// `None` for the current user's own messages.
    pub fn classify(message: &Message, current_user: Uuid) -> Option<Self> {
        if message.sender.id == current_user {
            return None;
        }
        if message.mentions_user(current_user) {
            Some(Self::NewMention(message.clone()))
        } else {
            Some(Self::NewMessage(message.clone()))
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            Self::NewMessage(m) | Self::NewMention(m) => m,
        }
    }

    pub fn is_mention(&self) -> bool {
        matches!(self, Self::NewMention(_))
    }

    pub fn title(&self) -> String {
        let name = &self.message().sender.display_name;
        match self {
            Self::NewMention(_) => format!("{} mentioned you", name),
            Self::NewMessage(_) => name.clone(),
        }
    }

    pub fn body(&self) -> String {
        let message = self.message();
        if message.content.trim().is_empty() && !message.attachments.is_empty() {
            return "Sent an attachment".to_string();
        }
        let mut preview: String = message.content.chars().take(PREVIEW_CHARS).collect();
        if message.content.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        preview
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Default,
    Denied,
}

/// Where notifications end up. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn play_sound(&self, event: &NotificationEvent);
    fn show_toast(&self, title: &str, body: &str);
    fn permission(&self) -> PermissionState;
    fn request_permission(&self) -> PermissionState;
    fn show_native(&self, title: &str, body: &str);
}

/// Logs every notification. Used headless.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn play_sound(&self, event: &NotificationEvent) {
        debug!("Sound cue for message {}", event.message().id);
    }

    fn show_toast(&self, title: &str, body: &str) {
        info!("[toast] {}: {}", title, body);
    }

    fn permission(&self) -> PermissionState {
        PermissionState::Granted
    }

    fn request_permission(&self) -> PermissionState {
        PermissionState::Granted
    }

    fn show_native(&self, title: &str, body: &str) {
        info!("[notification] {}: {}", title, body);
    }
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub sound: bool,
    pub toast: bool,
    pub native: bool,
    pub seen_capacity: usize,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            sound: true,
            toast: true,
            native: true,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

#[derive(Default)]
struct SeenSet {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenSet {
    /// False when the id was already recorded.
    fn record(&mut self, id: Uuid, capacity: usize) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    current_user: Uuid,
    settings: NotificationSettings,
    seen: Mutex<SeenSet>,
    permission_requested: AtomicBool,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, current_user: Uuid, settings: NotificationSettings) -> Self {
        Self {
            notifier,
            current_user,
            settings,
            seen: Mutex::new(SeenSet::default()),
            permission_requested: AtomicBool::new(false),
        }
    }

    pub fn current_user(&self) -> Uuid {
        self.current_user
    }

    /// Classifies a freshly inserted message and surfaces it once.
    pub fn notify_inserted(&self, message: &Message) -> Option<NotificationEvent> {
        let event = NotificationEvent::classify(message, self.current_user)?;
        if !self.seen.lock().record(message.id, self.settings.seen_capacity) {
            debug!("Already notified for message {}", message.id);
            return None;
        }
        self.dispatch(&event);
        Some(event)
    }

    fn dispatch(&self, event: &NotificationEvent) {
        let title = event.title();
        let body = event.body();

        if self.settings.sound {
            self.notifier.play_sound(event);
        }
        if self.settings.toast {
            self.notifier.show_toast(&title, &body);
        }
        if self.settings.native && self.native_allowed() {
            self.notifier.show_native(&title, &body);
        }
    }

    fn native_allowed(&self) -> bool {
        match self.notifier.permission() {
            PermissionState::Granted => true,
            PermissionState::Denied => false,
            PermissionState::Default => {
                if self.permission_requested.swap(true, Ordering::AcqRel) {
                    return false;
                }
                self.notifier.request_permission() == PermissionState::Granted
            }
        }
    }
}
