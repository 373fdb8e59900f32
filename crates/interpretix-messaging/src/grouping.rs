use chrono::{DateTime, Duration, Utc};

use interpretix_types::models::{ChannelKind, Message, Sender};

pub fn default_window() -> Duration {
    Duration::minutes(5)
}

/// Consecutive messages from one sender rendered under a single header.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageGroup {
    pub sender: Sender,
    /// Direct channels never show the header; the other side is implied.
    pub show_sender: bool,
    pub messages: Vec<Message>,
}

impl MessageGroup {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|m| m.created_at)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(|m| m.created_at)
    }
}

/// Expects `messages` sorted oldest first, as the engine publishes them.
pub fn group_messages(messages: &[Message], window: Duration, kind: ChannelKind) -> Vec<MessageGroup> {
    let show_sender = kind == ChannelKind::Group;
    let mut groups: Vec<MessageGroup> = Vec::new();

    for message in messages {
        if let Some(group) = groups.last_mut() {
            let same_sender = group.sender.id == message.sender.id;
            let close = group
                .ended_at()
                .is_some_and(|last| message.created_at - last <= window);
            if same_sender && close {
                group.messages.push(message.clone());
                continue;
            }
        }
        groups.push(MessageGroup {
            sender: message.sender.clone(),
            show_sender,
            messages: vec![message.clone()],
        });
    }

    groups
}
