use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Attachment, InterpreterStatus};

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_ATTACHMENTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyContent,

    #[error("message is {len} characters, limit is {max}")]
    ContentTooLong { len: usize, max: usize },

    #[error("{count} attachments, limit is {max}")]
    TooManyAttachments { count: usize, max: usize },
}

/// Outbound message insert. The id is generated client side so the
/// optimistic copy and the server echo share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub attachments: Vec<Attachment>,
    pub mentions: Vec<Uuid>,
}

impl NewMessage {
    pub fn new(channel_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            sender_id,
            content: content.into(),
            parent_id: None,
            attachments: Vec::new(),
            mentions: Vec::new(),
        }
    }

    pub fn reply_to(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<Uuid>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Attachment-only messages may have empty text.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() && self.attachments.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let len = self.content.chars().count();
        if len > MAX_CONTENT_CHARS {
            return Err(ValidationError::ContentTooLong {
                len,
                max: MAX_CONTENT_CHARS,
            });
        }
        if self.attachments.len() > MAX_ATTACHMENTS {
            return Err(ValidationError::TooManyAttachments {
                count: self.attachments.len(),
                max: MAX_ATTACHMENTS,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkMentionsReadRequest {
    pub p_channel_id: Uuid,
    pub p_user_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdateRequest {
    pub status: InterpreterStatus,
}
