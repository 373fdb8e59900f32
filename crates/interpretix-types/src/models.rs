use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used when a sender's profile cannot be resolved.
pub const UNKNOWN_SENDER: &str = "Unknown User";

/// Emoji -> ids of the users who reacted with it.
pub type Reactions = BTreeMap<String, BTreeSet<Uuid>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(alias = "full_name")]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Sender {
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            id: profile.id,
            display_name: profile.display_name.clone(),
            avatar_url: profile.avatar_url.clone(),
        }
    }

    pub fn unknown(id: Uuid) -> Self {
        Self {
            id,
            display_name: UNKNOWN_SENDER.to_string(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    #[serde(alias = "type")]
    pub mime_type: String,
    pub size: u64,
}

/// A message row exactly as the database hands it out, both from paged
/// reads and from the change feed. The sender is only an id here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reactions: Reactions,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachments: Vec<Attachment>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mentions: Vec<Uuid>,
}

/// A message with its sender resolved, ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub content: String,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
    pub reactions: Reactions,
    pub attachments: Vec<Attachment>,
    pub mentions: Vec<Uuid>,
}

impl Message {
    pub fn from_row(row: MessageRow, sender: Sender) -> Self {
        Self {
            id: row.id,
            channel_id: row.channel_id,
            content: row.content,
            sender,
            created_at: row.created_at,
            edited_at: row.updated_at,
            parent_id: row.parent_id,
            reactions: row.reactions,
            attachments: row.attachments,
            mentions: row.mentions,
        }
    }

    pub fn mentions_user(&self, user_id: Uuid) -> bool {
        self.mentions.contains(&user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Group,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMember {
    pub user_id: Uuid,
    pub role: MemberRole,
}

/// Conversation metadata. Managed elsewhere; only read here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub members: Vec<ChannelMember>,
}

impl Channel {
    pub fn is_direct(&self) -> bool {
        self.kind == ChannelKind::Direct
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterStatus {
    Available,
    Busy,
    Offline,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_with_null_json_columns() {
        let row: MessageRow = serde_json::from_value(json!({
            "id": "7b0c8a44-3f3e-4d9e-9d4b-6f1f6b0f4a01",
            "channel_id": "0d6c2f36-86b4-4b6c-9bd5-2b5f3a7c1e11",
            "sender_id": "5a1f0e9b-2c67-4b9a-8f0d-4c3e2b1a0f22",
            "content": "hello",
            "created_at": "2026-03-01T10:00:00Z",
            "reactions": null,
            "attachments": null
        }))
        .unwrap();

        assert!(row.reactions.is_empty());
        assert!(row.attachments.is_empty());
        assert!(row.mentions.is_empty());
        assert_eq!(row.parent_id, None);
    }

    #[test]
    fn test_row_reactions_and_attachments() {
        let row: MessageRow = serde_json::from_value(json!({
            "id": "7b0c8a44-3f3e-4d9e-9d4b-6f1f6b0f4a01",
            "channel_id": "0d6c2f36-86b4-4b6c-9bd5-2b5f3a7c1e11",
            "sender_id": "5a1f0e9b-2c67-4b9a-8f0d-4c3e2b1a0f22",
            "content": "see attached",
            "created_at": "2026-03-01T10:00:00Z",
            "reactions": { "👍": ["5a1f0e9b-2c67-4b9a-8f0d-4c3e2b1a0f22"] },
            "attachments": [
                { "url": "https://cdn/x.pdf", "filename": "x.pdf", "type": "application/pdf", "size": 1024 }
            ]
        }))
        .unwrap();

        assert_eq!(row.reactions["👍"].len(), 1);
        assert_eq!(row.attachments[0].mime_type, "application/pdf");
    }

    #[test]
    fn test_profile_accepts_full_name() {
        let profile: Profile = serde_json::from_value(json!({
            "id": "5a1f0e9b-2c67-4b9a-8f0d-4c3e2b1a0f22",
            "full_name": "Ana Ruiz"
        }))
        .unwrap();
        assert_eq!(profile.display_name, "Ana Ruiz");
        assert_eq!(profile.avatar_url, None);
    }
}
