use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::MessageRow;

/// Which row operations a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::All => "*",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by the transport for a single channel join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// Join sent, no reply yet.
    Joining,
    Subscribed,
    TimedOut,
    Closed,
    ChannelError,
}

impl SubscriptionStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Closed | Self::ChannelError)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Joining => "JOINING",
            Self::Subscribed => "SUBSCRIBED",
            Self::TimedOut => "TIMED_OUT",
            Self::Closed => "CLOSED",
            Self::ChannelError => "CHANNEL_ERROR",
        };
        f.write_str(s)
    }
}

/// A change notification as it comes off the feed, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub new: Value,
    #[serde(default)]
    pub old: Value,
    #[serde(default)]
    pub errors: Option<Value>,
}

/// Queue entry: a raw change stamped with the time it reached this client.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedChange {
    pub change: RawChange,
    pub received_at: DateTime<Utc>,
}

impl ReceivedChange {
    pub fn now(change: RawChange) -> Self {
        Self {
            change,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("{kind} change has no row snapshot")]
    EmptySnapshot { kind: ChangeKind },

    #[error("{kind} change is missing the row id")]
    MissingId { kind: ChangeKind },

    #[error("malformed {kind} row: {source}")]
    Malformed {
        kind: ChangeKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("feed reported errors: {0}")]
    Reported(String),

    #[error("wildcard is not a concrete change kind")]
    Wildcard,
}

/// Rows that can travel through the change feed.
pub trait Row: DeserializeOwned {
    fn row_id(&self) -> Uuid;
}

impl Row for MessageRow {
    fn row_id(&self) -> Uuid {
        self.id
    }
}

/// Validated change. Deletes only carry the primary key because the feed
/// does not ship full old rows unless replica identity is FULL.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    Insert(T),
    Update(T),
    Delete { id: Uuid },
}

impl<T: Row> ChangeEvent<T> {
    pub fn from_raw(raw: &RawChange) -> Result<Self, PayloadError> {
        if let Some(errors) = &raw.errors {
            let empty = errors.is_null() || errors.as_array().is_some_and(|a| a.is_empty());
            if !empty {
                return Err(PayloadError::Reported(errors.to_string()));
            }
        }

        let kind = raw.event_type;
        match kind {
            ChangeKind::Insert => decode_row(kind, &raw.new).map(Self::Insert),
            ChangeKind::Update => decode_row(kind, &raw.new).map(Self::Update),
            ChangeKind::Delete => {
                let id = raw
                    .old
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Uuid>().ok())
                    .ok_or(PayloadError::MissingId { kind })?;
                Ok(Self::Delete { id })
            }
            ChangeKind::All => Err(PayloadError::Wildcard),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Insert(row) | Self::Update(row) => row.row_id(),
            Self::Delete { id } => *id,
        }
    }
}

fn decode_row<T: Row>(kind: ChangeKind, value: &Value) -> Result<T, PayloadError> {
    match value {
        Value::Null => Err(PayloadError::EmptySnapshot { kind }),
        Value::Object(map) if map.is_empty() => Err(PayloadError::EmptySnapshot { kind }),
        _ => T::deserialize(value).map_err(|source| PayloadError::Malformed { kind, source }),
    }
}
