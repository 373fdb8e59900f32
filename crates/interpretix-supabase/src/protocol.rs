//! Phoenix channel frames as spoken by the Supabase realtime server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use interpretix_realtime::TableFilter;
use interpretix_realtime::transport::PresenceState;
use interpretix_types::events::{ChangeKind, RawChange};

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const TOPIC_PREFIX: &str = "realtime:";

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_ERROR: &str = "phx_error";
pub const HEARTBEAT: &str = "heartbeat";
pub const POSTGRES_CHANGES: &str = "postgres_changes";
pub const PRESENCE: &str = "presence";
pub const PRESENCE_STATE: &str = "presence_state";
pub const PRESENCE_DIFF: &str = "presence_diff";
pub const SYSTEM: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Registry key this frame belongs to, if it is a channel frame.
    pub fn channel_key(&self) -> Option<&str> {
        self.topic.strip_prefix(TOPIC_PREFIX)
    }
}

pub fn wire_topic(key: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, key)
}

pub fn join(key: &str, filter: &TableFilter, access_token: &str, reference: String) -> Frame {
    let mut change = json!({
        "event": filter.event.as_str(),
        "schema": filter.schema,
        "table": filter.table,
    });
    if let Some(f) = &filter.filter {
        change["filter"] = Value::String(f.clone());
    }
    Frame {
        topic: wire_topic(key),
        event: PHX_JOIN.to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        }),
        join_ref: Some(reference.clone()),
        reference: Some(reference),
    }
}

pub fn leave(key: &str, reference: String) -> Frame {
    Frame {
        topic: wire_topic(key),
        event: PHX_LEAVE.to_string(),
        payload: json!({}),
        reference: Some(reference),
        join_ref: None,
    }
}

pub fn heartbeat(reference: String) -> Frame {
    Frame {
        topic: PHOENIX_TOPIC.to_string(),
        event: HEARTBEAT.to_string(),
        payload: json!({}),
        reference: Some(reference),
        join_ref: None,
    }
}

pub fn track(key: &str, meta: &Value, reference: String) -> Frame {
    Frame {
        topic: wire_topic(key),
        event: PRESENCE.to_string(),
        payload: json!({ "type": "presence", "event": "track", "payload": meta }),
        reference: Some(reference),
        join_ref: None,
    }
}

pub fn untrack(key: &str, reference: String) -> Frame {
    Frame {
        topic: wire_topic(key),
        event: PRESENCE.to_string(),
        payload: json!({ "type": "presence", "event": "untrack" }),
        reference: Some(reference),
        join_ref: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    Ok,
    Error(String),
}

pub fn reply_status(payload: &Value) -> ReplyStatus {
    match payload.get("status").and_then(Value::as_str) {
        Some("ok") => ReplyStatus::Ok,
        _ => {
            let reason = payload
                .get("response")
                .and_then(|r| r.get("reason"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string());
            ReplyStatus::Error(reason)
        }
    }
}

#[derive(Deserialize)]
struct ChangeEnvelope {
    data: ChangeData,
}

#[derive(Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    schema: String,
    table: String,
    #[serde(default)]
    commit_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
    #[serde(default)]
    errors: Option<Value>,
}

/// `postgres_changes` payload into the transport's change shape.
pub fn decode_change(payload: &Value) -> Result<RawChange, serde_json::Error> {
    let envelope = ChangeEnvelope::deserialize(payload)?;
    let data = envelope.data;
    Ok(RawChange {
        event_type: data.kind,
        schema: data.schema,
        table: data.table,
        commit_timestamp: data.commit_timestamp,
        new: data.record,
        old: data.old_record,
        errors: data.errors,
    })
}

fn metas(entry: &Value) -> Vec<Value> {
    entry
        .get("metas")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Replace `state` with a full `presence_state` snapshot.
pub fn apply_presence_state(state: &mut PresenceState, payload: &Value) {
    state.clear();
    if let Some(entries) = payload.as_object() {
        for (key, entry) in entries {
            state.insert(key.clone(), metas(entry));
        }
    }
}

/// Apply a `presence_diff`: leaves first, then joins.
pub fn apply_presence_diff(state: &mut PresenceState, payload: &Value) {
    if let Some(leaves) = payload.get("leaves").and_then(Value::as_object) {
        for (key, entry) in leaves {
            let left: Vec<Value> = metas(entry)
                .into_iter()
                .filter_map(|m| m.get("phx_ref").cloned())
                .collect();
            if let Some(current) = state.get_mut(key) {
                current.retain(|m| m.get("phx_ref").is_none_or(|r| !left.contains(r)));
                if current.is_empty() {
                    state.remove(key);
                }
            }
        }
    }
    if let Some(joins) = payload.get("joins").and_then(Value::as_object) {
        for (key, entry) in joins {
            state.entry(key.clone()).or_default().extend(metas(entry));
        }
    }
}
