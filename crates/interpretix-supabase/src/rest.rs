use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use interpretix_messaging::backend::{BackendError, MessageBackend};
use interpretix_types::api::{MarkMentionsReadRequest, NewMessage, StatusUpdateRequest};
use interpretix_types::models::{InterpreterStatus, MessageRow, Profile};

use crate::config::SupabaseConfig;

const MESSAGES: &str = "messages";
const PROFILES: &str = "profiles";
const INTERPRETERS: &str = "interpreters";
const MARK_MENTIONS_READ: &str = "rpc/mark_mentions_read";

/// [`MessageBackend`] over PostgREST.
#[derive(Clone)]
pub struct SupabaseBackend {
    http: Client,
    config: SupabaseConfig,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .header("Authorization", format!("Bearer {}", self.config.bearer()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected { status, message });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

fn messages_query(channel_id: Uuid, limit: usize, offset: usize) -> Vec<(&'static str, String)> {
    vec![
        ("select", "*".to_string()),
        ("channel_id", format!("eq.{}", channel_id)),
        ("order", "created_at.desc".to_string()),
        ("limit", limit.to_string()),
        ("offset", offset.to_string()),
    ]
}

fn profiles_query(ids: &[Uuid]) -> Vec<(&'static str, String)> {
    let list = ids
        .iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(",");
    vec![
        ("select", "id,full_name,avatar_url".to_string()),
        ("id", format!("in.({})", list)),
    ]
}

impl MessageBackend for SupabaseBackend {
    async fn fetch_messages(
        &self,
        channel_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageRow>, BackendError> {
        debug!(
            "Fetching messages for {} (limit {}, offset {})",
            channel_id, limit, offset
        );
        let request = self
            .http
            .get(self.config.rest_url(MESSAGES))
            .query(&messages_query(channel_id, limit, offset));
        self.send_json(request).await
    }

    async fn fetch_profiles(&self, ids: &[Uuid]) -> Result<Vec<Profile>, BackendError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .http
            .get(self.config.rest_url(PROFILES))
            .query(&profiles_query(ids));
        self.send_json(request).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow, BackendError> {
        let request = self
            .http
            .post(self.config.rest_url(MESSAGES))
            .header("Prefer", "return=representation")
            .json(message);
        let rows: Vec<MessageRow> = self.send_json(request).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("insert returned no rows".into()))
    }

    async fn delete_message(&self, id: Uuid) -> Result<(), BackendError> {
        let request = self
            .http
            .delete(self.config.rest_url(MESSAGES))
            .query(&[("id", format!("eq.{}", id))]);
        self.send(request).await.map(|_| ())
    }

    async fn mark_mentions_read(&self, channel_id: Uuid, user_id: Uuid) -> Result<(), BackendError> {
        let request = self
            .http
            .post(self.config.rest_url(MARK_MENTIONS_READ))
            .json(&MarkMentionsReadRequest {
                p_channel_id: channel_id,
                p_user_id: user_id,
            });
        self.send(request).await.map(|_| ())
    }

    async fn update_status(&self, user_id: Uuid, status: InterpreterStatus) -> Result<(), BackendError> {
        let request = self
            .http
            .patch(self.config.rest_url(INTERPRETERS))
            .query(&[("id", format!("eq.{}", user_id))])
            .json(&StatusUpdateRequest { status });
        self.send(request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_query() {
        let channel = Uuid::nil();
        let query = messages_query(channel, 100, 200);
        assert!(query.contains(&("channel_id", format!("eq.{}", channel))));
        assert!(query.contains(&("order", "created_at.desc".to_string())));
        assert!(query.contains(&("offset", "200".to_string())));
    }

    #[test]
    fn test_profiles_query_uses_in_list() {
        let a = Uuid::nil();
        let b = Uuid::from_u128(1);
        let query = profiles_query(&[a, b]);
        assert_eq!(query[1], ("id", format!("in.({},{})", a, b)));
    }
}
