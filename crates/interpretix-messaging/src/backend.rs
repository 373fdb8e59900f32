use std::future::Future;

use uuid::Uuid;

use interpretix_types::api::NewMessage;
use interpretix_types::models::{InterpreterStatus, MessageRow, Profile};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Request/response side of the backend: paged reads and mutations.
/// Every call is fire-and-await and reports success or an error.
pub trait MessageBackend: Send + Sync + 'static {
    /// Rows for a channel, newest first.
    fn fetch_messages(
        &self,
        channel_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<MessageRow>, BackendError>> + Send;

    fn fetch_profiles(
        &self,
        ids: &[Uuid],
    ) -> impl Future<Output = Result<Vec<Profile>, BackendError>> + Send;

    fn insert_message(
        &self,
        message: &NewMessage,
    ) -> impl Future<Output = Result<MessageRow, BackendError>> + Send;

    fn delete_message(&self, id: Uuid) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn mark_mentions_read(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn update_status(
        &self,
        user_id: Uuid,
        status: InterpreterStatus,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}
