use interpretix_realtime::RealtimeError;
use interpretix_types::api::ValidationError;

use crate::backend::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}
