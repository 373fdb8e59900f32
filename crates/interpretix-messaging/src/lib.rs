pub mod backend;
pub mod error;
pub mod grouping;
pub mod notify;
pub mod queue;
pub mod reconcile;
pub mod view;

pub use backend::{BackendError, MessageBackend};
pub use error::MessagingError;
pub use reconcile::{EngineConfig, MessageEngine};
pub use view::{ChannelView, ViewConfig, ViewEvent};
