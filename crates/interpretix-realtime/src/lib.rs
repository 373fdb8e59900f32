pub mod emitter;
pub mod error;
pub mod health;
pub mod manager;
pub mod subscription;
pub mod transport;

pub use error::RealtimeError;
pub use manager::{ChangeSubscription, RealtimeConfig, RealtimeManager, SubscribeOptions};
pub use subscription::{ChangeBatch, TableFilter};
