#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("realtime transport is closed")]
    TransportClosed,

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("channel {0} is not registered")]
    UnknownChannel(String),
}
