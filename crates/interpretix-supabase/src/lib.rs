pub mod config;
pub mod protocol;
pub mod realtime;
pub mod rest;

pub use config::SupabaseConfig;
pub use realtime::{SocketOptions, SupabaseRealtime};
pub use rest::SupabaseBackend;
