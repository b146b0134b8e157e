// Re-export needed modules for testing
pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod stomp;
pub mod sync;  // Connection, stores and the engine that ties them together
pub mod utils;

// Re-export main types for convenience
pub use api::{ChatApi, HistoryPage};
pub use config::SyncConfig;
pub use error::{SyncError, TransportError};
pub use models::*;
pub use stomp::StompTransport;
pub use sync::{ConnectionState, SyncEngine, SyncUpdate};
