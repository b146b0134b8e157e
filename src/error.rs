// Error types for the sync engine and its transports

use thiserror::Error;

use crate::sync::ConnectionState;

/// Failures of the underlying broker transport. These are transient from the
/// engine's point of view and feed the reconnect machine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Socket could not be opened
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Broker answered the handshake with an ERROR frame
    #[error("Broker rejected session: {0}")]
    Rejected(String),

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Outbound frame could not be queued
    #[error("Send failed: {0}")]
    Send(String),

    /// Session is already closed
    #[error("Transport closed")]
    Closed,
}

/// Errors returned by engine commands and pending connects.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Command issued while the connection is not CONNECTED
    #[error("Not connected")]
    NotConnected,

    /// `connect()` called while a session is already active or being established
    #[error("Connection already active ({0:?})")]
    AlreadyActive(ConnectionState),

    /// Reconnect attempts ran out; the session is FAILED
    #[error("Gave up reconnecting after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    /// Pending connect was invalidated by `disconnect()`
    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Inbound payload could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
