//! Error types for registry communication.

use thiserror::Error;

/// A result type using `RegistryError`.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while talking to the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The initial handshake did not succeed within the attempt budget.
    #[error("registry {address} unreachable after {attempts} attempts")]
    Unreachable {
        /// Registry address that was dialled.
        address: String,
        /// Number of handshake attempts made.
        attempts: u32,
    },

    /// The heartbeat client is shut down.
    #[error("not connected to registry")]
    NotConnected,

    /// The registry answered the handshake with a refusal.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Transport-level failure (connect, send, closed socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// The registry sent something that does not follow the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Returns true if retrying the connection might succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}
