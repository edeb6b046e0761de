//! Common error types for devfleet.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors shared by the devfleet crates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid device identifier was provided.
    #[error("invalid device id: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A healthcheck payload could not be interpreted.
    #[error("malformed status payload: {0}")]
    MalformedPayload(String),
}
