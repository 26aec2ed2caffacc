use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Operation attempted before an identity was established.
    Unauthenticated,
    /// Empty/unknown room or unusable payload.
    InvalidRoom,
    /// The external store rejected a write. Nothing is fanned out.
    PersistenceFailed,
    /// Per-recipient delivery fault. Never fatal to the room.
    TransportFailure,
    /// Store read failure or other infrastructure fault.
    Internal,
}

/// Error reported back to the calling connection as a single `error`
/// event. Never broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct RelayError {
    pub code: ErrorCode,
    pub message: String,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthenticated() -> Self {
        Self::new(
            ErrorCode::Unauthenticated,
            "connection is not authenticated",
        )
    }

    pub fn invalid_room(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRoom, message)
    }
}
