// error.rs - Agency Errors

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::IdentityError;
use crate::notifications::NotificationError;
use crate::storage::StorageError;

/// Errors raised while handling an inbound message
#[derive(Debug, Error)]
pub enum AgencyError {
    #[error("Failed to decrypt message: {0}")]
    DecryptionFailure(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Identity error: {0}")]
    Identity(IdentityError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("Router is no longer available")]
    RouterUnavailable,
}

impl From<IdentityError> for AgencyError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Decryption(reason) => Self::DecryptionFailure(reason),
            other => Self::Identity(other),
        }
    }
}

/// Error reply of the top-level handler; the trace id is also logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error_msg: String,
    pub error_trace_id: String,
}

impl ErrorEnvelope {
    pub fn new(error: &AgencyError) -> Self {
        Self {
            error_msg: error.to_string(),
            error_trace_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Result type for agency operations
pub type Result<T> = std::result::Result<T, AgencyError>;
