//! Error types for Dripline.

use thiserror::Error;

/// Workspace-wide error.
#[derive(Debug, Error)]
pub enum DriplineError {
    /// Caller input is malformed. Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No authenticated account was supplied.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A record referenced by a step vanished between selection and execution.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The delivery transport rejected or failed to send a message.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// The lead cannot be addressed by the transport. Retrying elsewhere won't help.
    #[error("Recipient rejected: {0}")]
    Recipient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DriplineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    pub fn recipient(msg: impl Into<String>) -> Self {
        Self::Recipient(msg.into())
    }

    /// Whether the error came from caller input rather than infrastructure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::Unauthorized(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DriplineError>;
