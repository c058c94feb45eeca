//! Error type shared by every CUEMS communication component.

use std::convert::Infallible;

/// Result alias used across `cuems_core`
pub type CuemsResult<T> = Result<T, CuemsError>;

/// Errors raised by the hub, the transport and the request/response channel
#[derive(Debug, thiserror::Error)]
pub enum CuemsError {
    /// Bad address, socket path, mode or heartbeat settings. Raised before any network work.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A payload handed to the hub is not a JSON object
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Hub lifecycle or protocol misuse (already running, socket not open, ...)
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A request/response exchange finished without a usable reply
    #[error("No response: {0}")]
    NoResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CuemsError {
    pub fn config(msg: impl Into<String>) -> Self {
        CuemsError::Config(msg.into())
    }

    pub fn communication(msg: impl Into<String>) -> Self {
        CuemsError::Communication(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        CuemsError::InvalidPayload(msg.into())
    }

    /// True for errors that mean the caller used the API wrongly
    pub fn is_usage_error(&self) -> bool {
        matches!(self, CuemsError::Config(_) | CuemsError::InvalidPayload(_))
    }
}

impl From<Infallible> for CuemsError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}
