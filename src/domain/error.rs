//! Error taxonomy for sampling and delivery
//!
//! None of these are fatal to the process: sensor errors trigger a delayed
//! restart, delivery errors are logged and dropped, channel errors surface
//! as connection state transitions.

use thiserror::Error;

/// Location sensor could not produce a fix
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("location permission not granted")]
    PermissionDenied,

    #[error("location source unavailable: {0}")]
    Unavailable(String),

    #[error("no fix received within {0} ms")]
    Timeout(u64),

    #[error("location stream ended")]
    StreamEnded,

    #[error("location source I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SensorError {
    fn from(e: std::io::Error) -> Self {
        SensorError::Io(e.to_string())
    }
}

/// A single durable-channel request failed
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("backend returned HTTP {0}")]
    Status(u16),

    #[error("failed to parse response: {0}")]
    Malformed(String),

    #[error("backend rejected request: {}", .0.as_deref().unwrap_or("no message"))]
    Rejected(Option<String>),

    #[error("invalid backend configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Http(e.to_string())
    }
}

/// Live push channel failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection refused by server: {0}")]
    Rejected(String),

    #[error("handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("payload encoding failed: {0}")]
    Encode(String),
}
