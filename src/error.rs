//! Error types surfaced by the pub/sub facade
//!
//! Connection-level failures never show up here: the connection manager logs
//! them and lets the background loop reconnect. What does show up is either a
//! configuration problem (fatal) or the direct result of a caller action.

use crate::config::ConfigError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for pub/sub client operations
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Client not initialized: call init() first")]
    NotInitialized,

    #[error("Client already initialized")]
    AlreadyInitialized,

    #[error("init() must be called from inside a tokio runtime")]
    NoHostRuntime,

    #[error("Background processing already running")]
    AlreadyRunning,

    #[error("Invalid topic filter: {0:?}")]
    InvalidTopicFilter(String),

    #[error("Publishing to {topic} failed: {source}")]
    PublishFailed {
        topic: String,
        #[source]
        source: MqttError,
    },

    #[error("Failed to start background thread: {0}")]
    Runtime(#[source] std::io::Error),
}

impl PubSubError {
    /// Configuration errors must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, PubSubError::Config(_))
    }
}

/// Result type for pub/sub operations
pub type PubSubResult<T> = Result<T, PubSubError>;
