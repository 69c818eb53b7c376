use std::time::Duration;
use thiserror::Error;

/// Error type for the retry consumer library.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Error originating from the underlying `lapin` library (ack, reject, publish, connect).
    #[error("RabbitMQ communication error: {0}")]
    Transport(#[from] lapin::Error),

    /// The message body is not a valid envelope. Never retried.
    #[error("Failed to parse message: {0}")]
    Parse(#[from] serde_json::Error),

    /// Error from the business handler.
    #[error("Message handler failed: {0}")]
    Handler(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// The business handler did not finish within its deadline.
    #[error("Message handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    /// The broker negatively acknowledged a delayed republish.
    #[error("Broker did not confirm publish to route '{route}'")]
    PublishNotConfirmed { route: String },

    /// An alert or audit collaborator failed.
    #[error("Dead-letter collaborator failed: {0}")]
    Collaborator(String),

    /// Invalid consumer or retry configuration.
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ConsumerError {
    /// Errors that leave a delivery unresolved or the channel unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ConsumerError::Transport(_) | ConsumerError::PublishNotConfirmed { .. }
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        ConsumerError::Configuration { message: message.into() }
    }
}

// Handlers fail with a plain message via `Err("reason".into())`.
impl From<&str> for ConsumerError {
    fn from(s: &str) -> Self {
        ConsumerError::Handler(s.into())
    }
}

impl From<String> for ConsumerError {
    fn from(s: String) -> Self {
        ConsumerError::Handler(s.into())
    }
}
