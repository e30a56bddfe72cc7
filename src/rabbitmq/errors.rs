// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum MqError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid batch input: {0}")]
    InvalidBatch(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Operation timed out: {0}")]
    TimeoutError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for broker operations
pub type Result<T> = std::result::Result<T, MqError>;

impl MqError {
    pub fn config(message: impl Into<String>) -> Self {
        MqError::Config(message.into())
    }

    /// Config and batch-shape errors are raised before the broker is touched.
    pub fn is_config(&self) -> bool {
        matches!(self, MqError::Config(_) | MqError::InvalidBatch(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for MqError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        classify(error_text)
    }
}

fn classify(error_text: String) -> MqError {
    let lowered = error_text.to_lowercase();

    if lowered.contains("connection") || lowered.contains("io error") {
        MqError::ConnectionError(error_text)
    } else if lowered.contains("channel") {
        MqError::ChannelError(error_text)
    } else if lowered.contains("publish") || lowered.contains("confirm") {
        MqError::PublishError(error_text)
    } else {
        MqError::Unknown(error_text)
    }
}

impl From<Elapsed> for MqError {
    fn from(_: Elapsed) -> Self {
        MqError::TimeoutError("broker did not answer in time".to_string())
    }
}

impl From<String> for MqError {
    fn from(message: String) -> Self {
        MqError::Unknown(message)
    }
}

impl From<&str> for MqError {
    fn from(message: &str) -> Self {
        MqError::Unknown(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_message_text() {
        assert!(matches!(
            classify("Connection reset by peer".to_string()),
            MqError::ConnectionError(_)
        ));
        assert!(matches!(
            classify("invalid channel state".to_string()),
            MqError::ChannelError(_)
        ));
        assert!(matches!(
            classify("publisher confirm was nacked".to_string()),
            MqError::PublishError(_)
        ));
        assert!(matches!(classify("boom".to_string()), MqError::Unknown(_)));
    }

    #[test]
    fn config_errors_are_flagged() {
        assert!(MqError::config("missing amqp.connections.x").is_config());
        assert!(MqError::InvalidBatch("not an array".into()).is_config());
        assert!(!MqError::PublishError("nack".into()).is_config());
    }

    #[tokio::test]
    async fn elapsed_maps_to_timeout() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            futures::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(MqError::from(elapsed), MqError::TimeoutError(_)));
    }
}
