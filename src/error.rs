//! Error types for pushgate.

use thiserror::Error;

/// Main error type for pushgate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading or parsing error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Kafka consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// APNs push notification error.
    #[error("APNs error: {0}")]
    Apns(String),

    /// Feedback topic does not match the expected naming scheme.
    #[error("Unparseable feedback topic: {0}")]
    Topic(String),

    /// The push queue is closed and no longer accepts notifications.
    #[error("Push queue is closed")]
    QueueClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JWT token error.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error reported while sending a push notification, carrying the
/// provider's error key and a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Sending push notification failed with error {key} ({description}).")]
pub struct PushError {
    pub key: String,
    pub description: String,
}

impl PushError {
    pub fn new(key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
        }
    }
}
