use std::time::Duration;

use thiserror::Error;

use crate::types::{MessageId, Topic};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error, {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("publish error, topic: {topic}, {reason}")]
    Publish { topic: Topic, reason: String },
    #[error("subscription error, {0}")]
    Subscription(String),
    #[error("validation error, {0}")]
    Validation(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("message {id} abandoned after {attempts} retries")]
    RetryExhausted { id: MessageId, attempts: usize },
    #[error("handler task failed, {0}")]
    Join(String),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid filter pattern, {0}")]
    Pattern(#[from] regex::Error),
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    #[inline]
    pub fn publish<T: Into<Topic>, R: ToString>(topic: T, reason: R) -> Self {
        Error::Publish { topic: topic.into(), reason: reason.to_string() }
    }

    #[inline]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen)
    }
}

impl From<tokio::task::JoinError> for Error {
    #[inline]
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Join(e.to_string())
    }
}
