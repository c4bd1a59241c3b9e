//! Error types for the simulator environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Topology declaration failed (fatal at process start)
    #[error("Declare error: {0}")]
    DeclareError(String),

    /// Publish or consume against a topic that was never declared
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Publish on a channel that has already been closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Any other broker failure
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// Message serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EnvError {
    /// Creates a broker error.
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::BrokerError(msg.into())
    }

    /// Creates a declare error.
    pub fn declare(msg: impl Into<String>) -> Self {
        Self::DeclareError(msg.into())
    }

    /// Creates an unknown-topic error.
    pub fn unknown_topic(topic: impl std::fmt::Display) -> Self {
        Self::UnknownTopic(topic.to_string())
    }
}
