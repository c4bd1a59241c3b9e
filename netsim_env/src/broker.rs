//! Message-broker abstraction for the coordination protocol.
//!
//! # Topology
//!
//! ```text
//! API layer ──START──► [sim-control-work]       ──► exactly one orchestrator
//! API layer ──STOP───► [sim-control-broadcast]  ──► every orchestrator
//! players  ──sample──► [telemetry-persist]      ──► persistence worker
//! players  ──sample──► [telemetry-events]       ──► events worker (matchers)
//! ```
//!
//! Channels are never shared between concurrently publishing units: every
//! timeline player opens its own `PublishChannel` and closes it when done.

use crate::error::EnvError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The four logical channels of the coordination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// "start simulation" commands, one consumer per message
    ControlWork,

    /// "stop simulation" commands, delivered to every orchestrator
    ControlBroadcast,

    /// Telemetry samples bound for storage
    TelemetryPersist,

    /// Telemetry samples and subscription events bound for matching
    TelemetryEvents,
}

/// Delivery semantics of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Point-to-point: competing consumers, each message processed once
    WorkQueue,

    /// Fanout: every consumer receives every message
    Fanout,
}

impl Topic {
    /// Returns every topic the engine needs declared at startup.
    pub fn all() -> [Topic; 4] {
        [
            Topic::ControlWork,
            Topic::ControlBroadcast,
            Topic::TelemetryPersist,
            Topic::TelemetryEvents,
        ]
    }

    /// Returns the wire name of the topic.
    pub fn name(&self) -> &'static str {
        match self {
            Topic::ControlWork => "sim-control-work",
            Topic::ControlBroadcast => "sim-control-broadcast",
            Topic::TelemetryPersist => "telemetry-persist",
            Topic::TelemetryEvents => "telemetry-events",
        }
    }

    /// Returns the delivery semantics of the topic.
    pub fn kind(&self) -> TopicKind {
        match self {
            Topic::ControlBroadcast => TopicKind::Fanout,
            _ => TopicKind::WorkQueue,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Topic {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::all()
            .into_iter()
            .find(|topic| topic.name() == s)
            .ok_or_else(|| EnvError::unknown_topic(s))
    }
}

/// A message taken off a topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the message was consumed from
    pub topic: Topic,

    /// Raw message body (JSON on every topic)
    pub payload: Vec<u8>,
}

/// Broker connection shared by a worker process.
///
/// # Implementations
///
/// - **In-process**: `LocalBroker` - tokio channels, used by the single-binary
///   deployment and by tests
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Declares a topic. Declaring an existing topic is a no-op.
    ///
    /// # Returns
    /// * `Err(EnvError::DeclareError)` - the worker cannot function and should exit
    async fn declare(&self, topic: Topic) -> Result<(), EnvError>;

    /// Declares every topic of the coordination protocol.
    async fn declare_all(&self) -> Result<(), EnvError> {
        for topic in Topic::all() {
            self.declare(topic).await?;
        }
        Ok(())
    }

    /// Opens a dedicated publishing channel.
    ///
    /// The returned channel must not be shared between concurrent publishers.
    async fn open_channel(&self) -> Result<Box<dyn PublishChannel>, EnvError>;

    /// Starts consuming a declared topic.
    ///
    /// For work queues, consumers compete and each message reaches one of them.
    /// For fanout topics, each consumer sees every message published after it
    /// subscribed.
    async fn consume(&self, topic: Topic) -> Result<Box<dyn Consumer>, EnvError>;
}

/// A single-owner publishing channel.
#[async_trait]
pub trait PublishChannel: Send {
    /// Publishes a message body to a topic.
    ///
    /// # Returns
    /// * `Err(EnvError::ChannelClosed)` - the channel was closed before
    /// * `Err(EnvError::UnknownTopic)` - the topic was never declared
    async fn publish(&mut self, topic: Topic, payload: Vec<u8>) -> Result<(), EnvError>;

    /// Closes the channel. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), EnvError>;
}

/// A subscription to one topic.
#[async_trait]
pub trait Consumer: Send {
    /// Receives the next message.
    ///
    /// # Returns
    /// * `Some(delivery)` - a message was received
    /// * `None` - the topic was torn down
    async fn recv(&mut self) -> Option<Delivery>;
}
