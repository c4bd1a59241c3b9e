//! Network Simulator Environment Abstraction Layer
//!
//! This crate isolates the engine from the "outside world" so that the
//! orchestrator, players and workers can run against a real runtime in
//! production and against paused virtual time in tests.
//!
//! # Core Concept
//!
//! Every suspension point and every message hop goes through a trait:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Tasks (`spawn()`)
//! - Messaging (`declare()`, `open_channel()`, `consume()`)
//!
//! # Example
//!
//! ```ignore
//! use netsim_env::{MessageBroker, NetSimContext, Topic};
//!
//! async fn heartbeat<Ctx: NetSimContext, B: MessageBroker>(ctx: &Ctx, broker: &B) {
//!     let mut channel = broker.open_channel().await?;
//!     loop {
//!         channel.publish(Topic::TelemetryEvents, b"tick".to_vec()).await?;
//!         ctx.sleep(Duration::from_secs(1)).await;
//!     }
//! }
//! ```

mod broker;
mod context;
mod error;
mod local_broker;
mod tokio_impl;
mod types;

pub use broker::{Consumer, Delivery, MessageBroker, PublishChannel, Topic, TopicKind};
pub use context::NetSimContext;
pub use error::EnvError;
pub use local_broker::LocalBroker;
pub use tokio_impl::TokioContext;
pub use types::WorkerId;
