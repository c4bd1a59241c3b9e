//! Network simulation engine.
//!
//! Replays simulation templates as timed telemetry, keeps run lifecycle
//! state in storage and turns the telemetry into subscriber notifications.
//!
//! # Roles
//!
//! - **Launcher**: admission check, transactional run creation, START/STOP
//! - **Orchestrator**: owns the players of the child runs it picked up
//! - **Players**: one per device, walk a timeline and publish samples
//! - **Events worker**: subscription cache, matchers, webhook delivery
//! - **Persistence worker**: stores every sample
//! - **Cleanup sweep**: closes children whose stop was missed
//!
//! Every role talks to the others only through the broker topics and the
//! storage, so they can run in one process (`Engine`) or apart.
//!
//! # Usage
//!
//! ```ignore
//! use netsim_sim::{Engine, EngineConfig};
//!
//! let engine = Engine::start(ctx, broker, storage, router, client, &EngineConfig::default());
//! let (run, _) = engine.launcher().start_simulation(simulation_id).await?;
//! engine.wait_for_run(run.id).await?;
//! ```

pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod events_worker;
pub mod launcher;
pub mod orchestrator;
pub mod persistence_worker;
pub mod players;
pub mod telemetry;

pub use cleanup::CleanupSweep;
pub use config::EngineConfig;
pub use engine::{Engine, RunSummary};
pub use error::{LaunchError, OrchestratorError, WorkerError};
pub use events_worker::EventsWorker;
pub use launcher::Launcher;
pub use orchestrator::Orchestrator;
pub use persistence_worker::PersistenceWorker;
