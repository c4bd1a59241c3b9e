//! Error types of the worker roles.

use netsim_core::geo_verify::GeoError;
use netsim_core::model::SimulationId;
use netsim_core::protocol::ProtocolError;
use netsim_core::routing::RoutingError;
use netsim_core::storage::StorageError;
use netsim_env::EnvError;
use thiserror::Error;

/// Why a run could not be launched or stopped.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Simulation {0} not found")]
    NotFound(SimulationId),

    #[error("Simulation {0} already has an unfinished run")]
    AlreadyRunning(SimulationId),

    #[error("Simulation {0} is invalid: {1}")]
    InvalidSimulation(SimulationId, String),

    #[error("Run creation failed: {0}")]
    Storage(StorageError),

    #[error("Broker error: {0}")]
    Env(#[from] EnvError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<StorageError> for LaunchError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AlreadyRunning(id) => Self::AlreadyRunning(id),
            other => Self::Storage(other),
        }
    }
}

/// Errors raised while handling a control message.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("START for child run {0} carries no configuration")]
    MissingConfig(u64),

    #[error("Invalid child configuration: {0}")]
    InvalidConfig(String),

    #[error("Routing failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Broker error: {0}")]
    Env(#[from] EnvError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Per-message errors of the telemetry consumers. Logged, never fatal.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Malformed message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Geometry error: {0}")]
    Geo(#[from] GeoError),

    #[error("Broker error: {0}")]
    Env(#[from] EnvError),
}
