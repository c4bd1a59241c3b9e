//! Storage seam of the engine.
//!
//! The engine only needs a handful of reads and writes plus two queries:
//! "is there an unfinished run for simulation X" and "active, non-expired
//! subscriptions for simulation X". Run creation goes through a
//! [`RunTransaction`] so a half-created run never becomes visible.

mod sled_store;

pub use sled_store::SledStorage;

use crate::model::{
    ChildRun, ChildRunConfig, ChildRunId, DeviceInstance, DeviceInstanceId, DeviceProfile,
    DeviceStatus, NewSimulation, RunId, SamplePayload, Simulation, SimulationId, SimulationRun,
    SimulationType, TelemetrySample, Timestamp,
};
use crate::subscription::{NotificationId, NotificationRecord, Subscription, SubscriptionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Simulation {0} already has an unfinished run")]
    AlreadyRunning(SimulationId),
}

impl StorageError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

/// Result of ending a child run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEnd {
    pub child: ChildRun,

    /// False when the child had already ended before this call
    pub newly_ended: bool,

    /// True only for the call that closed the parent run
    pub run_completed: bool,
}

/// Staged creation of a run with its device instances and children.
///
/// Nothing is visible to other readers until `commit`. Dropping the
/// transaction rolls it back.
pub trait RunTransaction {
    /// Id the run will have once committed.
    fn run_id(&self) -> RunId;

    /// Binds a device template to the run.
    fn add_device_instance(&mut self, device: DeviceProfile) -> Result<DeviceInstanceId, StorageError>;

    /// Adds one child run.
    fn add_child(
        &mut self,
        simulation_type: SimulationType,
        duration_seconds: u64,
        config: ChildRunConfig,
    ) -> Result<ChildRunId, StorageError>;

    /// Publishes every staged row atomically.
    ///
    /// # Returns
    /// * `Err(StorageError::AlreadyRunning)` - another run was admitted meanwhile
    fn commit(self: Box<Self>) -> Result<(SimulationRun, Vec<ChildRun>), StorageError>;
}

/// Read/write operations the engine performs.
///
/// Implementations must be thread-safe; workers share one instance.
pub trait Storage: Send + Sync {
    // ---- simulations ------------------------------------------------------

    fn insert_simulation(&self, new: NewSimulation) -> Result<Simulation, StorageError>;

    fn simulation(&self, id: SimulationId) -> Result<Option<Simulation>, StorageError>;

    // ---- runs -------------------------------------------------------------

    /// Whether the simulation has a run without `end_timestamp`.
    fn has_unfinished_run(&self, simulation_id: SimulationId) -> Result<bool, StorageError>;

    fn latest_run(&self, simulation_id: SimulationId) -> Result<Option<SimulationRun>, StorageError>;

    fn runs_of(&self, simulation_id: SimulationId) -> Result<Vec<SimulationRun>, StorageError>;

    fn run(&self, id: RunId) -> Result<Option<SimulationRun>, StorageError>;

    /// Starts staging a new run. Admission is checked now and again at commit.
    fn begin_run(
        &self,
        simulation_id: SimulationId,
    ) -> Result<Box<dyn RunTransaction + '_>, StorageError>;

    fn child_run(&self, id: ChildRunId) -> Result<Option<ChildRun>, StorageError>;

    fn children_of(&self, run_id: RunId) -> Result<Vec<ChildRun>, StorageError>;

    /// Every child run, across simulations, without an end timestamp.
    fn unfinished_children(&self) -> Result<Vec<ChildRun>, StorageError>;

    /// Sets the child's start (and the run's, if still unset).
    fn mark_child_started(&self, id: ChildRunId, at: Timestamp) -> Result<ChildRun, StorageError>;

    /// Sets the child's end, and the run's end once all its children ended.
    fn mark_child_ended(&self, id: ChildRunId, at: Timestamp) -> Result<ChildEnd, StorageError>;

    fn device_instance(&self, id: DeviceInstanceId) -> Result<Option<DeviceInstance>, StorageError>;

    fn device_instances_of(&self, run_id: RunId) -> Result<Vec<DeviceInstance>, StorageError>;

    // ---- telemetry --------------------------------------------------------

    fn append_sample(&self, sample: &TelemetrySample) -> Result<(), StorageError>;

    /// Most recent sample of one type for a device instance.
    fn latest_sample(
        &self,
        device_instance_id: DeviceInstanceId,
        simulation_type: SimulationType,
    ) -> Result<Option<TelemetrySample>, StorageError>;

    /// Current connectivity/roaming state of a device instance.
    fn latest_device_status(
        &self,
        device_instance_id: DeviceInstanceId,
    ) -> Result<Option<DeviceStatus>, StorageError> {
        let sample = self.latest_sample(device_instance_id, SimulationType::DeviceStatus)?;
        Ok(sample.and_then(|s| match s.payload {
            SamplePayload::DeviceStatus(status) => Some(status),
            _ => None,
        }))
    }

    // ---- subscriptions ----------------------------------------------------

    fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError>;

    /// Returns whether a subscription was removed.
    fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError>;

    /// Non-expired subscriptions of a simulation.
    fn active_subscriptions(
        &self,
        simulation_id: SimulationId,
        now: Timestamp,
    ) -> Result<Vec<Subscription>, StorageError>;

    // ---- notifications ----------------------------------------------------

    /// Records a pending delivery attempt.
    fn record_notification(
        &self,
        subscription_id: SubscriptionId,
        event_type: &str,
        at: Timestamp,
    ) -> Result<NotificationId, StorageError>;

    /// Completes a delivery attempt with its outcome.
    fn complete_notification(
        &self,
        id: NotificationId,
        outcome: Result<(), String>,
        at: Timestamp,
    ) -> Result<(), StorageError>;

    fn notifications_for(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<NotificationRecord>, StorageError>;
}
