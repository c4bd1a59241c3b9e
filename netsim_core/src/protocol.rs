//! Message schemas carried over the coordination channels.
//!
//! Every body is JSON. Control messages travel on `sim-control-work` (START)
//! and `sim-control-broadcast` (STOP). Telemetry envelopes and subscription
//! events share the telemetry topics and are told apart by `scope`.

use crate::model::{
    ChildRun, ChildRunConfig, ChildRunId, DeviceInstanceId, RunId, SamplePayload, SimulationId,
    SimulationType, TelemetrySample, Timestamp,
};
use crate::subscription::Subscription;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope tag of telemetry envelopes.
pub const SIMULATION_DATA_SCOPE: &str = "SIMULATION_DATA";

/// Scope tag of subscription events.
pub const SUBSCRIPTIONS_SCOPE: &str = "SUBSCRIPTIONS";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Serializes a message body.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Parses a message body.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

// ============================================================================
// CONTROL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    Start,
    Stop,
}

/// START/STOP command for one child run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub simulation_type: SimulationType,
    pub simulation_id: SimulationId,
    pub simulation_instance_id: RunId,
    pub child_simulation_instance_id: ChildRunId,

    /// Present only on START
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation_config: Option<ChildRunConfig>,
}

impl ControlMessage {
    pub fn start(child: &ChildRun) -> Self {
        Self {
            action: ControlAction::Start,
            simulation_type: child.simulation_type,
            simulation_id: child.simulation_id,
            simulation_instance_id: child.run_id,
            child_simulation_instance_id: child.id,
            simulation_config: Some(child.config.clone()),
        }
    }

    pub fn stop(child: &ChildRun) -> Self {
        Self {
            action: ControlAction::Stop,
            simulation_type: child.simulation_type,
            simulation_id: child.simulation_id,
            simulation_instance_id: child.run_id,
            child_simulation_instance_id: child.id,
            simulation_config: None,
        }
    }
}

// ============================================================================
// TELEMETRY
// ============================================================================

/// A sample as published by a timeline player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSample {
    pub device_instance_id: DeviceInstanceId,
    pub timestamp: Timestamp,
    pub payload: SamplePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryData {
    Sample(DeviceSample),

    /// Marker emitted once a run has ended, clears matcher state
    SimulationEnded { ended_at: Timestamp },
}

/// Envelope of everything players and the orchestrator emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub simulation_id: SimulationId,
    pub simulation_instance_id: RunId,
    pub child_simulation_instance_id: ChildRunId,
    pub simulation_type: SimulationType,
    pub data: TelemetryData,
}

impl TelemetryEnvelope {
    /// The storage record of a sample envelope.
    pub fn to_sample(&self) -> Option<TelemetrySample> {
        match &self.data {
            TelemetryData::Sample(sample) => Some(TelemetrySample {
                run_instance_id: self.simulation_instance_id,
                child_instance_id: self.child_simulation_instance_id,
                device_instance_id: sample.device_instance_id,
                payload: sample.payload.clone(),
                timestamp: sample.timestamp,
            }),
            TelemetryData::SimulationEnded { .. } => None,
        }
    }
}

// ============================================================================
// SUBSCRIPTION EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionOperation {
    Add,
    Delete,
}

/// Emitted by the API layer when subscriptions are created or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub operation: SubscriptionOperation,
    pub subscriptions: Vec<Subscription>,
}

/// Any body found on the telemetry topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope")]
pub enum EventsMessage {
    #[serde(rename = "SIMULATION_DATA")]
    Telemetry(TelemetryEnvelope),

    #[serde(rename = "SUBSCRIPTIONS")]
    Subscriptions(SubscriptionEvent),
}
