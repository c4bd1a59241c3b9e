//! Simulation data model: templates, runs, device bindings and telemetry.
//!
//! ```text
//! Simulation (template)
//!   └── SimulationRun            one per execution, at most one unfinished
//!         ├── DeviceInstance     run-scoped binding of a DeviceProfile
//!         └── ChildRun           one per child simulation spec
//!               └── TelemetrySample (append-only, per device instance)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Wall-clock timestamp used across storage and the wire protocol.
pub type Timestamp = DateTime<Utc>;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a Simulation template.
    SimulationId
);
numeric_id!(
    /// Identifier of one run (SimulationInstance) of a template.
    RunId
);
numeric_id!(
    /// Identifier of one capability-specific child run.
    ChildRunId
);
numeric_id!(
    /// Run-scoped identifier of a simulated device.
    DeviceInstanceId
);

// ============================================================================
// SIMULATION TEMPLATES
// ============================================================================

/// The capability a child simulation exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationType {
    DeviceLocation,
    DeviceStatus,
    SimSwap,
}

impl SimulationType {
    /// Returns the wire name of the type.
    pub fn name(&self) -> &'static str {
        match self {
            SimulationType::DeviceLocation => "DEVICE_LOCATION",
            SimulationType::DeviceStatus => "DEVICE_STATUS",
            SimulationType::SimSwap => "SIM_SWAP",
        }
    }
}

impl std::fmt::Display for SimulationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SimulationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEVICE_LOCATION" => Ok(SimulationType::DeviceLocation),
            "DEVICE_STATUS" => Ok(SimulationType::DeviceStatus),
            "SIM_SWAP" => Ok(SimulationType::SimSwap),
            other => Err(format!("Unknown simulation type: {}", other)),
        }
    }
}

/// A stored, immutable simulation template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    pub id: SimulationId,
    pub name: String,
    pub description: String,
    pub payload: SimulationPayload,
    pub created_at: Timestamp,
}

/// Template contents as submitted by the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSimulation {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(flatten)]
    pub payload: SimulationPayload,
}

/// Devices, edge platforms and child simulation specs of a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationPayload {
    pub devices: Vec<DeviceProfile>,

    #[serde(default)]
    pub mec_platforms: Vec<MecPlatform>,

    pub child_simulations: Vec<ChildSimulationSpec>,
}

impl SimulationPayload {
    /// Looks up a device template by its key.
    pub fn device(&self, key: &str) -> Option<&DeviceProfile> {
        self.devices.iter().find(|d| d.id == key)
    }

    /// Longest child duration, i.e. how long a run lasts when left alone.
    pub fn duration_seconds(&self) -> u64 {
        self.child_simulations
            .iter()
            .map(ChildSimulationSpec::duration_seconds)
            .max()
            .unwrap_or(0)
    }
}

/// A simulated device (UE) template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Key used by child simulation specs to reference this device
    pub id: String,

    #[serde(default)]
    pub phone_number: Option<String>,

    #[serde(default)]
    pub network_access_identifier: Option<String>,

    #[serde(default)]
    pub ipv4_address: Option<Ipv4Address>,

    #[serde(default)]
    pub ipv6_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ipv4Address {
    #[serde(default)]
    pub public_address: Option<String>,

    #[serde(default)]
    pub private_address: Option<String>,

    #[serde(default)]
    pub public_port: Option<u16>,
}

/// A Multi-access Edge Computing platform offered by the simulated network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MecPlatform {
    #[serde(default)]
    pub edge_cloud_provider: Option<String>,

    #[serde(default)]
    pub edge_resource_name: Option<String>,

    pub latitude: f64,
    pub longitude: f64,
}

/// One child simulation, tagged by its simulation type.
///
/// `devices` always holds template device keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "simulation_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildSimulationSpec {
    DeviceLocation(LocationSchedule),
    DeviceStatus(StatusSchedule),
    SimSwap(SimSwapSchedule),
}

impl ChildSimulationSpec {
    pub fn simulation_type(&self) -> SimulationType {
        match self {
            ChildSimulationSpec::DeviceLocation(_) => SimulationType::DeviceLocation,
            ChildSimulationSpec::DeviceStatus(_) => SimulationType::DeviceStatus,
            ChildSimulationSpec::SimSwap(_) => SimulationType::SimSwap,
        }
    }

    /// Template keys of the devices this child simulates.
    pub fn device_keys(&self) -> &[String] {
        match self {
            ChildSimulationSpec::DeviceLocation(s) => &s.devices,
            ChildSimulationSpec::DeviceStatus(s) => &s.devices,
            ChildSimulationSpec::SimSwap(s) => &s.devices,
        }
    }

    /// Nominal duration: the itinerary duration or the last scheduled offset.
    pub fn duration_seconds(&self) -> u64 {
        match self {
            ChildSimulationSpec::DeviceLocation(s) => s.duration,
            ChildSimulationSpec::DeviceStatus(s) => s.max_offset(),
            ChildSimulationSpec::SimSwap(s) => s.offsets().last().copied().unwrap_or(0),
        }
    }
}

/// Movement along a road itinerary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSchedule {
    pub devices: Vec<String>,

    /// Total travel time in seconds
    pub duration: u64,

    pub itinerary: Vec<ItineraryStop>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItineraryStop {
    #[serde(default)]
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Connectivity/roaming timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSchedule {
    pub devices: Vec<String>,

    #[serde(default)]
    pub initial_status: DeviceStatus,

    #[serde(default)]
    pub device_status_updates: Vec<ScheduledStatus>,
}

impl StatusSchedule {
    /// Last scheduled offset in seconds (0 when only the initial status exists).
    pub fn max_offset(&self) -> u64 {
        self.device_status_updates
            .iter()
            .map(|u| u.on_timestamp)
            .max()
            .unwrap_or(0)
    }
}

/// A partial status update applied `on_timestamp` seconds into the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledStatus {
    pub on_timestamp: u64,

    #[serde(default)]
    pub connectivity_status: Option<ConnectivityStatus>,

    #[serde(default)]
    pub roaming: Option<bool>,

    #[serde(default)]
    pub country_code: Option<u32>,

    #[serde(default)]
    pub country_name: Option<Vec<String>>,
}

impl ScheduledStatus {
    /// The fields this entry overrides.
    pub fn update(&self) -> DeviceStatus {
        DeviceStatus {
            connectivity_status: self.connectivity_status,
            roaming: self.roaming,
            country_code: self.country_code,
            country_name: self.country_name.clone(),
        }
    }
}

/// SIM swaps at fixed offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSwapSchedule {
    pub devices: Vec<String>,
    pub timestamps_for_swaps_seconds: Vec<f64>,
}

impl SimSwapSchedule {
    /// Whole-second swap offsets, sorted and deduplicated.
    pub fn offsets(&self) -> Vec<u64> {
        let mut offsets: Vec<u64> = self
            .timestamps_for_swaps_seconds
            .iter()
            .filter(|s| s.is_finite() && **s >= 0.0)
            .map(|s| s.trunc() as u64)
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }
}

// ============================================================================
// DEVICE STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityStatus {
    ConnectedData,
    ConnectedSms,
    NotConnected,
}

/// Connectivity/roaming snapshot. Absent fields mean "unknown" or "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(default)]
    pub connectivity_status: Option<ConnectivityStatus>,

    #[serde(default)]
    pub roaming: Option<bool>,

    #[serde(default)]
    pub country_code: Option<u32>,

    #[serde(default)]
    pub country_name: Option<Vec<String>>,
}

impl DeviceStatus {
    /// Overrides the fields present in `update`, keeping the rest.
    pub fn merge(&mut self, update: &DeviceStatus) {
        if update.connectivity_status.is_some() {
            self.connectivity_status = update.connectivity_status;
        }
        if update.roaming.is_some() {
            self.roaming = update.roaming;
        }
        if update.country_code.is_some() {
            self.country_code = update.country_code;
        }
        if update.country_name.is_some() {
            self.country_name = update.country_name.clone();
        }
    }

    /// Returns a copy with `update` merged in.
    pub fn merged(&self, update: &DeviceStatus) -> DeviceStatus {
        let mut next = self.clone();
        next.merge(update);
        next
    }
}

// ============================================================================
// RUNS
// ============================================================================

/// Whether a simulation currently has a live run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    Running,
    NotRunning,
}

/// One execution of a simulation template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub id: RunId,
    pub simulation_id: SimulationId,
    pub start_timestamp: Option<Timestamp>,
    pub end_timestamp: Option<Timestamp>,
}

impl SimulationRun {
    pub fn is_finished(&self) -> bool {
        self.end_timestamp.is_some()
    }

    pub fn status(&self) -> SimulationStatus {
        if self.start_timestamp.is_some() && self.end_timestamp.is_none() {
            SimulationStatus::Running
        } else {
            SimulationStatus::NotRunning
        }
    }
}

/// Configuration shipped with a START command.
///
/// `devices` are the run's instance ids, positionally matching
/// `spec.device_keys()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRunConfig {
    pub devices: Vec<DeviceInstanceId>,
    pub spec: ChildSimulationSpec,
}

/// One capability-specific part of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRun {
    pub id: ChildRunId,
    pub run_id: RunId,
    pub simulation_id: SimulationId,
    pub simulation_type: SimulationType,
    pub duration_seconds: u64,
    pub config: ChildRunConfig,
    pub start_timestamp: Option<Timestamp>,
    pub end_timestamp: Option<Timestamp>,
}

impl ChildRun {
    pub fn is_finished(&self) -> bool {
        self.end_timestamp.is_some()
    }
}

/// A device template bound to one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInstance {
    pub id: DeviceInstanceId,
    pub run_id: RunId,
    pub device: DeviceProfile,
}

// ============================================================================
// TELEMETRY
// ============================================================================

/// Typed sample body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SamplePayload {
    DeviceLocation { latitude: f64, longitude: f64 },
    DeviceStatus(DeviceStatus),
    SimSwap,
}

impl SamplePayload {
    pub fn simulation_type(&self) -> SimulationType {
        match self {
            SamplePayload::DeviceLocation { .. } => SimulationType::DeviceLocation,
            SamplePayload::DeviceStatus(_) => SimulationType::DeviceStatus,
            SamplePayload::SimSwap => SimulationType::SimSwap,
        }
    }
}

/// One append-only telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub run_instance_id: RunId,
    pub child_instance_id: ChildRunId,
    pub device_instance_id: DeviceInstanceId,
    pub payload: SamplePayload,
    pub timestamp: Timestamp,
}
