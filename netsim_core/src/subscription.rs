//! Subscriptions, target areas and notification audit records.

use crate::model::{ConnectivityStatus, DeviceInstanceId, RunId, SimulationId, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a subscription, assigned by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a notification delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub u64);

/// WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Geofence target area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "area_type", rename_all = "lowercase")]
pub enum Area {
    Circle {
        center: GeoPoint,
        /// Radius in meters
        radius: f64,
    },
    Polygon {
        boundary: Vec<GeoPoint>,
    },
}

/// Callback the subscriber registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub notification_url: String,

    #[serde(default)]
    pub notification_auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeofenceEvent {
    AreaEntered,
    AreaLeft,
}

impl GeofenceEvent {
    pub fn cloud_event_type(&self) -> &'static str {
        match self {
            GeofenceEvent::AreaEntered => "org.camaraproject.geofencing.v0.area-entered",
            GeofenceEvent::AreaLeft => "org.camaraproject.geofencing.v0.area-left",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatusEvent {
    RoamingStatus,
    RoamingOn,
    RoamingOff,
    RoamingChangeCountry,
    ConnectivityData,
    ConnectivitySms,
    ConnectivityDisconnected,
}

impl DeviceStatusEvent {
    pub fn cloud_event_type(&self) -> &'static str {
        match self {
            DeviceStatusEvent::RoamingStatus => "org.camaraproject.device-status.v0.roaming-status",
            DeviceStatusEvent::RoamingOn => "org.camaraproject.device-status.v0.roaming-on",
            DeviceStatusEvent::RoamingOff => "org.camaraproject.device-status.v0.roaming-off",
            DeviceStatusEvent::RoamingChangeCountry => {
                "org.camaraproject.device-status.v0.roaming-change-country"
            }
            DeviceStatusEvent::ConnectivityData => {
                "org.camaraproject.device-status.v0.connectivity-data"
            }
            DeviceStatusEvent::ConnectivitySms => "org.camaraproject.device-status.v0.connectivity-sms",
            DeviceStatusEvent::ConnectivityDisconnected => {
                "org.camaraproject.device-status.v0.connectivity-disconnected"
            }
        }
    }

    /// Connectivity value a CONNECTIVITY_* subscription waits for.
    pub fn target_connectivity(&self) -> Option<ConnectivityStatus> {
        match self {
            DeviceStatusEvent::ConnectivityData => Some(ConnectivityStatus::ConnectedData),
            DeviceStatusEvent::ConnectivitySms => Some(ConnectivityStatus::ConnectedSms),
            DeviceStatusEvent::ConnectivityDisconnected => Some(ConnectivityStatus::NotConnected),
            _ => None,
        }
    }

    /// Roaming value a ROAMING_ON/OFF subscription waits for.
    pub fn target_roaming(&self) -> Option<bool> {
        match self {
            DeviceStatusEvent::RoamingOn => Some(true),
            DeviceStatusEvent::RoamingOff => Some(false),
            _ => None,
        }
    }
}

/// What a subscription watches for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subscription_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionKind {
    Geofencing { area: Area, event: GeofenceEvent },
    DeviceStatus { event: DeviceStatusEvent },
}

impl SubscriptionKind {
    /// The event a notification for this subscription reports.
    pub fn event(&self) -> NotificationEvent {
        match self {
            SubscriptionKind::Geofencing { event, .. } => NotificationEvent::Geofencing(*event),
            SubscriptionKind::DeviceStatus { event } => NotificationEvent::DeviceStatus(*event),
        }
    }
}

/// A registered subscription as stored and exchanged with the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub simulation_id: SimulationId,

    #[serde(default)]
    pub run_id: Option<RunId>,

    pub device_instance_id: DeviceInstanceId,
    pub webhook: Webhook,

    #[serde(default)]
    pub expire_time: Option<Timestamp>,

    pub kind: SubscriptionKind,
}

impl Subscription {
    /// A subscription without expiry never expires.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expire_time.map_or(false, |expire| expire <= now)
    }
}

/// Event a notification reports, across subscription families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationEvent {
    Geofencing(GeofenceEvent),
    DeviceStatus(DeviceStatusEvent),
}

impl NotificationEvent {
    pub fn cloud_event_type(&self) -> &'static str {
        match self {
            NotificationEvent::Geofencing(e) => e.cloud_event_type(),
            NotificationEvent::DeviceStatus(e) => e.cloud_event_type(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// Write-only audit row, one per delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub subscription_id: SubscriptionId,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl NotificationRecord {
    pub fn success(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}
