//! Webhook notification delivery.
//!
//! Every attempt is recorded as a pending row first and completed with its
//! outcome afterwards. Delivery is best-effort: failures are logged and
//! recorded, never retried.

use crate::matching::PendingNotification;
use crate::model::{DeviceProfile, DeviceStatus, Timestamp};
use crate::storage::{Storage, StorageError};
use crate::subscription::{Area, DeviceStatusEvent, SubscriptionKind, Webhook};
use async_trait::async_trait;
use netsim_env::NetSimContext;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default webhook request timeout.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Webhook answered HTTP {0}")]
    Status(u16),
}

impl DeliveryError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// CloudEvents 1.0 envelope posted to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub specversion: String,
    pub datacontenttype: String,
    pub time: Timestamp,
    pub data: Value,
}

/// HTTP seam of the dispatcher.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post(&self, webhook: &Webhook, event: &CloudEvent) -> Result<(), DeliveryError>;
}

/// Production webhook client backed by `reqwest`.
pub struct ReqwestWebhookClient {
    client: reqwest::Client,
}

impl ReqwestWebhookClient {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DeliveryError::transport)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookClient for ReqwestWebhookClient {
    async fn post(&self, webhook: &Webhook, event: &CloudEvent) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&webhook.notification_url).json(event);
        if let Some(token) = &webhook.notification_auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(DeliveryError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Renders pending notifications and delivers them.
pub struct NotificationDispatcher<Ctx: NetSimContext> {
    ctx: Arc<Ctx>,
    storage: Arc<dyn Storage>,
    client: Arc<dyn WebhookClient>,
    source: String,
}

impl<Ctx: NetSimContext> NotificationDispatcher<Ctx> {
    pub fn new(
        ctx: Arc<Ctx>,
        storage: Arc<dyn Storage>,
        client: Arc<dyn WebhookClient>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            storage,
            client,
            source: source.into(),
        }
    }

    fn now(&self) -> Timestamp {
        Timestamp::from(self.ctx.system_time())
    }

    /// Builds the envelope for a pending notification.
    pub fn build_event(&self, pending: &PendingNotification) -> Result<CloudEvent, StorageError> {
        let subscription = &pending.subscription;
        let device = self
            .storage
            .device_instance(subscription.device_instance_id)?
            .map(|instance| instance.device);
        if device.is_none() {
            warn!(
                "Device instance {} of subscription {} is unknown",
                subscription.device_instance_id, subscription.id
            );
        }

        let data = match &subscription.kind {
            SubscriptionKind::Geofencing { area, .. } => json!({
                "device": device.as_ref().map(device_json).unwrap_or_else(|| json!({})),
                "area": area_json(area),
                "subscriptionId": subscription.id.to_string(),
            }),
            SubscriptionKind::DeviceStatus { event } => {
                let phone = device.as_ref().and_then(|d| d.phone_number.clone());
                let status = pending.status.clone().unwrap_or_default();
                status_json(*event, phone, subscription.id.to_string(), &status)
            }
        };

        Ok(CloudEvent {
            id: Uuid::new_v4().to_string(),
            source: self.source.clone(),
            event_type: pending.event().cloud_event_type().to_string(),
            specversion: "1.0".to_string(),
            datacontenttype: "application/json".to_string(),
            time: self.now(),
            data,
        })
    }

    /// Records, posts and completes one notification.
    ///
    /// # Returns
    /// * `Ok(true)` - Subscriber acknowledged with a 2xx
    /// * `Ok(false)` - Delivery failed; the failure is recorded
    /// * `Err(StorageError)` - The event could not be built or the audit row
    ///   could not be written; no pending row is left behind
    pub async fn deliver(&self, pending: &PendingNotification) -> Result<bool, StorageError> {
        let subscription = &pending.subscription;
        let event = self.build_event(pending)?;
        let event_type = event.event_type.as_str();
        let record = self
            .storage
            .record_notification(subscription.id, event_type, self.now())?;

        info!(
            "Sending {} notification to {} (subscription {})",
            event_type, subscription.webhook.notification_url, subscription.id
        );

        match self.client.post(&subscription.webhook, &event).await {
            Ok(()) => {
                info!(
                    "Notification to {} was successful",
                    subscription.webhook.notification_url
                );
                self.storage.complete_notification(record, Ok(()), self.now())?;
                Ok(true)
            }
            Err(e) => {
                error!(
                    "Error sending notification to {}: {}",
                    subscription.webhook.notification_url, e
                );
                self.storage
                    .complete_notification(record, Err(e.to_string()), self.now())?;
                Ok(false)
            }
        }
    }
}

fn device_json(device: &DeviceProfile) -> Value {
    json!({
        "phoneNumber": device.phone_number,
        "networkAccessIdentifier": device.network_access_identifier,
        "ipv4Address": device.ipv4_address.as_ref().map(|ip| json!({
            "publicAddress": ip.public_address,
            "privateAddress": ip.private_address,
            "publicPort": ip.public_port,
        })),
        "ipv6Address": device.ipv6_address,
    })
}

fn area_json(area: &Area) -> Value {
    match area {
        Area::Circle { center, radius } => json!({
            "areaType": "CIRCLE",
            "center": { "latitude": center.latitude, "longitude": center.longitude },
            "radius": radius,
        }),
        Area::Polygon { boundary } => json!({
            "areaType": "POLYGON",
            "boundary": boundary
                .iter()
                .map(|p| json!({ "latitude": p.latitude, "longitude": p.longitude }))
                .collect::<Vec<_>>(),
        }),
    }
}

/// Device-status data carries only the fields relevant to the event kind.
fn status_json(
    event: DeviceStatusEvent,
    phone_number: Option<String>,
    subscription_id: String,
    status: &DeviceStatus,
) -> Value {
    let mut data = Map::new();
    data.insert("device".into(), json!({ "phoneNumber": phone_number }));
    data.insert("subscriptionId".into(), Value::String(subscription_id));

    match event {
        DeviceStatusEvent::RoamingStatus => {
            data.insert("roaming".into(), json!(status.roaming));
            data.insert("countryCode".into(), json!(status.country_code));
            data.insert("countryName".into(), json!(status.country_name));
        }
        DeviceStatusEvent::RoamingOn | DeviceStatusEvent::RoamingChangeCountry => {
            data.insert("countryCode".into(), json!(status.country_code));
            data.insert("countryName".into(), json!(status.country_name));
        }
        DeviceStatusEvent::RoamingOff
        | DeviceStatusEvent::ConnectivityData
        | DeviceStatusEvent::ConnectivitySms
        | DeviceStatusEvent::ConnectivityDisconnected => {}
    }
    Value::Object(data)
}
