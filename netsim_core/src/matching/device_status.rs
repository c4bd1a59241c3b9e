//! Device-status matcher: connectivity and roaming transitions.

use super::cache::{MatchState, SharedSubscription};
use super::PendingNotification;
use crate::model::{DeviceInstanceId, DeviceStatus, Timestamp};
use crate::subscription::{DeviceStatusEvent, SubscriptionKind};
use tracing::debug;

/// Decides whether a device-status subscription fires for `sample`, given the
/// last known snapshot `cached`.
pub fn should_fire(event: DeviceStatusEvent, cached: &DeviceStatus, sample: &DeviceStatus) -> bool {
    match event {
        DeviceStatusEvent::ConnectivityData
        | DeviceStatusEvent::ConnectivitySms
        | DeviceStatusEvent::ConnectivityDisconnected => {
            sample.connectivity_status.is_some()
                && sample.connectivity_status == event.target_connectivity()
                && sample.connectivity_status != cached.connectivity_status
        }
        DeviceStatusEvent::RoamingOn | DeviceStatusEvent::RoamingOff => {
            sample.roaming.is_some()
                && sample.roaming == event.target_roaming()
                && sample.roaming != cached.roaming
        }
        DeviceStatusEvent::RoamingStatus => {
            sample.roaming.is_some() && sample.roaming != cached.roaming
        }
        DeviceStatusEvent::RoamingChangeCountry => {
            sample.country_code.is_some() && sample.country_code != cached.country_code
        }
    }
}

/// Evaluates one status sample against the cached subscriptions.
///
/// Every matching subscription gets the sample merged into its snapshot;
/// fired notifications carry the merged snapshot.
pub fn evaluate(
    subscriptions: &[SharedSubscription],
    device_instance_id: DeviceInstanceId,
    sample: &DeviceStatus,
    now: Timestamp,
) -> Vec<PendingNotification> {
    let mut pending = Vec::new();

    for shared in subscriptions {
        let mut tracked = shared.lock();
        if tracked.subscription.device_instance_id != device_instance_id
            || tracked.subscription.is_expired(now)
        {
            continue;
        }
        let event = match tracked.subscription.kind {
            SubscriptionKind::DeviceStatus { event } => event,
            SubscriptionKind::Geofencing { .. } => continue,
        };

        let cached = match &tracked.state {
            MatchState::DeviceStatus { current } => current.clone(),
            MatchState::Geofence { .. } => DeviceStatus::default(),
        };
        let fire = should_fire(event, &cached, sample);
        let merged = cached.merged(sample);

        if fire {
            debug!(
                "Subscription {} fires {:?} for device {}",
                tracked.subscription.id, event, device_instance_id
            );
            pending.push(PendingNotification {
                subscription: tracked.subscription.clone(),
                status: Some(merged.clone()),
            });
        }
        tracked.state = MatchState::DeviceStatus { current: merged };
    }

    pending
}
