//! Geofencing matcher: AREA_ENTERED / AREA_LEFT edge detection.

use super::cache::{MatchState, SharedSubscription};
use super::PendingNotification;
use crate::geo_verify::{self, GeoError};
use crate::model::{DeviceInstanceId, Timestamp};
use crate::subscription::{GeoPoint, GeofenceEvent, SubscriptionKind};
use tracing::{debug, warn};

/// Decides whether a geofence subscription fires.
///
/// # Arguments
/// * `event` - What the subscription waits for
/// * `previous` - Last recorded classification, `None` before the first sample
/// * `inside` - Classification of the current sample
pub fn should_fire(event: GeofenceEvent, previous: Option<bool>, inside: bool) -> bool {
    match (event, previous) {
        (GeofenceEvent::AreaEntered, None) => inside,
        (GeofenceEvent::AreaLeft, None) => !inside,
        (GeofenceEvent::AreaEntered, Some(was_inside)) => !was_inside && inside,
        (GeofenceEvent::AreaLeft, Some(was_inside)) => was_inside && !inside,
    }
}

/// Evaluates one location sample against the cached subscriptions.
///
/// The device is modelled as a circle around `position` with the simulated
/// uncertainty radius. It counts as inside when `verify` answers TRUE or
/// PARTIAL. State is updated on every matching subscription, fired or not.
pub fn evaluate(
    subscriptions: &[SharedSubscription],
    device_instance_id: DeviceInstanceId,
    position: GeoPoint,
    now: Timestamp,
) -> Result<Vec<PendingNotification>, GeoError> {
    let radius = geo_verify::simulated_radius(position.latitude, position.longitude);
    let device = geo_verify::circle(position, radius)?;
    let mut pending = Vec::new();

    for shared in subscriptions {
        let mut tracked = shared.lock();
        if tracked.subscription.device_instance_id != device_instance_id
            || tracked.subscription.is_expired(now)
        {
            continue;
        }
        let (area, event) = match &tracked.subscription.kind {
            SubscriptionKind::Geofencing { area, event } => (area.clone(), *event),
            SubscriptionKind::DeviceStatus { .. } => continue,
        };

        let target = match geo_verify::area_shape(&area) {
            Ok(shape) => shape,
            Err(e) => {
                warn!(
                    "Subscription {} has an unusable area: {}",
                    tracked.subscription.id, e
                );
                continue;
            }
        };
        let inside = geo_verify::verify(&device, &target).is_inside();

        let previous = match tracked.state {
            MatchState::Geofence { inside } => inside,
            MatchState::DeviceStatus { .. } => None,
        };
        if should_fire(event, previous, inside) {
            debug!(
                "Subscription {} fires {:?} for device {}",
                tracked.subscription.id, event, device_instance_id
            );
            pending.push(PendingNotification {
                subscription: tracked.subscription.clone(),
                status: None,
            });
        }
        tracked.state = MatchState::Geofence {
            inside: Some(inside),
        };
    }

    Ok(pending)
}
