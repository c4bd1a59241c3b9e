//! Subscription matching: telemetry samples in, pending notifications out.
//!
//! ```text
//!   sample ──► SubscriptionCache::get_active(sim)
//!                     │
//!          ┌──────────┴───────────┐
//!          ▼                      ▼
//!   geofencing::evaluate   device_status::evaluate
//!          │                      │
//!          └──────────┬───────────┘
//!                     ▼
//!          Vec<PendingNotification> ──► NotificationDispatcher
//! ```
//!
//! Matchers are synchronous and side-effect free apart from the edge-detection
//! state stored on each [`TrackedSubscription`]. Delivery happens elsewhere.

pub mod cache;
pub mod device_status;
pub mod geofencing;

pub use cache::{MatchState, SharedSubscription, SubscriptionCache, TrackedSubscription};

use crate::model::DeviceStatus;
use crate::subscription::{NotificationEvent, Subscription};

/// A notification a matcher decided to fire.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNotification {
    pub subscription: Subscription,

    /// Device-status snapshot after the triggering sample was merged in.
    /// `None` for geofencing notifications.
    pub status: Option<DeviceStatus>,
}

impl PendingNotification {
    /// Carried by the subscription kind, so it always matches the family.
    pub fn event(&self) -> NotificationEvent {
        self.subscription.kind.event()
    }
}
