//! NetSim Core - Simulation & Event-Notification Domain Library
//!
//! Everything the worker roles share, none of which touches the runtime:
//! 1. **Geo-Verification**: UTM projection, circle/polygon shapes, TRUE/PARTIAL/FALSE containment
//! 2. **Protocol**: control, telemetry and subscription-event message schemas
//! 3. **Storage**: the storage seam plus a sled-backed implementation
//! 4. **Matching**: subscription cache and edge-triggered geofencing/device-status matchers
//! 5. **Notify**: CloudEvents rendering and webhook delivery

pub mod geo_verify;
pub mod location;
pub mod matching;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod routing;
pub mod storage;
pub mod subscription;

// Re-export key types for convenience
pub use geo_verify::{GeoError, VerificationResult};
pub use matching::{PendingNotification, SubscriptionCache};
pub use notify::{NotificationDispatcher, ReqwestWebhookClient, WebhookClient};
pub use routing::{RoadNetwork, Router, RoutingError};
pub use storage::{SledStorage, Storage, StorageError};
