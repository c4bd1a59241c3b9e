//! Bounded-staleness cache of active subscriptions per simulation.
//!
//! Each simulation's list is an `Arc<Vec<..>>` swapped wholesale on refresh,
//! so a matcher holding the previous list keeps a consistent view. Entries
//! already cached survive every refresh together with their edge-detection
//! state; only unseen subscription ids are appended.

use crate::model::{DeviceStatus, SimulationId, Timestamp};
use crate::storage::{Storage, StorageError};
use crate::subscription::{Subscription, SubscriptionId, SubscriptionKind};
use netsim_env::NetSimContext;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default staleness bound.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Last observed state a matcher compares the next sample against.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchState {
    /// `None` until the first location sample is classified.
    Geofence { inside: Option<bool> },
    DeviceStatus { current: DeviceStatus },
}

/// A cached subscription plus its transient matcher state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedSubscription {
    pub subscription: Subscription,
    pub state: MatchState,
}

impl TrackedSubscription {
    /// Wraps a subscription with empty state.
    pub fn new(subscription: Subscription) -> Self {
        Self::with_status(subscription, DeviceStatus::default())
    }

    /// Wraps a subscription, seeding device-status state with `current`.
    pub fn with_status(subscription: Subscription, current: DeviceStatus) -> Self {
        let state = match subscription.kind {
            SubscriptionKind::Geofencing { .. } => MatchState::Geofence { inside: None },
            SubscriptionKind::DeviceStatus { .. } => MatchState::DeviceStatus { current },
        };
        Self {
            subscription,
            state,
        }
    }
}

pub type SharedSubscription = Arc<Mutex<TrackedSubscription>>;

struct CacheEntry {
    refreshed_at: Duration,
    subscriptions: Arc<Vec<SharedSubscription>>,
}

/// Read-through subscription cache shared by both matchers.
pub struct SubscriptionCache<Ctx: NetSimContext> {
    ctx: Arc<Ctx>,
    storage: Arc<dyn Storage>,
    refresh_interval: Duration,
    entries: Mutex<HashMap<SimulationId, CacheEntry>>,
}

impl<Ctx: NetSimContext> SubscriptionCache<Ctx> {
    pub fn new(ctx: Arc<Ctx>, storage: Arc<dyn Storage>, refresh_interval: Duration) -> Self {
        Self {
            ctx,
            storage,
            refresh_interval,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn wall_clock(&self) -> Timestamp {
        Timestamp::from(self.ctx.system_time())
    }

    /// Active subscriptions of a simulation.
    ///
    /// Reloads from storage when the simulation was never loaded or its last
    /// refresh is older than the refresh interval.
    ///
    /// # Returns
    /// * `Ok(list)` - Snapshot of the cached list
    /// * `Err(StorageError)` - Storage read failed (cache left untouched)
    pub fn get_active(
        &self,
        simulation_id: SimulationId,
    ) -> Result<Arc<Vec<SharedSubscription>>, StorageError> {
        let now = self.ctx.now();
        let known: HashSet<SubscriptionId> = {
            let entries = self.entries.lock();
            match entries.get(&simulation_id) {
                Some(entry) if now.saturating_sub(entry.refreshed_at) < self.refresh_interval => {
                    return Ok(entry.subscriptions.clone());
                }
                Some(entry) => entry
                    .subscriptions
                    .iter()
                    .map(|s| s.lock().subscription.id)
                    .collect(),
                None => HashSet::new(),
            }
        };

        // Storage reads happen outside the lock
        let loaded = self.storage.active_subscriptions(simulation_id, self.wall_clock())?;
        let mut fresh = Vec::new();
        for subscription in loaded.into_iter().filter(|s| !known.contains(&s.id)) {
            fresh.push(self.track(subscription)?);
        }

        let mut entries = self.entries.lock();
        let mut merged: Vec<SharedSubscription> = entries
            .get(&simulation_id)
            .map(|e| e.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        let present: HashSet<SubscriptionId> =
            merged.iter().map(|s| s.lock().subscription.id).collect();
        let mut added = 0;
        for tracked in fresh {
            if !present.contains(&tracked.subscription.id) {
                merged.push(Arc::new(Mutex::new(tracked)));
                added += 1;
            }
        }

        if added > 0 {
            info!(
                "Loaded {} new subscription(s) for simulation {}",
                added, simulation_id
            );
        }

        let subscriptions = Arc::new(merged);
        entries.insert(
            simulation_id,
            CacheEntry {
                refreshed_at: now,
                subscriptions: subscriptions.clone(),
            },
        );
        Ok(subscriptions)
    }

    /// Adds a subscription announced by the API layer.
    ///
    /// Only simulations already cached are touched; others pick it up on
    /// their first load.
    pub fn insert(&self, subscription: Subscription) -> Result<(), StorageError> {
        let simulation_id = subscription.simulation_id;
        if !self.entries.lock().contains_key(&simulation_id) {
            return Ok(());
        }
        let tracked = self.track(subscription)?;

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&simulation_id) {
            let exists = entry
                .subscriptions
                .iter()
                .any(|s| s.lock().subscription.id == tracked.subscription.id);
            if !exists {
                let mut next: Vec<SharedSubscription> = entry.subscriptions.iter().cloned().collect();
                next.push(Arc::new(Mutex::new(tracked)));
                entry.subscriptions = Arc::new(next);
            }
        }
        Ok(())
    }

    /// Drops a deleted subscription from every cached list.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for entry in self.entries.lock().values_mut() {
            let before = entry.subscriptions.len();
            let next: Vec<SharedSubscription> = entry
                .subscriptions
                .iter()
                .filter(|s| s.lock().subscription.id != id)
                .cloned()
                .collect();
            if next.len() != before {
                entry.subscriptions = Arc::new(next);
                removed = true;
            }
        }
        removed
    }

    /// Forgets a simulation and all matcher state attached to it.
    pub fn evict(&self, simulation_id: SimulationId) {
        if self.entries.lock().remove(&simulation_id).is_some() {
            debug!("Evicted cached subscriptions of simulation {}", simulation_id);
        }
    }

    /// Number of simulations currently cached.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn track(&self, subscription: Subscription) -> Result<TrackedSubscription, StorageError> {
        match subscription.kind {
            SubscriptionKind::DeviceStatus { .. } => {
                let current = self
                    .storage
                    .latest_device_status(subscription.device_instance_id)?
                    .unwrap_or_default();
                Ok(TrackedSubscription::with_status(subscription, current))
            }
            SubscriptionKind::Geofencing { .. } => Ok(TrackedSubscription::new(subscription)),
        }
    }
}
