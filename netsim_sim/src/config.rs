//! Engine configuration.

use netsim_core::matching::cache::DEFAULT_REFRESH_INTERVAL;
use netsim_core::notify::DEFAULT_WEBHOOK_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables shared by every worker role.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Staleness bound of the subscription cache
    pub cache_refresh: Duration,

    /// Per-request timeout of webhook deliveries
    pub webhook_timeout: Duration,

    /// `source` attribute of emitted CloudEvents
    pub notification_source: String,

    /// How often the missed-stop sweep runs
    pub cleanup_interval: Duration,

    /// Extra time a child gets past its duration before the sweep ends it
    pub cleanup_grace: Duration,

    /// Sled database directory; temporary database when `None`
    pub storage_path: Option<PathBuf>,

    /// Road-network JSON used by location players
    pub road_network_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_refresh: DEFAULT_REFRESH_INTERVAL,
            webhook_timeout: DEFAULT_WEBHOOK_TIMEOUT,
            notification_source: "netsim".to_string(),
            cleanup_interval: Duration::from_secs(60),
            cleanup_grace: Duration::from_secs(30),
            storage_path: None,
            road_network_path: None,
        }
    }
}
