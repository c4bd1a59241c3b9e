//! Core runtime context trait for the simulation engine.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for time and task management.
///
/// Timeline players, the orchestrator and the subscription cache never touch
/// the runtime directly. They go through this trait so tests can drive them
/// with paused virtual time.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
#[async_trait]
pub trait NetSimContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for cache staleness and sleep bookkeeping.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for sample and run timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
