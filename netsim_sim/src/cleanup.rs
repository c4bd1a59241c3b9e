//! Missed-stop sweep.
//!
//! A child whose players died with their orchestrator never gets its end
//! timestamp. The sweep closes every started child that outlived its
//! duration plus a grace period, and announces runs it completes.

use crate::error::WorkerError;
use crate::telemetry::{publish_simulation_ended, wall_clock, ChildRef};
use netsim_core::storage::Storage;
use netsim_env::{MessageBroker, NetSimContext};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct CleanupSweep<Ctx: NetSimContext, B: MessageBroker> {
    ctx: Arc<Ctx>,
    broker: Arc<B>,
    storage: Arc<dyn Storage>,
    interval: Duration,
    grace: Duration,
}

impl<Ctx: NetSimContext, B: MessageBroker> CleanupSweep<Ctx, B> {
    pub fn new(
        ctx: Arc<Ctx>,
        broker: Arc<B>,
        storage: Arc<dyn Storage>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            ctx,
            broker,
            storage,
            interval,
            grace,
        }
    }

    /// Sweeps every `interval` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Cleanup sweep every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.ctx.sleep(self.interval) => {}
            }
            if let Err(e) = self.sweep_once().await {
                error!("Cleanup sweep failed: {}", e);
            }
        }
    }

    /// Closes overdue children. Returns how many this pass ended.
    pub async fn sweep_once(&self) -> Result<usize, WorkerError> {
        let now = wall_clock(self.ctx.as_ref());
        let grace = chrono::Duration::seconds(self.grace.as_secs() as i64);
        let mut closed = 0;

        for child in self.storage.unfinished_children()? {
            // Never started: its START is still queued somewhere
            let Some(started) = child.start_timestamp else {
                continue;
            };
            let deadline = started + chrono::Duration::seconds(child.duration_seconds as i64) + grace;
            if deadline > now {
                continue;
            }

            let end = self.storage.mark_child_ended(child.id, now)?;
            if end.newly_ended {
                closed += 1;
                warn!(
                    "Child run {} of run {} was not stopped, closing it",
                    child.id, child.run_id
                );
            }
            if end.run_completed {
                publish_simulation_ended(self.broker.as_ref(), ChildRef::of(&child), now).await?;
            }
        }

        if closed == 0 {
            debug!("All simulations correctly stopped");
        } else {
            info!("Closed {} overdue child run(s)", closed);
        }
        Ok(closed)
    }
}
