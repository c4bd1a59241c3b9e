//! Timeline players.
//!
//! A player drives one device through one child run:
//!
//! ```text
//!   RUNNING ──(schedule exhausted)──────────────► STOPPED
//!      │                                             ▲
//!      └──(token cancelled)──► STOPPING ──(close)────┘
//! ```
//!
//! The schedule itself is a [`Timeline`]: a lazy, finite sequence of
//! `(delay, payload)` steps. The player sleeps each delay, emits the payload
//! and moves on. Cancellation interrupts a sleep immediately.

pub mod location;
pub mod sim_swap;
pub mod status;

pub use location::LocationTimeline;
pub use sim_swap::SimSwapTimeline;
pub use status::StatusTimeline;

use crate::error::OrchestratorError;
use crate::telemetry::{wall_clock, SamplePublisher};
use netsim_core::model::{ChildRunConfig, ChildSimulationSpec, DeviceInstanceId, SamplePayload};
use netsim_core::routing::Router;
use netsim_core::subscription::GeoPoint;
use netsim_env::NetSimContext;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One scheduled emission.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Time to wait after the previous step
    pub delay: Duration,
    pub payload: SamplePayload,
}

/// Finite schedule of samples for one device.
pub trait Timeline: Send {
    /// Returns the next step, `None` once the schedule is exhausted.
    fn next_step(&mut self) -> Option<Step>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Running,
    Stopping,
    Stopped,
}

/// Summary of a finished player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerOutcome {
    pub device: DeviceInstanceId,
    pub emitted: usize,

    /// True when the player was stopped before its schedule ran out
    pub cancelled: bool,
}

/// Plays a timeline until it is exhausted or `token` is cancelled, then
/// closes the publisher.
pub async fn run_player<Ctx: NetSimContext>(
    ctx: &Ctx,
    mut publisher: SamplePublisher,
    mut timeline: Box<dyn Timeline>,
    device: DeviceInstanceId,
    token: CancellationToken,
) -> PlayerOutcome {
    let mut state = PlayerState::Running;

    while state == PlayerState::Running {
        let Some(step) = timeline.next_step() else {
            state = PlayerState::Stopped;
            break;
        };

        if !step.delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => {
                    state = PlayerState::Stopping;
                    continue;
                }
                _ = ctx.sleep(step.delay) => {}
            }
        }
        if token.is_cancelled() {
            state = PlayerState::Stopping;
            continue;
        }

        if let Err(e) = publisher.emit(step.payload, wall_clock(ctx)).await {
            warn!("Device {} failed to publish a sample: {}", device, e);
            state = PlayerState::Stopping;
        }
    }

    let cancelled = state == PlayerState::Stopping;
    let emitted = publisher.published();
    if let Err(e) = publisher.close().await {
        warn!("Device {} failed to close its channel: {}", device, e);
    }
    debug!(
        "Player for device {} stopped after {} sample(s){}",
        device,
        emitted,
        if cancelled { " (cancelled)" } else { "" }
    );

    PlayerOutcome {
        device,
        emitted,
        cancelled,
    }
}

/// Builds one timeline per device of a child run.
///
/// Location children are routed once; every device follows the same
/// polyline.
pub fn build_timelines(
    config: &ChildRunConfig,
    router: &dyn Router,
) -> Result<Vec<(DeviceInstanceId, Box<dyn Timeline>)>, OrchestratorError> {
    if config.devices.len() != config.spec.device_keys().len() {
        return Err(OrchestratorError::InvalidConfig(format!(
            "{} device instance(s) for {} device key(s)",
            config.devices.len(),
            config.spec.device_keys().len()
        )));
    }

    let timelines = match &config.spec {
        ChildSimulationSpec::DeviceLocation(schedule) => {
            let waypoints: Vec<GeoPoint> = schedule
                .itinerary
                .iter()
                .map(|stop| GeoPoint::new(stop.latitude, stop.longitude))
                .collect();
            let polyline = router.route(&waypoints)?;
            let duration = Duration::from_secs(schedule.duration);
            config
                .devices
                .iter()
                .map(|d| {
                    let timeline: Box<dyn Timeline> =
                        Box::new(LocationTimeline::new(polyline.clone(), duration));
                    (*d, timeline)
                })
                .collect()
        }
        ChildSimulationSpec::DeviceStatus(schedule) => config
            .devices
            .iter()
            .map(|d| {
                let timeline: Box<dyn Timeline> = Box::new(StatusTimeline::new(schedule));
                (*d, timeline)
            })
            .collect(),
        ChildSimulationSpec::SimSwap(schedule) => config
            .devices
            .iter()
            .map(|d| {
                let timeline: Box<dyn Timeline> = Box::new(SimSwapTimeline::new(schedule));
                (*d, timeline)
            })
            .collect(),
    };
    Ok(timelines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ChildRef;
    use netsim_core::model::{ChildRunId, RunId, SimulationId, SimulationType};
    use netsim_core::protocol::{decode, EventsMessage, TelemetryData};
    use netsim_env::{LocalBroker, MessageBroker, TokioContext, Topic};
    use tokio::time::Instant;

    /// Fixed delays, one SIM swap per step.
    struct Fixed(Vec<u64>);

    impl Timeline for Fixed {
        fn next_step(&mut self) -> Option<Step> {
            if self.0.is_empty() {
                return None;
            }
            Some(Step {
                delay: Duration::from_secs(self.0.remove(0)),
                payload: SamplePayload::SimSwap,
            })
        }
    }

    fn child() -> ChildRef {
        ChildRef {
            simulation_id: SimulationId(1),
            run_id: RunId(2),
            child_id: ChildRunId(3),
            simulation_type: SimulationType::SimSwap,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_emits_on_schedule_to_both_topics() {
        let ctx = TokioContext::new();
        let broker = LocalBroker::with_topology().await.unwrap();
        let mut persist = broker.consume(Topic::TelemetryPersist).await.unwrap();
        let mut events = broker.consume(Topic::TelemetryEvents).await.unwrap();

        let publisher = SamplePublisher::open(broker.as_ref(), child(), DeviceInstanceId(9))
            .await
            .unwrap();
        let start = Instant::now();
        let outcome = run_player(
            &ctx,
            publisher,
            Box::new(Fixed(vec![0, 2, 3])),
            DeviceInstanceId(9),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.emitted, 3);
        assert!(!outcome.cancelled);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(broker.open_channel_count(), 0);

        for _ in 0..3 {
            let delivery = persist.recv().await.unwrap();
            match decode::<EventsMessage>(&delivery.payload).unwrap() {
                EventsMessage::Telemetry(envelope) => {
                    assert_eq!(envelope.child_simulation_instance_id, ChildRunId(3));
                    assert!(matches!(envelope.data, TelemetryData::Sample(_)));
                }
                other => panic!("unexpected message {:?}", other),
            }
            assert!(events.recv().await.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let ctx = std::sync::Arc::new(TokioContext::new());
        let broker = LocalBroker::with_topology().await.unwrap();
        let token = CancellationToken::new();

        let publisher = SamplePublisher::open(broker.as_ref(), child(), DeviceInstanceId(9))
            .await
            .unwrap();
        let handle = tokio::spawn({
            let ctx = ctx.clone();
            let token = token.clone();
            async move {
                run_player(
                    ctx.as_ref(),
                    publisher,
                    Box::new(Fixed(vec![0, 60, 60])),
                    DeviceInstanceId(9),
                    token,
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stopped_at = Instant::now();
        token.cancel();
        let outcome = handle.await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.emitted, 1);
        assert_eq!(stopped_at.elapsed(), Duration::ZERO);
        assert_eq!(broker.open_channel_count(), 0);
    }
}
