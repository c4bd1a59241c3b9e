//! Publishing side of the telemetry topics.

use chrono::{DateTime, Utc};
use netsim_core::model::{
    ChildRun, ChildRunId, DeviceInstanceId, RunId, SamplePayload, SimulationId, SimulationType,
    Timestamp,
};
use netsim_core::protocol::{
    self, DeviceSample, EventsMessage, SubscriptionEvent, TelemetryData, TelemetryEnvelope,
};
use netsim_env::{EnvError, MessageBroker, NetSimContext, PublishChannel, Topic};
use tracing::debug;

use crate::error::WorkerError;

/// Identity of the child run a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub simulation_id: SimulationId,
    pub run_id: RunId,
    pub child_id: ChildRunId,
    pub simulation_type: SimulationType,
}

impl ChildRef {
    pub fn of(child: &ChildRun) -> Self {
        Self {
            simulation_id: child.simulation_id,
            run_id: child.run_id,
            child_id: child.id,
            simulation_type: child.simulation_type,
        }
    }

    /// Wraps `data` in the telemetry envelope of this child.
    pub fn envelope(&self, data: TelemetryData) -> EventsMessage {
        EventsMessage::Telemetry(TelemetryEnvelope {
            simulation_id: self.simulation_id,
            simulation_instance_id: self.run_id,
            child_simulation_instance_id: self.child_id,
            simulation_type: self.simulation_type,
            data,
        })
    }
}

/// Wall-clock timestamp of the context.
pub fn wall_clock<Ctx: NetSimContext>(ctx: &Ctx) -> Timestamp {
    DateTime::<Utc>::from(ctx.system_time())
}

/// A player's own channel, bound to one device of one child run.
pub struct SamplePublisher {
    channel: Box<dyn PublishChannel>,
    child: ChildRef,
    device: DeviceInstanceId,
    published: usize,
}

impl SamplePublisher {
    /// Opens a dedicated channel for one device.
    pub async fn open<B: MessageBroker>(
        broker: &B,
        child: ChildRef,
        device: DeviceInstanceId,
    ) -> Result<Self, EnvError> {
        Ok(Self {
            channel: broker.open_channel().await?,
            child,
            device,
            published: 0,
        })
    }

    /// Publishes one sample to both the persistence and the events topic.
    pub async fn emit(&mut self, payload: SamplePayload, timestamp: Timestamp) -> Result<(), WorkerError> {
        let message = self.child.envelope(TelemetryData::Sample(DeviceSample {
            device_instance_id: self.device,
            timestamp,
            payload,
        }));
        let body = protocol::encode(&message)?;
        self.channel.publish(Topic::TelemetryPersist, body.clone()).await?;
        self.channel.publish(Topic::TelemetryEvents, body).await?;
        self.published += 1;
        Ok(())
    }

    /// Number of samples published so far.
    pub fn published(&self) -> usize {
        self.published
    }

    pub async fn close(mut self) -> Result<(), EnvError> {
        self.channel.close().await
    }
}

/// Publishes the "simulation ended" marker for a closed run.
pub async fn publish_simulation_ended<B: MessageBroker>(
    broker: &B,
    child: ChildRef,
    ended_at: Timestamp,
) -> Result<(), WorkerError> {
    let message = child.envelope(TelemetryData::SimulationEnded { ended_at });
    let body = protocol::encode(&message)?;

    let mut channel = broker.open_channel().await?;
    let published = channel.publish(Topic::TelemetryEvents, body).await;
    channel.close().await?;
    published?;

    debug!(
        "Published end marker for run {} of simulation {}",
        child.run_id, child.simulation_id
    );
    Ok(())
}

/// Announces created or deleted subscriptions to the events workers.
pub async fn publish_subscription_event<B: MessageBroker>(
    broker: &B,
    event: SubscriptionEvent,
) -> Result<(), WorkerError> {
    let body = protocol::encode(&EventsMessage::Subscriptions(event))?;
    let mut channel = broker.open_channel().await?;
    let published = channel.publish(Topic::TelemetryEvents, body).await;
    channel.close().await?;
    published?;
    Ok(())
}
