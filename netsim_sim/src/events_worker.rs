//! Events worker: runs the matchers over the telemetry-events topic and
//! delivers whatever they fire.

use crate::error::WorkerError;
use crate::telemetry::wall_clock;
use netsim_core::matching::{device_status, geofencing, PendingNotification, SubscriptionCache};
use netsim_core::model::SamplePayload;
use netsim_core::notify::NotificationDispatcher;
use netsim_core::protocol::{
    self, EventsMessage, SubscriptionOperation, TelemetryData, TelemetryEnvelope,
};
use netsim_core::subscription::GeoPoint;
use netsim_env::{EnvError, MessageBroker, NetSimContext, Topic};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct EventsWorker<Ctx: NetSimContext, B: MessageBroker> {
    ctx: Arc<Ctx>,
    broker: Arc<B>,
    cache: Arc<SubscriptionCache<Ctx>>,
    dispatcher: Arc<NotificationDispatcher<Ctx>>,
}

impl<Ctx: NetSimContext, B: MessageBroker> EventsWorker<Ctx, B> {
    pub fn new(
        ctx: Arc<Ctx>,
        broker: Arc<B>,
        cache: Arc<SubscriptionCache<Ctx>>,
        dispatcher: Arc<NotificationDispatcher<Ctx>>,
    ) -> Self {
        Self {
            ctx,
            broker,
            cache,
            dispatcher,
        }
    }

    /// Consumes telemetry events until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), EnvError> {
        let mut consumer = self.broker.consume(Topic::TelemetryEvents).await?;
        info!("Events worker consuming {}", Topic::TelemetryEvents);

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = consumer.recv() => delivery,
            };
            let Some(delivery) = delivery else { break };
            if let Err(e) = self.handle(&delivery.payload).await {
                warn!("Dropping event message: {}", e);
            }
        }
        Ok(())
    }

    /// Handles one message; returns the number of notifications delivered.
    pub async fn handle(&self, payload: &[u8]) -> Result<usize, WorkerError> {
        match protocol::decode::<EventsMessage>(payload)? {
            EventsMessage::Telemetry(envelope) => self.handle_telemetry(envelope).await,
            EventsMessage::Subscriptions(event) => {
                let count = event.subscriptions.len();
                match event.operation {
                    SubscriptionOperation::Add => {
                        for subscription in event.subscriptions {
                            self.cache.insert(subscription)?;
                        }
                    }
                    SubscriptionOperation::Delete => {
                        for subscription in &event.subscriptions {
                            self.cache.remove(subscription.id);
                        }
                    }
                }
                debug!("Applied {:?} of {} subscription(s)", event.operation, count);
                Ok(0)
            }
        }
    }

    async fn handle_telemetry(&self, envelope: TelemetryEnvelope) -> Result<usize, WorkerError> {
        let sample = match envelope.data {
            TelemetryData::Sample(sample) => sample,
            TelemetryData::SimulationEnded { .. } => {
                info!(
                    "Simulation {} run {} ended, dropping its subscription state",
                    envelope.simulation_id, envelope.simulation_instance_id
                );
                self.cache.evict(envelope.simulation_id);
                return Ok(0);
            }
        };

        let now = wall_clock(self.ctx.as_ref());
        let pending: Vec<PendingNotification> = match &sample.payload {
            SamplePayload::DeviceLocation {
                latitude,
                longitude,
            } => {
                let subscriptions = self.cache.get_active(envelope.simulation_id)?;
                geofencing::evaluate(
                    &subscriptions,
                    sample.device_instance_id,
                    GeoPoint::new(*latitude, *longitude),
                    now,
                )?
            }
            SamplePayload::DeviceStatus(status) => {
                let subscriptions = self.cache.get_active(envelope.simulation_id)?;
                device_status::evaluate(&subscriptions, sample.device_instance_id, status, now)
            }
            SamplePayload::SimSwap => Vec::new(),
        };

        let mut delivered = 0;
        for notification in &pending {
            match self.dispatcher.deliver(notification).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => error!(
                    "Could not record notification for subscription {}: {}",
                    notification.subscription.id, e
                ),
            }
        }
        Ok(delivered)
    }
}
