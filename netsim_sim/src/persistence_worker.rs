//! Persistence worker: writes every sample on the telemetry-persist topic.

use crate::error::WorkerError;
use netsim_core::model::SamplePayload;
use netsim_core::protocol::{self, EventsMessage};
use netsim_core::storage::Storage;
use netsim_env::{EnvError, MessageBroker, Topic};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PersistenceWorker<B: MessageBroker> {
    broker: Arc<B>,
    storage: Arc<dyn Storage>,
}

impl<B: MessageBroker> PersistenceWorker<B> {
    pub fn new(broker: Arc<B>, storage: Arc<dyn Storage>) -> Self {
        Self { broker, storage }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), EnvError> {
        let mut consumer = self.broker.consume(Topic::TelemetryPersist).await?;
        info!("Persistence worker consuming {}", Topic::TelemetryPersist);

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = consumer.recv() => delivery,
            };
            let Some(delivery) = delivery else { break };
            if let Err(e) = self.handle(&delivery.payload) {
                warn!("Sample not persisted: {}", e);
            }
        }
        Ok(())
    }

    /// Stores one sample. Returns `false` for messages that carry none.
    ///
    /// Status updates are partial, so they are merged over the device's last
    /// known status and stored as a full snapshot.
    pub fn handle(&self, payload: &[u8]) -> Result<bool, WorkerError> {
        let EventsMessage::Telemetry(envelope) = protocol::decode::<EventsMessage>(payload)? else {
            return Ok(false);
        };
        let Some(mut sample) = envelope.to_sample() else {
            return Ok(false);
        };

        if let SamplePayload::DeviceStatus(update) = &sample.payload {
            let mut merged = self
                .storage
                .latest_device_status(sample.device_instance_id)?
                .unwrap_or_default();
            merged.merge(update);
            sample.payload = SamplePayload::DeviceStatus(merged);
        }

        self.storage.append_sample(&sample)?;
        debug!(
            "Stored {} sample of device {}",
            sample.payload.simulation_type(),
            sample.device_instance_id
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ChildRef;
    use netsim_core::model::{
        ChildRunId, ConnectivityStatus, DeviceInstanceId, DeviceStatus, RunId, SimulationId,
        SimulationType,
    };
    use netsim_core::protocol::{DeviceSample, TelemetryData};
    use netsim_core::storage::SledStorage;
    use netsim_env::LocalBroker;

    fn child() -> ChildRef {
        ChildRef {
            simulation_id: SimulationId(1),
            run_id: RunId(1),
            child_id: ChildRunId(2),
            simulation_type: SimulationType::DeviceStatus,
        }
    }

    fn status(status: DeviceStatus) -> Vec<u8> {
        protocol::encode(&child().envelope(TelemetryData::Sample(DeviceSample {
            device_instance_id: DeviceInstanceId(7),
            timestamp: chrono::Utc::now(),
            payload: SamplePayload::DeviceStatus(status),
        })))
        .unwrap()
    }

    async fn worker() -> (Arc<SledStorage>, PersistenceWorker<LocalBroker>) {
        let storage = Arc::new(SledStorage::open_temp().unwrap());
        let broker = LocalBroker::with_topology().await.unwrap();
        (storage.clone(), PersistenceWorker::new(broker, storage))
    }

    #[tokio::test]
    async fn test_partial_status_is_stored_as_snapshot() {
        let (storage, worker) = worker().await;

        assert!(worker
            .handle(&status(DeviceStatus {
                connectivity_status: Some(ConnectivityStatus::ConnectedData),
                roaming: Some(false),
                ..Default::default()
            }))
            .unwrap());
        assert!(worker
            .handle(&status(DeviceStatus {
                roaming: Some(true),
                country_code: Some(214),
                ..Default::default()
            }))
            .unwrap());

        let latest = storage.latest_device_status(DeviceInstanceId(7)).unwrap().unwrap();
        assert_eq!(latest.connectivity_status, Some(ConnectivityStatus::ConnectedData));
        assert_eq!(latest.roaming, Some(true));
        assert_eq!(latest.country_code, Some(214));
    }

    #[tokio::test]
    async fn test_location_sample_is_stored_verbatim() {
        let (storage, worker) = worker().await;
        let message = protocol::encode(&child().envelope(TelemetryData::Sample(DeviceSample {
            device_instance_id: DeviceInstanceId(7),
            timestamp: chrono::Utc::now(),
            payload: SamplePayload::DeviceLocation {
                latitude: 38.7223,
                longitude: -9.1393,
            },
        })))
        .unwrap();

        assert!(worker.handle(&message).unwrap());
        let stored = storage
            .latest_sample(DeviceInstanceId(7), SimulationType::DeviceLocation)
            .unwrap()
            .unwrap();
        assert_eq!(stored.run_instance_id, RunId(1));
        assert_eq!(stored.child_instance_id, ChildRunId(2));
        assert!(matches!(
            stored.payload,
            SamplePayload::DeviceLocation { latitude, .. } if latitude == 38.7223
        ));
    }

    #[tokio::test]
    async fn test_end_marker_and_garbage_are_not_stored() {
        let (storage, worker) = worker().await;
        let ended = protocol::encode(&child().envelope(TelemetryData::SimulationEnded {
            ended_at: chrono::Utc::now(),
        }))
        .unwrap();

        assert!(!worker.handle(&ended).unwrap());
        assert!(worker.handle(b"not json").is_err());
        assert!(storage.latest_device_status(DeviceInstanceId(7)).unwrap().is_none());
    }
}
