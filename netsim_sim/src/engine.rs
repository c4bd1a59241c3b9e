//! In-process deployment of every worker role.
//!
//! ```text
//!   Launcher ──START──► sim-control-work ──► Orchestrator ──► players
//!            ──STOP───► sim-control-broadcast ──┘                │
//!                                                                ▼
//!                        telemetry-persist ◄── samples ──► telemetry-events
//!                              │                                 │
//!                     PersistenceWorker                     EventsWorker ──► webhooks
//!
//!   CleanupSweep (timer) ──► closes overdue children
//! ```

use crate::cleanup::CleanupSweep;
use crate::config::EngineConfig;
use crate::events_worker::EventsWorker;
use crate::launcher::Launcher;
use crate::orchestrator::Orchestrator;
use crate::persistence_worker::PersistenceWorker;
use netsim_core::matching::SubscriptionCache;
use netsim_core::model::{ChildRun, DeviceInstance, RunId, SimulationRun};
use netsim_core::notify::{NotificationDispatcher, WebhookClient};
use netsim_core::routing::Router;
use netsim_core::storage::{Storage, StorageError};
use netsim_env::{MessageBroker, NetSimContext};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Final state of a run, printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: SimulationRun,
    pub children: Vec<ChildRun>,
    pub devices: Vec<DeviceInstance>,
}

/// Every worker role running on one runtime.
pub struct Engine<Ctx: NetSimContext, B: MessageBroker> {
    ctx: Arc<Ctx>,
    storage: Arc<dyn Storage>,
    launcher: Launcher<B>,
    shutdown: CancellationToken,
    finished: Vec<oneshot::Receiver<()>>,
}

impl<Ctx: NetSimContext, B: MessageBroker> Engine<Ctx, B> {
    /// Spawns the orchestrator, both telemetry consumers and the cleanup
    /// sweep. The broker topology must already be declared.
    pub fn start(
        ctx: Arc<Ctx>,
        broker: Arc<B>,
        storage: Arc<dyn Storage>,
        router: Arc<dyn Router>,
        client: Arc<dyn WebhookClient>,
        config: &EngineConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut finished = Vec::new();

        let orchestrator = Orchestrator::new(ctx.clone(), broker.clone(), storage.clone(), router);
        let orchestrator_id = orchestrator.id();
        let token = shutdown.clone();
        finished.push(spawn_role(ctx.as_ref(), "orchestrator", async move {
            if let Err(e) = orchestrator.run(token).await {
                error!("Orchestrator failed: {}", e);
            }
        }));

        let cache = Arc::new(SubscriptionCache::new(
            ctx.clone(),
            storage.clone(),
            config.cache_refresh,
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            ctx.clone(),
            storage.clone(),
            client,
            config.notification_source.clone(),
        ));
        let events = EventsWorker::new(ctx.clone(), broker.clone(), cache, dispatcher);
        let token = shutdown.clone();
        finished.push(spawn_role(ctx.as_ref(), "events-worker", async move {
            if let Err(e) = events.run(token).await {
                error!("Events worker failed: {}", e);
            }
        }));

        let persistence = PersistenceWorker::new(broker.clone(), storage.clone());
        let token = shutdown.clone();
        finished.push(spawn_role(ctx.as_ref(), "persistence-worker", async move {
            if let Err(e) = persistence.run(token).await {
                error!("Persistence worker failed: {}", e);
            }
        }));

        let sweep = CleanupSweep::new(
            ctx.clone(),
            broker.clone(),
            storage.clone(),
            config.cleanup_interval,
            config.cleanup_grace,
        );
        let token = shutdown.clone();
        finished.push(spawn_role(ctx.as_ref(), "cleanup-sweep", sweep.run(token)));

        info!(
            "Engine started with {} worker role(s), orchestrator {}",
            finished.len(),
            orchestrator_id
        );
        Self {
            ctx,
            launcher: Launcher::new(broker, storage.clone()),
            storage,
            shutdown,
            finished,
        }
    }

    pub fn launcher(&self) -> &Launcher<B> {
        &self.launcher
    }

    /// Polls storage until the run has an end timestamp.
    pub async fn wait_for_run(&self, run_id: RunId) -> Result<SimulationRun, StorageError> {
        loop {
            let run = self
                .storage
                .run(run_id)?
                .ok_or_else(|| StorageError::not_found(format!("run {}", run_id)))?;
            if run.is_finished() {
                return Ok(run);
            }
            self.ctx.sleep(Duration::from_millis(250)).await;
        }
    }

    pub fn summary(&self, run_id: RunId) -> Result<RunSummary, StorageError> {
        let run = self
            .storage
            .run(run_id)?
            .ok_or_else(|| StorageError::not_found(format!("run {}", run_id)))?;
        Ok(RunSummary {
            run,
            children: self.storage.children_of(run_id)?,
            devices: self.storage.device_instances_of(run_id)?,
        })
    }

    /// Stops every role and waits for them to exit. Players still running
    /// are cancelled and their children ended.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for done in self.finished {
            // A dropped sender means the task panicked; nothing left to wait for
            let _ = done.await;
        }
        info!("Engine stopped");
    }
}

fn spawn_role<Ctx, F>(ctx: &Ctx, name: &str, role: F) -> oneshot::Receiver<()>
where
    Ctx: NetSimContext,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    ctx.spawn(name, async move {
        role.await;
        let _ = tx.send(());
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::publish_subscription_event;
    use async_trait::async_trait;
    use netsim_core::model::{
        ChildSimulationSpec, DeviceProfile, ItineraryStop, LocationSchedule, NewSimulation,
        SimulationPayload,
    };
    use netsim_core::notify::{CloudEvent, DeliveryError};
    use netsim_core::protocol::{SubscriptionEvent, SubscriptionOperation};
    use netsim_core::routing::RoadNetwork;
    use netsim_core::storage::SledStorage;
    use netsim_core::subscription::{
        Area, GeoPoint, GeofenceEvent, Subscription, SubscriptionId, SubscriptionKind, Webhook,
    };
    use netsim_env::{LocalBroker, TokioContext};
    use parking_lot::Mutex;
    use serde_json::json;

    const ROUTE: [(f64, f64); 6] = [
        (32.67809867905849, -17.622633942472735),
        (32.77298854063671, -17.13037010791792),
        (32.44551578131866, -17.259338468442383),
        (32.69540592103866, -16.99218572668454),
        (32.73397576083184, -16.824103575407136),
        (32.316487028304884, -16.50248551307069),
    ];

    #[derive(Default)]
    struct RecordingClient {
        events: Mutex<Vec<CloudEvent>>,
    }

    #[async_trait]
    impl WebhookClient for RecordingClient {
        async fn post(&self, _webhook: &Webhook, event: &CloudEvent) -> Result<(), DeliveryError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    /// A chain road through the sample points, so routing yields them in order.
    fn madeira_roads() -> RoadNetwork {
        let nodes: Vec<_> = ROUTE
            .iter()
            .enumerate()
            .map(|(i, (lat, lon))| json!({"id": i + 1, "latitude": lat, "longitude": lon}))
            .collect();
        let edges: Vec<_> = (1..ROUTE.len())
            .map(|i| json!({"from": i, "to": i + 1}))
            .collect();
        RoadNetwork::from_json(&json!({"nodes": nodes, "edges": edges}).to_string()).unwrap()
    }

    fn geofence(run: &SimulationRun, device: &DeviceInstance, event: GeofenceEvent) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            simulation_id: run.simulation_id,
            run_id: Some(run.id),
            device_instance_id: device.id,
            webhook: Webhook {
                notification_url: "http://subscriber.test/geofencing".into(),
                notification_auth_token: Some("secret".into()),
            },
            expire_time: None,
            kind: SubscriptionKind::Geofencing {
                area: Area::Circle {
                    center: GeoPoint::new(32.74513588903821, -17.0078912128889),
                    radius: 22840.0,
                },
                event,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_run_drives_geofence_notifications() {
        let ctx = TokioContext::shared();
        let broker = LocalBroker::with_topology().await.unwrap();
        let storage = Arc::new(SledStorage::open_temp().unwrap());
        let client = Arc::new(RecordingClient::default());

        let simulation = storage
            .insert_simulation(NewSimulation {
                name: "madeira".into(),
                description: "coast drive".into(),
                payload: SimulationPayload {
                    devices: vec![DeviceProfile {
                        id: "UE1".into(),
                        phone_number: Some("+351910000001".into()),
                        network_access_identifier: None,
                        ipv4_address: None,
                        ipv6_address: None,
                    }],
                    mec_platforms: vec![],
                    child_simulations: vec![ChildSimulationSpec::DeviceLocation(
                        LocationSchedule {
                            devices: vec!["UE1".into()],
                            duration: 10,
                            itinerary: [ROUTE[0], ROUTE[5]]
                                .iter()
                                .map(|(latitude, longitude)| ItineraryStop {
                                    label: String::new(),
                                    latitude: *latitude,
                                    longitude: *longitude,
                                })
                                .collect(),
                        },
                    )],
                },
            })
            .unwrap();

        // Launch and subscribe before any role consumes, so no sample races the subscriptions
        let launcher = Launcher::new(broker.clone(), storage.clone());
        let (run, _) = launcher.start_simulation(simulation.id).await.unwrap();
        let device = storage.device_instances_of(run.id).unwrap().remove(0);
        let subscriptions = vec![
            geofence(&run, &device, GeofenceEvent::AreaEntered),
            geofence(&run, &device, GeofenceEvent::AreaLeft),
        ];
        for subscription in &subscriptions {
            storage.insert_subscription(subscription).unwrap();
        }
        publish_subscription_event(
            broker.as_ref(),
            SubscriptionEvent {
                operation: SubscriptionOperation::Add,
                subscriptions: subscriptions.clone(),
            },
        )
        .await
        .unwrap();

        let engine = Engine::start(
            ctx,
            broker,
            storage.clone(),
            Arc::new(madeira_roads()),
            client.clone(),
            &EngineConfig::default(),
        );
        let finished = engine.wait_for_run(run.id).await.unwrap();
        assert!(finished.end_timestamp.is_some());

        tokio::time::timeout(Duration::from_secs(30), async {
            while client.events.lock().len() < 5 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .unwrap();

        let types: Vec<String> = client.events.lock().iter().map(|e| e.event_type.clone()).collect();
        let entered = "org.camaraproject.geofencing.v0.area-entered";
        let left = "org.camaraproject.geofencing.v0.area-left";
        assert_eq!(types, vec![left, entered, left, entered, left]);
        assert_eq!(
            client.events.lock()[0].data["device"]["phoneNumber"],
            "+351910000001"
        );

        let audited: usize = subscriptions
            .iter()
            .map(|s| storage.notifications_for(s.id).unwrap().len())
            .sum();
        assert_eq!(audited, 5);

        let summary = engine.summary(run.id).unwrap();
        assert_eq!(summary.children.len(), 1);
        assert!(summary.children[0].is_finished());
        assert_eq!(summary.devices.len(), 1);

        engine.shutdown().await;
    }
}
