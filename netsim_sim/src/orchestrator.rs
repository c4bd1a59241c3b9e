//! Simulation orchestrator.
//!
//! Consumes START/STOP commands, spawns one timeline player per device of a
//! child run and tracks how many are still alive. When the last player of a
//! child finishes, for whatever reason, the child is finalized exactly once:
//!
//! ```text
//!   START ──► mark_child_started ──► spawn N players ──┐
//!                                                      │ each player exits
//!   STOP ───► cancel token ──► wait for done ◄──┐      ▼
//!                                               │  remaining -= 1
//!                                               │      │ == 0
//!                                               └── finalize: mark_child_ended
//!                                                          └─ run closed? ──► end marker
//! ```

use crate::error::OrchestratorError;
use crate::players::{build_timelines, run_player};
use crate::telemetry::{publish_simulation_ended, wall_clock, ChildRef, SamplePublisher};
use netsim_core::model::ChildRunId;
use netsim_core::protocol::{self, ControlAction, ControlMessage};
use netsim_core::routing::Router;
use netsim_core::storage::Storage;
use netsim_env::{MessageBroker, NetSimContext, Topic, WorkerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Players of one child run owned by this orchestrator.
struct ActiveChild {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Live-player counter of one child run.
struct Completion {
    child: ChildRef,
    remaining: AtomicUsize,
    done: watch::Sender<bool>,
}

/// Orchestrator worker role.
pub struct Orchestrator<Ctx: NetSimContext, B: MessageBroker> {
    id: WorkerId,
    ctx: Arc<Ctx>,
    broker: Arc<B>,
    storage: Arc<dyn Storage>,
    router: Arc<dyn Router>,
    active: Arc<Mutex<HashMap<ChildRunId, ActiveChild>>>,
}

impl<Ctx: NetSimContext, B: MessageBroker> Clone for Orchestrator<Ctx, B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            ctx: self.ctx.clone(),
            broker: self.broker.clone(),
            storage: self.storage.clone(),
            router: self.router.clone(),
            active: self.active.clone(),
        }
    }
}

impl<Ctx: NetSimContext, B: MessageBroker> Orchestrator<Ctx, B> {
    pub fn new(
        ctx: Arc<Ctx>,
        broker: Arc<B>,
        storage: Arc<dyn Storage>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self {
            id: WorkerId::new(),
            ctx,
            broker,
            storage,
            router,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Number of child runs with live players.
    pub fn active_children(&self) -> usize {
        self.active.lock().len()
    }

    /// Consumes both control topics until `shutdown` fires, then stops every
    /// child it still owns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), OrchestratorError> {
        let mut work = self.broker.consume(Topic::ControlWork).await?;
        let mut broadcast = self.broker.consume(Topic::ControlBroadcast).await?;
        info!("Orchestrator {} consuming control topics", self.id);

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = work.recv() => delivery,
                delivery = broadcast.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                warn!("Control topic torn down, orchestrator {} exiting", self.id);
                break;
            };
            if let Err(e) = self.handle(&delivery.payload).await {
                warn!("Control message on {} dropped: {}", delivery.topic, e);
            }
        }

        self.stop_all().await;
        info!("Orchestrator {} stopped", self.id);
        Ok(())
    }

    /// Handles one raw control message.
    pub async fn handle(&self, payload: &[u8]) -> Result<(), OrchestratorError> {
        let message: ControlMessage = protocol::decode(payload)?;
        match message.action {
            ControlAction::Start => self.handle_start(message).await,
            ControlAction::Stop => self.handle_stop(&message).await,
        }
    }

    async fn handle_start(&self, message: ControlMessage) -> Result<(), OrchestratorError> {
        let child_id = message.child_simulation_instance_id;
        let config = message
            .simulation_config
            .ok_or(OrchestratorError::MissingConfig(child_id.0))?;

        let Some(child) = self.storage.child_run(child_id)? else {
            warn!("START for unknown child run {}, ignoring", child_id);
            return Ok(());
        };
        if child.is_finished() {
            warn!("START for finished child run {}, ignoring", child_id);
            return Ok(());
        }
        if self.active.lock().contains_key(&child_id) {
            warn!("Child run {} is already playing, ignoring START", child_id);
            return Ok(());
        }

        let child = self
            .storage
            .mark_child_started(child_id, wall_clock(self.ctx.as_ref()))?;
        let child_ref = ChildRef::of(&child);

        let timelines = match build_timelines(&config, self.router.as_ref()) {
            Ok(timelines) => timelines,
            Err(e) => {
                error!("Child run {} cannot be played: {}", child_id, e);
                self.finalize(child_ref).await;
                return Err(e);
            }
        };
        if timelines.is_empty() {
            info!("Child run {} has no devices", child_id);
            self.finalize(child_ref).await;
            return Ok(());
        }

        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.active.lock().insert(
            child_id,
            ActiveChild {
                token: token.clone(),
                done: done_rx,
            },
        );
        let completion = Arc::new(Completion {
            child: child_ref,
            remaining: AtomicUsize::new(timelines.len()),
            done: done_tx,
        });

        info!(
            "Orchestrator {} starting {} player(s) for {} child run {} of run {}",
            self.id,
            timelines.len(),
            child.simulation_type,
            child_id,
            child.run_id
        );

        for (device, timeline) in timelines {
            let this = self.clone();
            let token = token.clone();
            let completion = completion.clone();
            let name = format!("player-{}-{}", child_id, device);

            self.ctx.spawn(&name, async move {
                match SamplePublisher::open(this.broker.as_ref(), completion.child, device).await {
                    Ok(publisher) => {
                        run_player(this.ctx.as_ref(), publisher, timeline, device, token).await;
                    }
                    Err(e) => error!("Device {} could not open a channel: {}", device, e),
                }

                // Exactly one player observes the last decrement
                if completion.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    this.finalize(completion.child).await;
                    completion.done.send_replace(true);
                }
            });
        }
        Ok(())
    }

    async fn handle_stop(&self, message: &ControlMessage) -> Result<(), OrchestratorError> {
        let child_id = message.child_simulation_instance_id;
        let owned = self
            .active
            .lock()
            .get(&child_id)
            .map(|a| (a.token.clone(), a.done.clone()));

        let Some((token, done)) = owned else {
            if self.storage.child_run(child_id)?.is_none() {
                warn!("STOP for unknown child run {}, ignoring", child_id);
            } else {
                debug!("Child run {} not owned by orchestrator {}", child_id, self.id);
            }
            return Ok(());
        };

        info!("Stopping child run {} of run {}", child_id, message.simulation_instance_id);
        token.cancel();
        wait_done(done).await;
        Ok(())
    }

    /// Stops every child this orchestrator still owns.
    pub async fn stop_all(&self) {
        let owned: Vec<(CancellationToken, watch::Receiver<bool>)> = self
            .active
            .lock()
            .values()
            .map(|a| (a.token.clone(), a.done.clone()))
            .collect();
        for (token, _) in &owned {
            token.cancel();
        }
        for (_, done) in owned {
            wait_done(done).await;
        }
    }

    /// Persists the end of a child and, when it closed the run, announces it.
    async fn finalize(&self, child: ChildRef) {
        self.active.lock().remove(&child.child_id);
        let now = wall_clock(self.ctx.as_ref());

        match self.storage.mark_child_ended(child.child_id, now) {
            Ok(end) if end.run_completed => {
                info!(
                    "Run {} of simulation {} finished",
                    child.run_id, child.simulation_id
                );
                if let Err(e) = publish_simulation_ended(self.broker.as_ref(), child, now).await {
                    error!("Failed to announce end of run {}: {}", child.run_id, e);
                }
            }
            Ok(end) if end.newly_ended => info!("Child run {} ended", child.child_id),
            Ok(_) => debug!("Child run {} was already ended", child.child_id),
            Err(e) => error!("Failed to persist end of child run {}: {}", child.child_id, e),
        }
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    loop {
        if *done.borrow_and_update() {
            return;
        }
        if done.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::Launcher;
    use netsim_core::model::{
        ChildSimulationSpec, DeviceProfile, DeviceStatus, ItineraryStop, LocationSchedule,
        NewSimulation, RunId, ScheduledStatus, SimSwapSchedule, Simulation, SimulationPayload,
        StatusSchedule,
    };
    use netsim_core::protocol::{decode, EventsMessage, TelemetryData};
    use netsim_core::routing::RoutingError;
    use netsim_core::storage::SledStorage;
    use netsim_core::subscription::GeoPoint;
    use netsim_env::{Consumer, LocalBroker, TokioContext};
    use std::time::Duration;
    use tokio::time::Instant;

    struct Unroutable;

    impl Router for Unroutable {
        fn route(&self, _waypoints: &[GeoPoint]) -> Result<Vec<GeoPoint>, RoutingError> {
            Err(RoutingError::EmptyGraph)
        }
    }

    struct Harness {
        storage: Arc<SledStorage>,
        broker: Arc<LocalBroker>,
        launcher: Launcher<LocalBroker>,
        orchestrator: Orchestrator<TokioContext, LocalBroker>,
        shutdown: CancellationToken,
    }

    async fn harness() -> Harness {
        let storage = Arc::new(SledStorage::open_temp().unwrap());
        let broker = LocalBroker::with_topology().await.unwrap();
        let orchestrator = Orchestrator::new(
            TokioContext::shared(),
            broker.clone(),
            storage.clone(),
            Arc::new(Unroutable),
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(orchestrator.clone().run(shutdown.clone()));
        tokio::task::yield_now().await;

        Harness {
            launcher: Launcher::new(broker.clone(), storage.clone()),
            storage,
            broker,
            orchestrator,
            shutdown,
        }
    }

    fn device(key: &str, n: u32) -> DeviceProfile {
        DeviceProfile {
            id: key.to_string(),
            phone_number: Some(format!("+35191000000{}", n)),
            network_access_identifier: None,
            ipv4_address: None,
            ipv6_address: None,
        }
    }

    fn sim_swap(keys: &[&str], swaps: &[f64]) -> ChildSimulationSpec {
        ChildSimulationSpec::SimSwap(SimSwapSchedule {
            devices: keys.iter().map(|k| k.to_string()).collect(),
            timestamps_for_swaps_seconds: swaps.to_vec(),
        })
    }

    fn template(storage: &SledStorage, children: Vec<ChildSimulationSpec>) -> Simulation {
        storage
            .insert_simulation(NewSimulation {
                name: "orchestrated".into(),
                description: String::new(),
                payload: SimulationPayload {
                    devices: vec![device("UE1", 1), device("UE2", 2)],
                    mec_platforms: vec![],
                    child_simulations: children,
                },
            })
            .unwrap()
    }

    async fn wait_for_run_end(storage: &SledStorage, run: RunId) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while !storage.run(run).unwrap().unwrap().is_finished() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Drains samples until the end marker, returning the number of samples.
    async fn samples_until_end(events: &mut Box<dyn Consumer>) -> usize {
        let mut samples = 0;
        loop {
            let delivery = events.recv().await.unwrap();
            match decode::<EventsMessage>(&delivery.payload).unwrap() {
                EventsMessage::Telemetry(envelope) => match envelope.data {
                    TelemetryData::Sample(_) => samples += 1,
                    TelemetryData::SimulationEnded { .. } => return samples,
                },
                EventsMessage::Subscriptions(_) => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_natural_completion_ends_run() {
        let h = harness().await;
        let mut events = h.broker.consume(Topic::TelemetryEvents).await.unwrap();
        let simulation = template(
            &h.storage,
            vec![
                sim_swap(&["UE1", "UE2"], &[1.0, 3.0]),
                ChildSimulationSpec::DeviceStatus(StatusSchedule {
                    devices: vec!["UE1".into()],
                    initial_status: DeviceStatus::default(),
                    device_status_updates: vec![ScheduledStatus {
                        on_timestamp: 2,
                        connectivity_status: None,
                        roaming: Some(true),
                        country_code: None,
                        country_name: None,
                    }],
                }),
            ],
        );

        let start = Instant::now();
        let (run, _) = h.launcher.start_simulation(simulation.id).await.unwrap();
        wait_for_run_end(&h.storage, run.id).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));

        assert!(h.storage.children_of(run.id).unwrap().iter().all(|c| c.is_finished()));
        let stored = h.storage.run(run.id).unwrap().unwrap();
        assert!(stored.start_timestamp.is_some());

        // 2 devices x 2 swaps + 1 device x 2 status snapshots, then one marker
        assert_eq!(samples_until_end(&mut events).await, 6);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.broker.open_channel_count(), 0);
        assert_eq!(h.orchestrator.active_children(), 0);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_converges_on_same_end_state() {
        let h = harness().await;
        let mut events = h.broker.consume(Topic::TelemetryEvents).await.unwrap();
        let simulation = template(
            &h.storage,
            vec![
                sim_swap(&["UE1"], &[5.0, 60.0]),
                sim_swap(&["UE2"], &[120.0]),
            ],
        );

        let start = Instant::now();
        let (run, children) = h.launcher.start_simulation(simulation.id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.orchestrator.active_children(), 2);

        assert_eq!(h.launcher.stop_simulation(simulation.id).await.unwrap(), 2);
        wait_for_run_end(&h.storage, run.id).await;
        assert!(start.elapsed() < Duration::from_secs(11));

        for child in &children {
            assert!(h.storage.child_run(child.id).unwrap().unwrap().is_finished());
        }
        assert_eq!(samples_until_end(&mut events).await, 1);
        assert_eq!(h.orchestrator.active_children(), 0);

        // The finished run admits a new one
        assert!(h.launcher.start_simulation(simulation.id).await.is_ok());
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_malformed_commands_are_ignored() {
        let h = harness().await;
        let simulation = template(&h.storage, vec![sim_swap(&["UE1"], &[1.0])]);
        let (run, children) = h.launcher.start_simulation(simulation.id).await.unwrap();
        wait_for_run_end(&h.storage, run.id).await;

        // Replaying START for a finished child does nothing
        let replay = protocol::encode(&ControlMessage::start(&children[0])).unwrap();
        h.orchestrator.handle(&replay).await.unwrap();
        assert_eq!(h.orchestrator.active_children(), 0);

        let mut unknown = ControlMessage::stop(&children[0]);
        unknown.child_simulation_instance_id = ChildRunId(999_999);
        h.orchestrator
            .handle(&protocol::encode(&unknown).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            h.orchestrator.handle(b"{not json").await,
            Err(OrchestratorError::Protocol(_))
        ));
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_itinerary_ends_child() {
        let h = harness().await;
        let simulation = template(
            &h.storage,
            vec![ChildSimulationSpec::DeviceLocation(LocationSchedule {
                devices: vec!["UE1".into()],
                duration: 30,
                itinerary: vec![ItineraryStop {
                    label: "A".into(),
                    latitude: 40.63,
                    longitude: -8.65,
                }],
            })],
        );

        let (run, _) = h.launcher.start_simulation(simulation.id).await.unwrap();
        wait_for_run_end(&h.storage, run.id).await;
        assert_eq!(h.orchestrator.active_children(), 0);
        assert!(!h.storage.has_unfinished_run(simulation.id).unwrap());
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_control_message_does_not_stop_consumption() {
        let h = harness().await;
        let mut channel = h.broker.open_channel().await.unwrap();
        channel
            .publish(Topic::ControlWork, b"{\"not\":\"control\"}".to_vec())
            .await
            .unwrap();
        channel
            .publish(Topic::ControlBroadcast, b"garbage".to_vec())
            .await
            .unwrap();
        channel.close().await.unwrap();
        tokio::task::yield_now().await;

        let simulation = template(&h.storage, vec![sim_swap(&["UE1"], &[1.0])]);
        let (run, _) = h.launcher.start_simulation(simulation.id).await.unwrap();
        wait_for_run_end(&h.storage, run.id).await;

        assert!(h
            .storage
            .children_of(run.id)
            .unwrap()
            .iter()
            .all(|child| child.is_finished() && child.start_timestamp.is_some()));
        h.shutdown.cancel();
    }
}
