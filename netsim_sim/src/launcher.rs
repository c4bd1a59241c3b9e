//! Run launcher: admission, transactional run creation, START/STOP fan-out.

use crate::error::LaunchError;
use chrono::Utc;
use netsim_core::model::{
    ChildRun, ChildRunConfig, DeviceInstanceId, Simulation, SimulationId, SimulationRun,
};
use netsim_core::protocol::{self, ControlMessage};
use netsim_core::storage::Storage;
use netsim_env::{MessageBroker, Topic};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Entry point the API layer uses to start and stop runs.
pub struct Launcher<B: MessageBroker> {
    broker: Arc<B>,
    storage: Arc<dyn Storage>,
}

impl<B: MessageBroker> Launcher<B> {
    pub fn new(broker: Arc<B>, storage: Arc<dyn Storage>) -> Self {
        Self { broker, storage }
    }

    /// Creates a run of `simulation_id` and publishes one START per child.
    ///
    /// # Returns
    /// * `Ok((run, children))` - Run created and announced
    /// * `Err(LaunchError::AlreadyRunning)` - An unfinished run exists; nothing was created
    /// * `Err(LaunchError::NotFound)` - No such simulation
    pub async fn start_simulation(
        &self,
        simulation_id: SimulationId,
    ) -> Result<(SimulationRun, Vec<ChildRun>), LaunchError> {
        let simulation = self
            .storage
            .simulation(simulation_id)?
            .ok_or(LaunchError::NotFound(simulation_id))?;
        if simulation.payload.child_simulations.is_empty() {
            return Err(LaunchError::InvalidSimulation(
                simulation_id,
                "no child simulations".into(),
            ));
        }
        if self.storage.has_unfinished_run(simulation_id)? {
            warn!("Simulation {} already has an unfinished run", simulation_id);
            return Err(LaunchError::AlreadyRunning(simulation_id));
        }

        let (run, children) = self.create_run(&simulation)?;

        let mut announced = 0;
        if let Err(e) = self.announce(&children, &mut announced).await {
            // Children nobody will ever play must not hold the run open
            self.abandon(&children[announced..]);
            return Err(e);
        }

        info!(
            "Launched run {} of simulation {} with {} child simulation(s)",
            run.id,
            simulation_id,
            children.len()
        );
        Ok((run, children))
    }

    /// Publishes one START per child, counting those that went out.
    async fn announce(&self, children: &[ChildRun], announced: &mut usize) -> Result<(), LaunchError> {
        let mut channel = self.broker.open_channel().await?;
        for child in children {
            let body = protocol::encode(&ControlMessage::start(child))?;
            channel.publish(Topic::ControlWork, body).await?;
            *announced += 1;
        }
        channel.close().await?;
        Ok(())
    }

    /// Ends children whose START was never published. Ending the last one
    /// closes the run.
    fn abandon(&self, children: &[ChildRun]) {
        let now = Utc::now();
        for child in children {
            match self.storage.mark_child_ended(child.id, now) {
                Ok(end) => warn!(
                    "Child run {} of run {} was never announced, ended it{}",
                    child.id,
                    child.run_id,
                    if end.run_completed { " and closed the run" } else { "" }
                ),
                Err(e) => error!("Failed to end unannounced child run {}: {}", child.id, e),
            }
        }
    }

    /// Creates run, device instances and children in one transaction.
    ///
    /// Any early return drops the transaction, which rolls everything back.
    fn create_run(
        &self,
        simulation: &Simulation,
    ) -> Result<(SimulationRun, Vec<ChildRun>), LaunchError> {
        let mut tx = self.storage.begin_run(simulation.id)?;

        let mut instances: HashMap<&str, DeviceInstanceId> = HashMap::new();
        for device in &simulation.payload.devices {
            let id = tx.add_device_instance(device.clone())?;
            instances.insert(device.id.as_str(), id);
        }

        for spec in &simulation.payload.child_simulations {
            let devices = spec
                .device_keys()
                .iter()
                .map(|key| {
                    instances.get(key.as_str()).copied().ok_or_else(|| {
                        LaunchError::InvalidSimulation(
                            simulation.id,
                            format!("unknown device {}", key),
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            tx.add_child(
                spec.simulation_type(),
                spec.duration_seconds(),
                ChildRunConfig {
                    devices,
                    spec: spec.clone(),
                },
            )?;
        }

        Ok(tx.commit()?)
    }

    /// Publishes one STOP per unfinished child of the simulation's live run.
    ///
    /// Returns the number of STOP commands sent.
    pub async fn stop_simulation(&self, simulation_id: SimulationId) -> Result<usize, LaunchError> {
        if self.storage.simulation(simulation_id)?.is_none() {
            return Err(LaunchError::NotFound(simulation_id));
        }
        let Some(run) = self
            .storage
            .latest_run(simulation_id)?
            .filter(|run| !run.is_finished())
        else {
            warn!("Simulation {} has no unfinished run to stop", simulation_id);
            return Ok(0);
        };

        let children: Vec<ChildRun> = self
            .storage
            .children_of(run.id)?
            .into_iter()
            .filter(|c| !c.is_finished())
            .collect();

        let mut channel = self.broker.open_channel().await?;
        for child in &children {
            let body = protocol::encode(&ControlMessage::stop(child))?;
            channel.publish(Topic::ControlBroadcast, body).await?;
        }
        channel.close().await?;

        info!(
            "Requested stop of {} child simulation(s) of run {}",
            children.len(),
            run.id
        );
        Ok(children.len())
    }
}
