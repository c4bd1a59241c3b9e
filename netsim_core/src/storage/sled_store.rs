//! Sled-backed storage.
//!
//! Everything lives in one tree under readable, zero-padded keys so prefix
//! scans come back in id order:
//!
//! ```text
//! simulation/{sim}                  Simulation
//! run/{run}                         RunRecord (run + child/device ids)
//! runs_of/{sim}/{run}               RunId
//! latest_run/{sim}                  RunId     (admission pointer)
//! child/{child}                     ChildRun
//! device/{instance}                 DeviceInstance
//! sample/{instance}/{type}/{seq}    TelemetrySample
//! subscription/{uuid}               Subscription
//! subs_of/{sim}/{uuid}              SubscriptionId
//! notification/{id}                 NotificationRecord
//! notifs_of/{uuid}/{id}             NotificationId
//! ```

use super::{ChildEnd, RunTransaction, Storage, StorageError};
use crate::model::{
    ChildRun, ChildRunConfig, ChildRunId, DeviceInstance, DeviceInstanceId, DeviceProfile,
    NewSimulation, RunId, Simulation, SimulationId, SimulationRun, SimulationType, TelemetrySample,
    Timestamp,
};
use crate::subscription::{
    DeliveryStatus, NotificationId, NotificationRecord, Subscription, SubscriptionId,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Stored form of a run: the run itself plus the ids created with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    run: SimulationRun,
    children: Vec<ChildRunId>,
    devices: Vec<DeviceInstanceId>,
}

fn simulation_key(id: SimulationId) -> String {
    format!("simulation/{:020}", id.0)
}

fn run_key(id: RunId) -> String {
    format!("run/{:020}", id.0)
}

fn runs_of_prefix(simulation_id: SimulationId) -> String {
    format!("runs_of/{:020}/", simulation_id.0)
}

fn latest_run_key(simulation_id: SimulationId) -> String {
    format!("latest_run/{:020}", simulation_id.0)
}

fn child_key(id: ChildRunId) -> String {
    format!("child/{:020}", id.0)
}

fn device_key(id: DeviceInstanceId) -> String {
    format!("device/{:020}", id.0)
}

fn sample_prefix(id: DeviceInstanceId, simulation_type: SimulationType) -> String {
    format!("sample/{:020}/{}/", id.0, simulation_type)
}

fn subscription_key(id: SubscriptionId) -> String {
    format!("subscription/{}", id)
}

fn subs_of_prefix(simulation_id: SimulationId) -> String {
    format!("subs_of/{:020}/", simulation_id.0)
}

fn notification_key(id: NotificationId) -> String {
    format!("notification/{:020}", id.0)
}

fn notifs_of_prefix(id: SubscriptionId) -> String {
    format!("notifs_of/{}/", id)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(StorageError::codec)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(raw).map_err(StorageError::codec)
}

fn abort(err: StorageError) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err)
}

fn tx_get<T: DeserializeOwned>(
    tx: &TransactionalTree,
    key: &str,
) -> ConflictableTransactionResult<Option<T>, StorageError> {
    match tx.get(key.as_bytes())? {
        Some(raw) => decode(&raw).map(Some).map_err(abort),
        None => Ok(None),
    }
}

fn tx_put<T: Serialize>(
    tx: &TransactionalTree,
    key: &str,
    value: &T,
) -> ConflictableTransactionResult<(), StorageError> {
    let raw = encode(value).map_err(abort)?;
    tx.insert(key.as_bytes(), raw)?;
    Ok(())
}

fn finish_tx<T>(result: Result<T, TransactionError<StorageError>>) -> Result<T, StorageError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(err)) => Err(err),
        Err(TransactionError::Storage(err)) => Err(StorageError::backend(err)),
    }
}

/// Sled-based persistent storage.
///
/// Uses an embedded key-value database for durability.
#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)
            .map_err(|e| StorageError::Backend(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a temporary store, removed on drop
    pub fn open_temp() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::Backend(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub(crate) fn corrupt_device_instance(&self, id: DeviceInstanceId) -> Result<(), StorageError> {
        self.db
            .insert(device_key(id).as_bytes(), &b"not json"[..])
            .map_err(StorageError::backend)?;
        Ok(())
    }

    fn next_id(&self) -> Result<u64, StorageError> {
        // sled ids start at 0, keep 0 free
        Ok(self.db.generate_id().map_err(StorageError::backend)? + 1)
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.db.get(key.as_bytes()).map_err(StorageError::backend)? {
            Some(raw) => decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        self.db
            .insert(key.as_bytes(), encode(value)?)
            .map_err(StorageError::backend)?;
        Ok(())
    }

    /// Values of every key under `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StorageError> {
        self.db
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (_, raw) = entry.map_err(StorageError::backend)?;
                decode(&raw)
            })
            .collect()
    }

    fn run_record(&self, id: RunId) -> Result<Option<RunRecord>, StorageError> {
        self.get(&run_key(id))
    }
}

impl Storage for SledStorage {
    fn insert_simulation(&self, new: NewSimulation) -> Result<Simulation, StorageError> {
        let simulation = Simulation {
            id: SimulationId(self.next_id()?),
            name: new.name,
            description: new.description,
            payload: new.payload,
            created_at: Utc::now(),
        };
        self.put(&simulation_key(simulation.id), &simulation)?;
        debug!("Stored simulation {} ({})", simulation.id, simulation.name);
        Ok(simulation)
    }

    fn simulation(&self, id: SimulationId) -> Result<Option<Simulation>, StorageError> {
        self.get(&simulation_key(id))
    }

    fn has_unfinished_run(&self, simulation_id: SimulationId) -> Result<bool, StorageError> {
        Ok(self
            .latest_run(simulation_id)?
            .map_or(false, |run| !run.is_finished()))
    }

    fn latest_run(&self, simulation_id: SimulationId) -> Result<Option<SimulationRun>, StorageError> {
        match self.get::<RunId>(&latest_run_key(simulation_id))? {
            Some(id) => self.run(id),
            None => Ok(None),
        }
    }

    fn runs_of(&self, simulation_id: SimulationId) -> Result<Vec<SimulationRun>, StorageError> {
        let ids: Vec<RunId> = self.scan(&runs_of_prefix(simulation_id))?;
        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(run) = self.run(id)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    fn run(&self, id: RunId) -> Result<Option<SimulationRun>, StorageError> {
        Ok(self.run_record(id)?.map(|record| record.run))
    }

    fn begin_run(
        &self,
        simulation_id: SimulationId,
    ) -> Result<Box<dyn RunTransaction + '_>, StorageError> {
        if self.simulation(simulation_id)?.is_none() {
            return Err(StorageError::not_found(format!("simulation {}", simulation_id)));
        }
        if self.has_unfinished_run(simulation_id)? {
            return Err(StorageError::AlreadyRunning(simulation_id));
        }

        Ok(Box::new(SledRunTransaction {
            store: self,
            run: SimulationRun {
                id: RunId(self.next_id()?),
                simulation_id,
                start_timestamp: None,
                end_timestamp: None,
            },
            devices: Vec::new(),
            children: Vec::new(),
            identities: HashSet::new(),
        }))
    }

    fn child_run(&self, id: ChildRunId) -> Result<Option<ChildRun>, StorageError> {
        self.get(&child_key(id))
    }

    fn children_of(&self, run_id: RunId) -> Result<Vec<ChildRun>, StorageError> {
        let Some(record) = self.run_record(run_id)? else {
            return Ok(Vec::new());
        };
        let mut children = Vec::with_capacity(record.children.len());
        for id in record.children {
            if let Some(child) = self.child_run(id)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    fn unfinished_children(&self) -> Result<Vec<ChildRun>, StorageError> {
        let children: Vec<ChildRun> = self.scan("child/")?;
        Ok(children.into_iter().filter(|c| !c.is_finished()).collect())
    }

    fn mark_child_started(&self, id: ChildRunId, at: Timestamp) -> Result<ChildRun, StorageError> {
        let result = self.db.transaction(|tx| -> ConflictableTransactionResult<ChildRun, StorageError> {
            let mut child: ChildRun = tx_get(tx, &child_key(id))?
                .ok_or_else(|| abort(StorageError::not_found(format!("child run {}", id))))?;
            if child.start_timestamp.is_none() {
                child.start_timestamp = Some(at);
                tx_put(tx, &child_key(id), &child)?;
            }

            let key = run_key(child.run_id);
            if let Some(mut record) = tx_get::<RunRecord>(tx, &key)? {
                if record.run.start_timestamp.is_none() {
                    record.run.start_timestamp = Some(at);
                    tx_put(tx, &key, &record)?;
                }
            }
            Ok(child)
        });
        finish_tx(result)
    }

    fn mark_child_ended(&self, id: ChildRunId, at: Timestamp) -> Result<ChildEnd, StorageError> {
        let result = self.db.transaction(|tx| -> ConflictableTransactionResult<ChildEnd, StorageError> {
            let mut child: ChildRun = tx_get(tx, &child_key(id))?
                .ok_or_else(|| abort(StorageError::not_found(format!("child run {}", id))))?;
            if child.is_finished() {
                return Ok(ChildEnd {
                    child,
                    newly_ended: false,
                    run_completed: false,
                });
            }
            child.end_timestamp = Some(at);
            tx_put(tx, &child_key(id), &child)?;

            let key = run_key(child.run_id);
            let mut record: RunRecord = tx_get(tx, &key)?
                .ok_or_else(|| abort(StorageError::not_found(format!("run {}", child.run_id))))?;

            let mut run_completed = false;
            if !record.run.is_finished() {
                let mut all_ended = true;
                for sibling in record.children.iter().filter(|c| **c != id) {
                    let sibling: Option<ChildRun> = tx_get(tx, &child_key(*sibling))?;
                    all_ended &= sibling.map_or(true, |s| s.is_finished());
                }
                if all_ended {
                    record.run.end_timestamp = Some(at);
                    tx_put(tx, &key, &record)?;
                    run_completed = true;
                }
            }

            Ok(ChildEnd {
                child,
                newly_ended: true,
                run_completed,
            })
        });
        finish_tx(result)
    }

    fn device_instance(&self, id: DeviceInstanceId) -> Result<Option<DeviceInstance>, StorageError> {
        self.get(&device_key(id))
    }

    fn device_instances_of(&self, run_id: RunId) -> Result<Vec<DeviceInstance>, StorageError> {
        let Some(record) = self.run_record(run_id)? else {
            return Ok(Vec::new());
        };
        let mut devices = Vec::with_capacity(record.devices.len());
        for id in record.devices {
            if let Some(device) = self.device_instance(id)? {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    fn append_sample(&self, sample: &TelemetrySample) -> Result<(), StorageError> {
        let key = format!(
            "{}{:020}",
            sample_prefix(sample.device_instance_id, sample.payload.simulation_type()),
            self.next_id()?
        );
        self.put(&key, sample)
    }

    fn latest_sample(
        &self,
        device_instance_id: DeviceInstanceId,
        simulation_type: SimulationType,
    ) -> Result<Option<TelemetrySample>, StorageError> {
        let prefix = sample_prefix(device_instance_id, simulation_type);
        match self.db.scan_prefix(prefix.as_bytes()).next_back() {
            Some(entry) => {
                let (_, raw) = entry.map_err(StorageError::backend)?;
                decode(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        batch.insert(
            subscription_key(subscription.id).as_bytes(),
            encode(subscription)?,
        );
        batch.insert(
            format!("{}{}", subs_of_prefix(subscription.simulation_id), subscription.id).as_bytes(),
            encode(&subscription.id)?,
        );
        self.db.apply_batch(batch).map_err(StorageError::backend)
    }

    fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        let Some(subscription) = self.get::<Subscription>(&subscription_key(id))? else {
            return Ok(false);
        };
        let mut batch = sled::Batch::default();
        batch.remove(subscription_key(id).as_bytes());
        batch.remove(format!("{}{}", subs_of_prefix(subscription.simulation_id), id).as_bytes());
        self.db.apply_batch(batch).map_err(StorageError::backend)?;
        Ok(true)
    }

    fn active_subscriptions(
        &self,
        simulation_id: SimulationId,
        now: Timestamp,
    ) -> Result<Vec<Subscription>, StorageError> {
        let ids: Vec<SubscriptionId> = self.scan(&subs_of_prefix(simulation_id))?;
        let mut active = Vec::new();
        for id in ids {
            if let Some(subscription) = self.get::<Subscription>(&subscription_key(id))? {
                if !subscription.is_expired(now) {
                    active.push(subscription);
                }
            }
        }
        Ok(active)
    }

    fn record_notification(
        &self,
        subscription_id: SubscriptionId,
        event_type: &str,
        at: Timestamp,
    ) -> Result<NotificationId, StorageError> {
        let record = NotificationRecord {
            id: NotificationId(self.next_id()?),
            subscription_id,
            event_type: event_type.to_string(),
            status: DeliveryStatus::Pending,
            error: None,
            created_at: at,
            completed_at: None,
        };
        let mut batch = sled::Batch::default();
        batch.insert(notification_key(record.id).as_bytes(), encode(&record)?);
        batch.insert(
            format!("{}{:020}", notifs_of_prefix(subscription_id), record.id.0).as_bytes(),
            encode(&record.id)?,
        );
        self.db.apply_batch(batch).map_err(StorageError::backend)?;
        Ok(record.id)
    }

    fn complete_notification(
        &self,
        id: NotificationId,
        outcome: Result<(), String>,
        at: Timestamp,
    ) -> Result<(), StorageError> {
        let key = notification_key(id);
        let mut record: NotificationRecord = self
            .get(&key)?
            .ok_or_else(|| StorageError::not_found(format!("notification {}", id.0)))?;
        match outcome {
            Ok(()) => record.status = DeliveryStatus::Delivered,
            Err(error) => {
                record.status = DeliveryStatus::Failed;
                record.error = Some(error);
            }
        }
        record.completed_at = Some(at);
        self.put(&key, &record)
    }

    fn notifications_for(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<NotificationRecord>, StorageError> {
        let ids: Vec<NotificationId> = self.scan(&notifs_of_prefix(subscription_id))?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&notification_key(id))? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Run creation staged in memory, written in one sled transaction.
struct SledRunTransaction<'a> {
    store: &'a SledStorage,
    run: SimulationRun,
    devices: Vec<DeviceInstance>,
    children: Vec<ChildRun>,

    /// Phone numbers and network access identifiers already bound in this run
    identities: HashSet<String>,
}

impl<'a> RunTransaction for SledRunTransaction<'a> {
    fn run_id(&self) -> RunId {
        self.run.id
    }

    fn add_device_instance(&mut self, device: DeviceProfile) -> Result<DeviceInstanceId, StorageError> {
        let identities: Vec<&String> = device
            .phone_number
            .iter()
            .chain(device.network_access_identifier.iter())
            .collect();
        if let Some(taken) = identities.iter().find(|id| self.identities.contains(id.as_str())) {
            return Err(StorageError::Constraint(format!(
                "device identity {} is already bound in run {}",
                taken, self.run.id
            )));
        }
        let identities: Vec<String> = identities.into_iter().cloned().collect();
        self.identities.extend(identities);

        let instance = DeviceInstance {
            id: DeviceInstanceId(self.store.next_id()?),
            run_id: self.run.id,
            device,
        };
        let id = instance.id;
        self.devices.push(instance);
        Ok(id)
    }

    fn add_child(
        &mut self,
        simulation_type: SimulationType,
        duration_seconds: u64,
        config: ChildRunConfig,
    ) -> Result<ChildRunId, StorageError> {
        if config.spec.simulation_type() != simulation_type {
            return Err(StorageError::Constraint(format!(
                "child of type {} carries a {} spec",
                simulation_type,
                config.spec.simulation_type()
            )));
        }
        if let Some(unknown) = config
            .devices
            .iter()
            .find(|id| !self.devices.iter().any(|d| d.id == **id))
        {
            return Err(StorageError::Constraint(format!(
                "device instance {} is not part of run {}",
                unknown, self.run.id
            )));
        }

        let child = ChildRun {
            id: ChildRunId(self.store.next_id()?),
            run_id: self.run.id,
            simulation_id: self.run.simulation_id,
            simulation_type,
            duration_seconds,
            config,
            start_timestamp: None,
            end_timestamp: None,
        };
        let id = child.id;
        self.children.push(child);
        Ok(id)
    }

    fn commit(self: Box<Self>) -> Result<(SimulationRun, Vec<ChildRun>), StorageError> {
        let SledRunTransaction {
            store,
            run,
            devices,
            children,
            ..
        } = *self;

        if children.is_empty() {
            return Err(StorageError::Constraint(format!(
                "run {} has no child simulations",
                run.id
            )));
        }

        let record = RunRecord {
            run: run.clone(),
            children: children.iter().map(|c| c.id).collect(),
            devices: devices.iter().map(|d| d.id).collect(),
        };
        let simulation_id = run.simulation_id;

        let result = store.db.transaction(|tx| -> ConflictableTransactionResult<(), StorageError> {
            // Admission re-check: another run may have been committed meanwhile
            if let Some(latest) = tx_get::<RunId>(tx, &latest_run_key(simulation_id))? {
                if let Some(existing) = tx_get::<RunRecord>(tx, &run_key(latest))? {
                    if !existing.run.is_finished() {
                        return Err(abort(StorageError::AlreadyRunning(simulation_id)));
                    }
                }
            }

            tx_put(tx, &run_key(run.id), &record)?;
            tx_put(tx, &format!("{}{:020}", runs_of_prefix(simulation_id), run.id.0), &run.id)?;
            tx_put(tx, &latest_run_key(simulation_id), &run.id)?;
            for device in &devices {
                tx_put(tx, &device_key(device.id), device)?;
            }
            for child in &children {
                tx_put(tx, &child_key(child.id), child)?;
            }
            Ok(())
        });
        finish_tx(result)?;
        store.db.flush().map_err(StorageError::backend)?;

        debug!(
            "Committed run {} of simulation {} ({} children, {} devices)",
            run.id,
            simulation_id,
            children.len(),
            devices.len()
        );
        Ok((run, children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ChildSimulationSpec, ConnectivityStatus, DeviceStatus, SamplePayload, SimSwapSchedule,
        SimulationPayload,
    };
    use crate::subscription::{DeviceStatusEvent, SubscriptionKind, Webhook};
    use chrono::Duration;

    fn device(key: &str, phone: &str) -> DeviceProfile {
        DeviceProfile {
            id: key.to_string(),
            phone_number: Some(phone.to_string()),
            network_access_identifier: None,
            ipv4_address: None,
            ipv6_address: None,
        }
    }

    fn swap_spec(keys: &[&str]) -> ChildSimulationSpec {
        ChildSimulationSpec::SimSwap(SimSwapSchedule {
            devices: keys.iter().map(|k| k.to_string()).collect(),
            timestamps_for_swaps_seconds: vec![5.0],
        })
    }

    fn seeded() -> (SledStorage, Simulation) {
        let store = SledStorage::open_temp().unwrap();
        let simulation = store
            .insert_simulation(NewSimulation {
                name: "swap".into(),
                description: String::new(),
                payload: SimulationPayload {
                    devices: vec![device("UE1", "+351910000001")],
                    mec_platforms: vec![],
                    child_simulations: vec![swap_spec(&["UE1"])],
                },
            })
            .unwrap();
        (store, simulation)
    }

    /// Creates and commits a one-device, two-child run.
    fn commit_run(store: &SledStorage, simulation_id: SimulationId) -> (SimulationRun, Vec<ChildRun>) {
        let mut tx = store.begin_run(simulation_id).unwrap();
        let d = tx.add_device_instance(device("UE1", "+351910000001")).unwrap();
        for _ in 0..2 {
            tx.add_child(
                SimulationType::SimSwap,
                5,
                ChildRunConfig {
                    devices: vec![d],
                    spec: swap_spec(&["UE1"]),
                },
            )
            .unwrap();
        }
        tx.commit().unwrap()
    }

    #[test]
    fn test_simulation_round_trip() {
        let (store, simulation) = seeded();
        let loaded = store.simulation(simulation.id).unwrap().unwrap();
        assert_eq!(loaded.name, "swap");
        assert!(store.simulation(SimulationId(999_999)).unwrap().is_none());
    }

    #[test]
    fn test_admission_rejects_second_run() {
        let (store, simulation) = seeded();
        let (run, children) = commit_run(&store, simulation.id);

        assert!(store.has_unfinished_run(simulation.id).unwrap());
        assert_eq!(store.latest_run(simulation.id).unwrap().map(|r| r.id), Some(run.id));
        assert_eq!(children.len(), 2);
        assert!(matches!(
            store.begin_run(simulation.id),
            Err(StorageError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn test_commit_rechecks_admission() {
        let (store, simulation) = seeded();

        // Both pass the early check, only the first commit may win
        let mut first = store.begin_run(simulation.id).unwrap();
        let mut second = store.begin_run(simulation.id).unwrap();
        for tx in [&mut first, &mut second] {
            let d = tx.add_device_instance(device("UE1", "+351910000001")).unwrap();
            tx.add_child(
                SimulationType::SimSwap,
                5,
                ChildRunConfig { devices: vec![d], spec: swap_spec(&["UE1"]) },
            )
            .unwrap();
        }
        assert!(first.commit().is_ok());
        assert!(matches!(second.commit(), Err(StorageError::AlreadyRunning(_))));
        assert_eq!(store.runs_of(simulation.id).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_transaction_leaves_no_rows() {
        let (store, simulation) = seeded();
        let run_id;
        {
            let mut tx = store.begin_run(simulation.id).unwrap();
            run_id = tx.run_id();
            tx.add_device_instance(device("UE1", "+351910000001")).unwrap();
            tx.add_device_instance(device("UE2", "+351910000002")).unwrap();
            // Third device reuses UE1's phone number
            let err = tx.add_device_instance(device("UE3", "+351910000001")).unwrap_err();
            assert!(matches!(err, StorageError::Constraint(_)));
        }

        assert!(store.run(run_id).unwrap().is_none());
        assert!(store.children_of(run_id).unwrap().is_empty());
        assert!(store.device_instances_of(run_id).unwrap().is_empty());
        assert!(store.runs_of(simulation.id).unwrap().is_empty());
        assert!(!store.has_unfinished_run(simulation.id).unwrap());
    }

    #[test]
    fn test_child_must_reference_run_devices() {
        let (store, simulation) = seeded();
        let mut tx = store.begin_run(simulation.id).unwrap();
        let result = tx.add_child(
            SimulationType::SimSwap,
            5,
            ChildRunConfig {
                devices: vec![DeviceInstanceId(424242)],
                spec: swap_spec(&["UE1"]),
            },
        );
        assert!(matches!(result, Err(StorageError::Constraint(_))));
    }

    #[test]
    fn test_run_ends_with_last_child() {
        let (store, simulation) = seeded();
        let (run, children) = commit_run(&store, simulation.id);
        let now = Utc::now();

        let started = store.mark_child_started(children[0].id, now).unwrap();
        assert_eq!(started.start_timestamp, Some(now));
        assert_eq!(store.run(run.id).unwrap().unwrap().start_timestamp, Some(now));
        assert_eq!(store.unfinished_children().unwrap().len(), 2);

        let first = store.mark_child_ended(children[0].id, now).unwrap();
        assert!(first.newly_ended);
        assert!(!first.run_completed);
        assert!(store.has_unfinished_run(simulation.id).unwrap());

        let second = store.mark_child_ended(children[1].id, now).unwrap();
        assert!(second.run_completed);
        assert!(!store.has_unfinished_run(simulation.id).unwrap());
        assert!(store.unfinished_children().unwrap().is_empty());

        // Ending again is a no-op
        let again = store.mark_child_ended(children[1].id, now).unwrap();
        assert!(!again.newly_ended);
        assert!(!again.run_completed);

        // A finished run admits a new one
        assert!(store.begin_run(simulation.id).is_ok());
    }

    #[test]
    fn test_unknown_child_is_not_found() {
        let (store, _) = seeded();
        assert!(matches!(
            store.mark_child_ended(ChildRunId(777), Utc::now()),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_latest_device_status() {
        let (store, simulation) = seeded();
        let (run, children) = commit_run(&store, simulation.id);
        let device = store.device_instances_of(run.id).unwrap()[0].id;

        assert!(store.latest_device_status(device).unwrap().is_none());
        for (i, roaming) in [false, true].into_iter().enumerate() {
            store
                .append_sample(&TelemetrySample {
                    run_instance_id: run.id,
                    child_instance_id: children[0].id,
                    device_instance_id: device,
                    payload: SamplePayload::DeviceStatus(DeviceStatus {
                        connectivity_status: Some(ConnectivityStatus::ConnectedData),
                        roaming: Some(roaming),
                        ..Default::default()
                    }),
                    timestamp: Utc::now() + Duration::seconds(i as i64),
                })
                .unwrap();
        }

        let latest = store.latest_device_status(device).unwrap().unwrap();
        assert_eq!(latest.roaming, Some(true));
        assert!(store
            .latest_sample(device, SimulationType::DeviceLocation)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_active_subscriptions_skip_expired() {
        let (store, simulation) = seeded();
        let now = Utc::now();
        let make = |expire: Option<Timestamp>| Subscription {
            id: SubscriptionId::new(),
            simulation_id: simulation.id,
            run_id: None,
            device_instance_id: DeviceInstanceId(1),
            webhook: Webhook {
                notification_url: "http://localhost:9/cb".into(),
                notification_auth_token: None,
            },
            expire_time: expire,
            kind: SubscriptionKind::DeviceStatus {
                event: DeviceStatusEvent::RoamingOn,
            },
        };
        let live = make(None);
        let expired = make(Some(now - Duration::seconds(5)));
        store.insert_subscription(&live).unwrap();
        store.insert_subscription(&expired).unwrap();

        let active = store.active_subscriptions(simulation.id, now).unwrap();
        assert_eq!(active, vec![live.clone()]);

        assert!(store.delete_subscription(live.id).unwrap());
        assert!(!store.delete_subscription(live.id).unwrap());
        assert!(store.active_subscriptions(simulation.id, now).unwrap().is_empty());
    }

    #[test]
    fn test_notification_audit_trail() {
        let (store, _) = seeded();
        let subscription = SubscriptionId::new();
        let now = Utc::now();

        let ok = store.record_notification(subscription, "roaming-on", now).unwrap();
        let failed = store.record_notification(subscription, "roaming-on", now).unwrap();
        store.complete_notification(ok, Ok(()), now).unwrap();
        store
            .complete_notification(failed, Err("HTTP 503".into()), now)
            .unwrap();

        let records = store.notifications_for(subscription).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].success());
        assert_eq!(records[1].status, DeliveryStatus::Failed);
        assert_eq!(records[1].error.as_deref(), Some("HTTP 503"));
    }
}
