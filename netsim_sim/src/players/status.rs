//! Status player schedule: initial status, then merged updates at offsets.

use super::{Step, Timeline};
use netsim_core::model::{DeviceStatus, SamplePayload, StatusSchedule};
use std::collections::VecDeque;
use std::time::Duration;

/// Emits the full status snapshot at offset 0 and at every scheduled offset.
///
/// Each snapshot is the initial status with every update up to and including
/// that offset merged in. Updates sharing an offset are merged in order.
pub struct StatusTimeline {
    steps: VecDeque<Step>,
}

impl StatusTimeline {
    pub fn new(schedule: &StatusSchedule) -> Self {
        let mut updates = schedule.device_status_updates.clone();
        updates.sort_by_key(|u| u.on_timestamp);

        let mut current: DeviceStatus = schedule.initial_status.clone();
        let mut snapshots: Vec<(u64, DeviceStatus)> = Vec::new();
        let mut pending = updates.iter().peekable();

        let mut offset = 0;
        loop {
            while let Some(update) = pending.next_if(|u| u.on_timestamp == offset) {
                current.merge(&update.update());
            }
            snapshots.push((offset, current.clone()));
            match pending.peek() {
                Some(next) => offset = next.on_timestamp,
                None => break,
            }
        }

        let mut previous = 0;
        let steps = snapshots
            .into_iter()
            .map(|(offset, status)| {
                let delay = Duration::from_secs(offset - previous);
                previous = offset;
                Step {
                    delay,
                    payload: SamplePayload::DeviceStatus(status),
                }
            })
            .collect();
        Self { steps }
    }
}

impl Timeline for StatusTimeline {
    fn next_step(&mut self) -> Option<Step> {
        self.steps.pop_front()
    }
}
