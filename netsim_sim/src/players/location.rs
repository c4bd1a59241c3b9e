//! Location player schedule: walk a routed polyline in fixed steps.

use super::{Step, Timeline};
use netsim_core::model::SamplePayload;
use netsim_core::subscription::GeoPoint;
use std::time::Duration;

/// Emits the first coordinate immediately, then one coordinate every
/// `duration / (len - 1)`.
pub struct LocationTimeline {
    polyline: Vec<GeoPoint>,
    step: Duration,
    next: usize,
}

impl LocationTimeline {
    pub fn new(polyline: Vec<GeoPoint>, duration: Duration) -> Self {
        let step = match polyline.len() {
            0 | 1 => Duration::ZERO,
            n => duration / (n as u32 - 1),
        };
        Self {
            polyline,
            step,
            next: 0,
        }
    }

    /// Interval between consecutive coordinates.
    pub fn step(&self) -> Duration {
        self.step
    }
}

impl Timeline for LocationTimeline {
    fn next_step(&mut self) -> Option<Step> {
        let point = *self.polyline.get(self.next)?;
        let delay = if self.next == 0 { Duration::ZERO } else { self.step };
        self.next += 1;
        Some(Step {
            delay,
            payload: SamplePayload::DeviceLocation {
                latitude: point.latitude,
                longitude: point.longitude,
            },
        })
    }
}
