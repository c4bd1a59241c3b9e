//! SIM-swap player schedule.

use super::{Step, Timeline};
use netsim_core::model::{SamplePayload, SimSwapSchedule};
use std::time::Duration;

/// Emits one swap sample at each distinct whole-second offset.
pub struct SimSwapTimeline {
    offsets: Vec<u64>,
    next: usize,
}

impl SimSwapTimeline {
    pub fn new(schedule: &SimSwapSchedule) -> Self {
        Self {
            offsets: schedule.offsets(),
            next: 0,
        }
    }
}

impl Timeline for SimSwapTimeline {
    fn next_step(&mut self) -> Option<Step> {
        let offset = *self.offsets.get(self.next)?;
        let previous = match self.next {
            0 => 0,
            i => self.offsets[i - 1],
        };
        self.next += 1;
        Some(Step {
            delay: Duration::from_secs(offset - previous),
            payload: SamplePayload::SimSwap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swaps_at_sorted_offsets() {
        let schedule = SimSwapSchedule {
            devices: vec!["UE1".into()],
            timestamps_for_swaps_seconds: vec![12.0, 3.7, 0.0, 12.2],
        };
        let mut timeline = SimSwapTimeline::new(&schedule);
        let delays: Vec<u64> = std::iter::from_fn(|| timeline.next_step())
            .map(|s| s.delay.as_secs())
            .collect();

        // 3.7 truncates to 3, the two 12s collapse into one swap
        assert_eq!(delays, vec![0, 3, 9]);
    }
}
