//! Common types for the simulator environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one worker process (orchestrator, events or persistence role).
///
/// Only used to tell workers apart in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Creates a new random WorkerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_are_distinct() {
        assert_ne!(WorkerId::new(), WorkerId::new());
    }

    #[test]
    fn test_worker_id_display_is_short() {
        let id = WorkerId::new();
        assert_eq!(id.to_string().len(), 8);
    }
}
