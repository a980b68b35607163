use serde::{Deserialize, Serialize};

/// Worker counts by lifecycle state, as tracked by a [`crate::Runtime`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub starting: usize,
    pub running: usize,
    pub terminated: usize,
}

impl WorkerCounts {
    pub fn live(&self) -> usize {
        self.starting + self.running
    }
}
