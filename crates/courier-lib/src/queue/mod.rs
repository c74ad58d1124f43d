//! Per-cluster command queues and the coordinator that routes to them

mod cluster;
mod coordinator;
mod history;

#[cfg(test)]
mod tests;

pub use cluster::{
    CancelOutcome, ClusterQueue, ClusterQueueHandle, ClusterQueueState, ClusterStatus, EnqueueOutcome,
    QueueConfig, QueueMessage, QueuePosition, QueuedCommand,
};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorMessage, CoordinatorStatus};
pub use history::HistoryEntry;
