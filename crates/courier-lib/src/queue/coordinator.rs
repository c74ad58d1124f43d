//! Coordinator actor
//!
//! Owns one queue per configured cluster, routes commands to them, folds
//! completions into cumulative counters and a bounded history, and restarts
//! queue actors that terminate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cluster::{
    CancelOutcome, ClusterQueue, ClusterQueueHandle, ClusterStatus, EnqueueOutcome, QueueConfig, QueuePosition,
};
use super::history::{HistoryEntry, HistoryRing};
use crate::dispatch::DispatchTable;
use crate::error::RoutingError;
use crate::models::{Command, CommandResponse, CommandStatus};
use crate::observability::{CourierMetrics, StructuredLogger};

/// History entries included in a status snapshot
const STATUS_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub clusters: Vec<String>,
    /// History entries above this trigger compaction down to half
    pub history_threshold: usize,
    /// How often terminated queue actors are looked for
    pub monitor_interval: Duration,
    /// How often shutdown checks whether queues have drained
    pub drain_poll_interval: Duration,
    pub queue: QueueConfig,
    pub inbox_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            history_threshold: 1000,
            monitor_interval: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(200),
            queue: QueueConfig::default(),
            inbox_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub is_running: bool,
    pub supported_clusters: Vec<String>,
    pub total_routed: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    /// Commands ignored because their alert id was already known
    pub total_duplicates: u64,
    pub history_size: usize,
    /// Number of history compactions so far
    pub generation: u64,
    pub clusters: BTreeMap<String, ClusterStatus>,
    /// Newest first
    pub recent_history: Vec<HistoryEntry>,
}

#[derive(Debug)]
pub enum CoordinatorMessage {
    Route {
        command: Command,
        reply: oneshot::Sender<Result<EnqueueOutcome, RoutingError>>,
    },
    Status(oneshot::Sender<CoordinatorStatus>),
    Position {
        cluster_context: String,
        alert_id: String,
        reply: oneshot::Sender<Result<QueuePosition, RoutingError>>,
    },
    /// Accepted while draining, so an in-flight command can still be stopped
    Cancel {
        cluster_context: String,
        alert_id: String,
        reply: oneshot::Sender<Result<CancelOutcome, RoutingError>>,
    },
    /// Stop routing; in-flight executions finish, pending ones are dropped
    Shutdown { reason: String },
}

#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    pub async fn route(&self, command: Command) -> Result<EnqueueOutcome, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::Route { command, reply })
            .await
            .map_err(|_| RoutingError::CoordinatorUnavailable)?;
        rx.await.map_err(|_| RoutingError::CoordinatorUnavailable)?
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::Status(reply))
            .await
            .map_err(|_| RoutingError::CoordinatorUnavailable)?;
        rx.await.map_err(|_| RoutingError::CoordinatorUnavailable)
    }

    pub async fn position(&self, cluster_context: &str, alert_id: &str) -> Result<QueuePosition, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::Position {
                cluster_context: cluster_context.to_string(),
                alert_id: alert_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| RoutingError::CoordinatorUnavailable)?;
        rx.await.map_err(|_| RoutingError::CoordinatorUnavailable)?
    }

    pub async fn cancel(&self, cluster_context: &str, alert_id: &str) -> Result<CancelOutcome, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::Cancel {
                cluster_context: cluster_context.to_string(),
                alert_id: alert_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| RoutingError::CoordinatorUnavailable)?;
        rx.await.map_err(|_| RoutingError::CoordinatorUnavailable)?
    }

    pub async fn shutdown(&self, reason: impl Into<String>) -> Result<(), RoutingError> {
        self.tx
            .send(CoordinatorMessage::Shutdown { reason: reason.into() })
            .await
            .map_err(|_| RoutingError::CoordinatorUnavailable)
    }
}

struct QueueSlot {
    handle: ClusterQueueHandle,
    task: JoinHandle<()>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    dispatcher: Arc<DispatchTable>,
    logger: StructuredLogger,
    metrics: CourierMetrics,
    queues: BTreeMap<String, QueueSlot>,
    history: HistoryRing,
    generation: u64,
    total_routed: u64,
    total_processed: u64,
    total_failed: u64,
    total_cancelled: u64,
    total_duplicates: u64,
    is_running: bool,
    inbox: mpsc::Receiver<CoordinatorMessage>,
    inbox_closed: bool,
    completions_tx: mpsc::UnboundedSender<CommandResponse>,
    completions_rx: mpsc::UnboundedReceiver<CommandResponse>,
}

impl Coordinator {
    /// Start one queue per configured cluster and the coordinator loop.
    ///
    /// The join handle resolves to the final status once shutdown has drained.
    pub fn spawn(
        config: CoordinatorConfig,
        dispatcher: Arc<DispatchTable>,
        logger: StructuredLogger,
    ) -> (CoordinatorHandle, JoinHandle<CoordinatorStatus>) {
        let (coordinator, tx) = Self::new(config, dispatcher, logger);
        let task = tokio::spawn(coordinator.run());
        (CoordinatorHandle { tx }, task)
    }

    fn new(
        config: CoordinatorConfig,
        dispatcher: Arc<DispatchTable>,
        logger: StructuredLogger,
    ) -> (Self, mpsc::Sender<CoordinatorMessage>) {
        let (tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let history = HistoryRing::new(config.history_threshold.saturating_add(1));

        let mut coordinator = Self {
            config,
            dispatcher,
            logger,
            metrics: CourierMetrics::new(),
            queues: BTreeMap::new(),
            history,
            generation: 0,
            total_routed: 0,
            total_processed: 0,
            total_failed: 0,
            total_cancelled: 0,
            total_duplicates: 0,
            is_running: true,
            inbox,
            inbox_closed: false,
            completions_tx,
            completions_rx,
        };
        for cluster in coordinator.config.clusters.clone() {
            coordinator.start_queue(&cluster);
        }
        (coordinator, tx)
    }

    fn start_queue(&mut self, cluster: &str) {
        let (handle, task) = ClusterQueue::spawn(
            cluster,
            self.config.queue.clone(),
            self.dispatcher.clone(),
            self.completions_tx.clone(),
        );
        self.queues.insert(cluster.to_string(), QueueSlot { handle, task });
    }

    fn restart_queue(&mut self, cluster: &str) {
        warn!(cluster = %cluster, "Cluster queue terminated, restarting");
        self.metrics.inc_queue_restarts(cluster);
        self.start_queue(cluster);
    }

    async fn run(mut self) -> CoordinatorStatus {
        info!(clusters = ?self.config.clusters, "Coordinator started");

        let mut monitor = tokio::time::interval(self.config.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drain = tokio::time::interval(self.config.drain_poll_interval);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.inbox.recv(), if !self.inbox_closed => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        self.inbox_closed = true;
                        let reason = "all coordinator handles dropped".to_string();
                        self.handle_message(CoordinatorMessage::Shutdown { reason }).await;
                    }
                },
                Some(response) = self.completions_rx.recv() => {
                    self.record_completion(response);
                }
                _ = monitor.tick(), if self.is_running => {
                    self.restart_terminated();
                }
                _ = drain.tick(), if !self.is_running => {
                    if self.queues.values().all(|slot| slot.task.is_finished()) {
                        break;
                    }
                }
            }
        }

        while let Ok(response) = self.completions_rx.try_recv() {
            self.record_completion(response);
        }
        let status = self.snapshot(BTreeMap::new());
        info!(
            total_routed = status.total_routed,
            total_processed = status.total_processed,
            total_failed = status.total_failed,
            "Coordinator stopped"
        );
        status
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Route { command, reply } => {
                let result = self.route(command).await;
                let _ = reply.send(result);
            }
            CoordinatorMessage::Status(reply) => {
                let status = self.status().await;
                let _ = reply.send(status);
            }
            CoordinatorMessage::Position {
                cluster_context,
                alert_id,
                reply,
            } => {
                let result = match self.queues.get(&cluster_context) {
                    Some(slot) => slot.handle.position(&alert_id).await,
                    None => Err(RoutingError::UnsupportedCluster(cluster_context)),
                };
                let _ = reply.send(result);
            }
            CoordinatorMessage::Cancel {
                cluster_context,
                alert_id,
                reply,
            } => {
                let result = match self.queues.get(&cluster_context) {
                    Some(slot) => slot.handle.cancel(&alert_id).await,
                    None => Err(RoutingError::UnsupportedCluster(cluster_context)),
                };
                let _ = reply.send(result);
            }
            CoordinatorMessage::Shutdown { reason } => {
                if !self.is_running {
                    return;
                }
                self.is_running = false;
                self.logger.log_shutdown(&reason);
                for (cluster, slot) in &self.queues {
                    if slot.handle.shutdown().await.is_err() {
                        debug!(cluster = %cluster, "Queue already stopped");
                    }
                }
            }
        }
    }

    fn check_routable(&self, command: &Command) -> Result<(), RoutingError> {
        if !self.is_running {
            return Err(RoutingError::ShuttingDown);
        }
        command.validate()?;
        if !self.dispatcher.supports(command.kind) {
            return Err(RoutingError::UnsupportedCommandKind(command.kind.to_string()));
        }
        if !self.queues.contains_key(&command.cluster_context) {
            return Err(RoutingError::UnsupportedCluster(command.cluster_context.clone()));
        }
        Ok(())
    }

    async fn route(&mut self, command: Command) -> Result<EnqueueOutcome, RoutingError> {
        if let Err(e) = self.check_routable(&command) {
            self.reject(&command, &e);
            return Err(e);
        }

        let cluster = command.cluster_context.clone();
        let entry = HistoryEntry::routed(&command);
        let (alert_id, kind, priority) = (command.alert_id.clone(), command.kind, command.priority);

        let outcome = match self.enqueue(&cluster, command).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.inc_commands_rejected(e.reason());
                self.logger.log_command_rejected(&cluster, &alert_id, &e.to_string());
                return Err(e);
            }
        };
        if outcome == EnqueueOutcome::Duplicate {
            self.total_duplicates += 1;
            self.metrics.inc_commands_duplicate(&cluster);
            debug!(cluster = %cluster, alert_id = %alert_id, "Duplicate alert not routed");
            return Ok(outcome);
        }

        self.total_routed += 1;
        self.metrics.inc_commands_routed(&cluster, kind.as_str());
        self.logger.log_command_routed(&cluster, &alert_id, kind.as_str(), priority);
        self.history.push(entry);
        self.maybe_compact_history();
        Ok(outcome)
    }

    /// Enqueue, restarting a dead queue and retrying once.
    async fn enqueue(&mut self, cluster: &str, command: Command) -> Result<EnqueueOutcome, RoutingError> {
        let needs_restart = match self.queues.get(cluster) {
            Some(slot) => slot.handle.is_closed() || slot.task.is_finished(),
            None => return Err(RoutingError::UnsupportedCluster(cluster.to_string())),
        };
        if needs_restart {
            self.restart_queue(cluster);
        }

        let retry = command.clone();
        let first = match self.queues.get(cluster) {
            Some(slot) => slot.handle.enqueue(command).await,
            None => return Err(RoutingError::UnsupportedCluster(cluster.to_string())),
        };
        match first {
            Ok(outcome) => Ok(outcome),
            Err(RoutingError::QueueUnavailable(_)) => {
                self.restart_queue(cluster);
                match self.queues.get(cluster) {
                    Some(slot) => slot.handle.enqueue(retry).await,
                    None => Err(RoutingError::UnsupportedCluster(cluster.to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn reject(&self, command: &Command, error: &RoutingError) {
        self.metrics.inc_commands_rejected(error.reason());
        self.logger
            .log_command_rejected(&command.cluster_context, &command.alert_id, &error.to_string());
    }

    fn record_completion(&mut self, response: CommandResponse) {
        self.total_processed += 1;
        if response.status == CommandStatus::Cancelled {
            self.total_cancelled += 1;
        } else if !response.success {
            self.total_failed += 1;
        }
        if !self.history.record_completion(&response) {
            debug!(alert_id = %response.alert_id, "Completion for command no longer in history");
        }
        self.logger.log_command_completed(&response);
    }

    fn maybe_compact_history(&mut self) {
        let threshold = self.config.history_threshold;
        if self.history.len() <= threshold {
            return;
        }
        let dropped = self.history.compact(threshold / 2);
        self.generation += 1;
        info!(
            dropped = dropped,
            kept = self.history.len(),
            generation = self.generation,
            "Compacted coordinator history"
        );
    }

    fn restart_terminated(&mut self) {
        let dead: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, slot)| slot.task.is_finished())
            .map(|(cluster, _)| cluster.clone())
            .collect();
        for cluster in dead {
            self.restart_queue(&cluster);
        }
    }

    async fn status(&self) -> CoordinatorStatus {
        let mut clusters = BTreeMap::new();
        for (cluster, slot) in &self.queues {
            match slot.handle.status().await {
                Ok(status) => {
                    clusters.insert(cluster.clone(), status);
                }
                Err(e) => debug!(cluster = %cluster, error = %e, "Queue status unavailable"),
            }
        }
        self.snapshot(clusters)
    }

    fn snapshot(&self, clusters: BTreeMap<String, ClusterStatus>) -> CoordinatorStatus {
        CoordinatorStatus {
            is_running: self.is_running,
            supported_clusters: self.queues.keys().cloned().collect(),
            total_routed: self.total_routed,
            total_processed: self.total_processed,
            total_failed: self.total_failed,
            total_cancelled: self.total_cancelled,
            total_duplicates: self.total_duplicates,
            history_size: self.history.len(),
            generation: self.generation,
            clusters,
            recent_history: self.history.recent(STATUS_HISTORY_LIMIT),
        }
    }
}
