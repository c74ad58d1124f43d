//! Per-cluster command queue actor
//!
//! One actor per cluster owns its queue state exclusively. Commands arrive
//! through the inbox; at most one executes at a time, highest priority
//! first with FIFO among equals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::DispatchTable;
use crate::error::RoutingError;
use crate::models::{Command, CommandResponse, CommandStatus};
use crate::observability::CourierMetrics;

/// Queue actor configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Restart with carried state after processing more than this many commands
    pub compaction_threshold: u64,
    /// Idle-poll interval between queue cycles
    pub poll_interval: Duration,
    pub inbox_capacity: usize,
    /// Alert ids remembered after dispatch for duplicate suppression
    pub recent_dispatch_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 1000,
            poll_interval: Duration::from_secs(10),
            inbox_capacity: 256,
            recent_dispatch_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub cluster_context: String,
    pub queue_size: usize,
    pub currently_executing: Option<String>,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub last_error: Option<String>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePosition {
    pub found: bool,
    /// 0 while executing, 1-based while waiting
    pub position: Option<usize>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { position: usize },
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The executing command was signalled; its response arrives as `cancelled`
    Signalled,
    /// The command was waiting and has been removed
    Dequeued,
    NotFound,
}

/// Bounded memory of dispatched alert ids
#[derive(Debug, Clone)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// State owned by one cluster queue actor
#[derive(Debug, Clone)]
pub struct ClusterQueueState {
    cluster_context: String,
    queue: Vec<QueuedCommand>,
    currently_executing: Option<String>,
    total_processed: u64,
    total_failed: u64,
    total_cancelled: u64,
    last_error: Option<String>,
    last_execution_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    generation: u64,
    processed_this_generation: u64,
    recent: RecentIds,
}

impl ClusterQueueState {
    pub fn new(cluster_context: impl Into<String>, recent_capacity: usize) -> Self {
        Self {
            cluster_context: cluster_context.into(),
            queue: Vec::new(),
            currently_executing: None,
            total_processed: 0,
            total_failed: 0,
            total_cancelled: 0,
            last_error: None,
            last_execution_at: None,
            started_at: Utc::now(),
            generation: 0,
            processed_this_generation: 0,
            recent: RecentIds::new(recent_capacity),
        }
    }

    pub fn cluster_context(&self) -> &str {
        &self.cluster_context
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether the alert is queued, executing, or was dispatched recently.
    pub fn is_known(&self, alert_id: &str) -> bool {
        self.currently_executing.as_deref() == Some(alert_id)
            || self.queue.iter().any(|q| q.command.alert_id == alert_id)
            || self.recent.contains(alert_id)
    }

    pub fn enqueue(&mut self, command: Command) -> EnqueueOutcome {
        if self.is_known(&command.alert_id) {
            return EnqueueOutcome::Duplicate;
        }
        let index = self
            .queue
            .iter()
            .position(|q| q.command.priority < command.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(
            index,
            QueuedCommand {
                command,
                queued_at: Utc::now(),
            },
        );
        EnqueueOutcome::Queued { position: index + 1 }
    }

    /// Dequeue the next command unless one is already executing.
    pub fn start_next(&mut self) -> Option<QueuedCommand> {
        if self.currently_executing.is_some() || self.queue.is_empty() {
            return None;
        }
        let next = self.queue.remove(0);
        self.currently_executing = Some(next.command.alert_id.clone());
        self.recent.insert(&next.command.alert_id);
        Some(next)
    }

    pub fn finish(&mut self, response: &CommandResponse) {
        self.currently_executing = None;
        self.record(response);
    }

    /// Remove a waiting command. It counts as dispatched for duplicate suppression.
    pub fn cancel_pending(&mut self, alert_id: &str) -> Option<QueuedCommand> {
        let index = self.queue.iter().position(|q| q.command.alert_id == alert_id)?;
        let removed = self.queue.remove(index);
        self.recent.insert(alert_id);
        Some(removed)
    }

    /// Count a terminal response without touching the execution slot.
    pub fn record(&mut self, response: &CommandResponse) {
        self.total_processed += 1;
        self.processed_this_generation += 1;
        self.last_execution_at = Some(response.completed_at);
        if response.status == CommandStatus::Cancelled {
            self.total_cancelled += 1;
        } else if !response.success {
            self.total_failed += 1;
            self.last_error = Some(format!("{}: {}", response.alert_id, response.message));
        }
    }

    pub fn should_compact(&self, threshold: u64) -> bool {
        self.currently_executing.is_none() && self.processed_this_generation > threshold
    }

    /// Begin a new generation, carrying identity, counters and pending work.
    pub fn carry_forward(&mut self) {
        self.generation += 1;
        self.processed_this_generation = 0;
        self.queue.shrink_to_fit();
    }

    /// Drop everything still waiting; returns the dropped alert ids.
    pub fn drain_pending(&mut self) -> Vec<String> {
        self.queue.drain(..).map(|q| q.command.alert_id).collect()
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            cluster_context: self.cluster_context.clone(),
            queue_size: self.queue.len(),
            currently_executing: self.currently_executing.clone(),
            total_processed: self.total_processed,
            total_failed: self.total_failed,
            total_cancelled: self.total_cancelled,
            last_error: self.last_error.clone(),
            last_execution_at: self.last_execution_at,
            generation: self.generation,
            started_at: self.started_at,
        }
    }

    pub fn position(&self, alert_id: &str) -> QueuePosition {
        if self.currently_executing.as_deref() == Some(alert_id) {
            return QueuePosition {
                found: true,
                position: Some(0),
                priority: None,
            };
        }
        match self
            .queue
            .iter()
            .enumerate()
            .find(|(_, q)| q.command.alert_id == alert_id)
        {
            Some((index, queued)) => QueuePosition {
                found: true,
                position: Some(index + 1),
                priority: Some(queued.command.priority),
            },
            None => QueuePosition {
                found: false,
                position: None,
                priority: None,
            },
        }
    }
}

#[derive(Debug)]
pub enum QueueMessage {
    Enqueue {
        command: Command,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    Status(oneshot::Sender<ClusterStatus>),
    Position {
        alert_id: String,
        reply: oneshot::Sender<QueuePosition>,
    },
    Cancel {
        alert_id: String,
        reply: oneshot::Sender<CancelOutcome>,
    },
    /// Stop dequeuing; the in-flight command runs to completion
    Shutdown,
}

/// Sending side of a cluster queue actor
#[derive(Debug, Clone)]
pub struct ClusterQueueHandle {
    cluster_context: String,
    tx: mpsc::Sender<QueueMessage>,
}

impl ClusterQueueHandle {
    fn unavailable(&self) -> RoutingError {
        RoutingError::QueueUnavailable(self.cluster_context.clone())
    }

    pub fn cluster_context(&self) -> &str {
        &self.cluster_context
    }

    /// A queue that is shutting down drops the reply, which reads as unavailable.
    pub async fn enqueue(&self, command: Command) -> Result<EnqueueOutcome, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Enqueue { command, reply })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn cancel(&self, alert_id: &str) -> Result<CancelOutcome, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Cancel {
                alert_id: alert_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn status(&self) -> Result<ClusterStatus, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Status(reply))
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn position(&self, alert_id: &str) -> Result<QueuePosition, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Position {
                alert_id: alert_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn shutdown(&self) -> Result<(), RoutingError> {
        self.tx
            .send(QueueMessage::Shutdown)
            .await
            .map_err(|_| self.unavailable())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct InFlight {
    command: Command,
    cancel: CancellationToken,
    handle: JoinHandle<CommandResponse>,
}

enum Event {
    Message(Option<QueueMessage>),
    Finished(Result<CommandResponse, JoinError>),
    Tick,
}

enum GenerationEnd {
    Compact,
    Stopped,
}

async fn wait_in_flight(in_flight: &mut Option<InFlight>) -> Result<CommandResponse, JoinError> {
    match in_flight {
        Some(flight) => (&mut flight.handle).await,
        None => std::future::pending().await,
    }
}

pub struct ClusterQueue {
    state: ClusterQueueState,
    config: QueueConfig,
    inbox: mpsc::Receiver<QueueMessage>,
    inbox_closed: bool,
    shutting_down: bool,
    dispatcher: Arc<DispatchTable>,
    completions: mpsc::UnboundedSender<CommandResponse>,
    metrics: CourierMetrics,
}

impl ClusterQueue {
    /// Start a queue actor for `cluster_context`.
    pub fn spawn(
        cluster_context: impl Into<String>,
        config: QueueConfig,
        dispatcher: Arc<DispatchTable>,
        completions: mpsc::UnboundedSender<CommandResponse>,
    ) -> (ClusterQueueHandle, JoinHandle<()>) {
        let cluster_context = cluster_context.into();
        let (tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        let actor = Self {
            state: ClusterQueueState::new(cluster_context.clone(), config.recent_dispatch_capacity),
            config,
            inbox,
            inbox_closed: false,
            shutting_down: false,
            dispatcher,
            completions,
            metrics: CourierMetrics::new(),
        };
        let task = tokio::spawn(actor.run());
        (ClusterQueueHandle { cluster_context, tx }, task)
    }

    async fn run(mut self) {
        info!(cluster = %self.state.cluster_context(), "Cluster queue started");
        loop {
            match self.run_generation().await {
                GenerationEnd::Compact => {
                    self.state.carry_forward();
                    let status = self.state.status();
                    info!(
                        cluster = %status.cluster_context,
                        generation = status.generation,
                        total_processed = status.total_processed,
                        pending = status.queue_size,
                        "Cluster queue restarted with carried state"
                    );
                }
                GenerationEnd::Stopped => break,
            }
        }
        let dropped = self.state.drain_pending();
        if !dropped.is_empty() {
            warn!(cluster = %self.state.cluster_context(), dropped = ?dropped, "Pending commands dropped at shutdown");
        }
        self.metrics.set_queue_depth(self.state.cluster_context(), 0);
        info!(cluster = %self.state.cluster_context(), "Cluster queue stopped");
    }

    async fn run_generation(&mut self) -> GenerationEnd {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Option<InFlight> = None;

        loop {
            if in_flight.is_none() {
                if self.shutting_down {
                    return GenerationEnd::Stopped;
                }
                if self.state.should_compact(self.config.compaction_threshold) {
                    return GenerationEnd::Compact;
                }
                if let Some(next) = self.state.start_next() {
                    in_flight = Some(self.launch(next));
                    self.report_depth();
                }
            }

            let event = tokio::select! {
                message = self.inbox.recv(), if !self.inbox_closed => Event::Message(message),
                joined = wait_in_flight(&mut in_flight) => Event::Finished(joined),
                _ = ticker.tick() => Event::Tick,
            };

            match event {
                Event::Message(Some(message)) => self.handle_message(message, in_flight.as_ref()),
                Event::Message(None) => {
                    debug!(cluster = %self.state.cluster_context(), "All queue handles dropped");
                    self.inbox_closed = true;
                    self.shutting_down = true;
                }
                Event::Finished(joined) => {
                    if let Some(flight) = in_flight.take() {
                        let response = match joined {
                            Ok(response) => response,
                            Err(e) => {
                                error!(
                                    cluster = %self.state.cluster_context(),
                                    alert_id = %flight.command.alert_id,
                                    error = %e,
                                    "Command task aborted"
                                );
                                CommandResponse::rejected(&flight.command, format!("execution aborted: {}", e))
                            }
                        };
                        self.complete(response);
                    }
                }
                Event::Tick => {
                    debug!(
                        cluster = %self.state.cluster_context(),
                        pending = self.state.len(),
                        executing = in_flight.is_some(),
                        "Queue poll"
                    );
                }
            }
        }
    }

    fn handle_message(&mut self, message: QueueMessage, in_flight: Option<&InFlight>) {
        match message {
            QueueMessage::Enqueue { command, reply } => {
                if self.shutting_down {
                    warn!(cluster = %self.state.cluster_context(), alert_id = %command.alert_id, "Queue shutting down, command ignored");
                    return;
                }
                let alert_id = command.alert_id.clone();
                let outcome = self.state.enqueue(command);
                match outcome {
                    EnqueueOutcome::Queued { position } => {
                        debug!(cluster = %self.state.cluster_context(), alert_id = %alert_id, position = position, "Command queued");
                        self.report_depth();
                    }
                    EnqueueOutcome::Duplicate => {
                        warn!(cluster = %self.state.cluster_context(), alert_id = %alert_id, "Duplicate command ignored");
                    }
                }
                let _ = reply.send(outcome);
            }
            QueueMessage::Cancel { alert_id, reply } => {
                let outcome = self.cancel(&alert_id, in_flight);
                let _ = reply.send(outcome);
            }
            QueueMessage::Status(reply) => {
                let _ = reply.send(self.state.status());
            }
            QueueMessage::Position { alert_id, reply } => {
                let _ = reply.send(self.state.position(&alert_id));
            }
            QueueMessage::Shutdown => {
                info!(
                    cluster = %self.state.cluster_context(),
                    pending = self.state.len(),
                    "Cluster queue shutting down"
                );
                self.shutting_down = true;
            }
        }
    }

    fn cancel(&mut self, alert_id: &str, in_flight: Option<&InFlight>) -> CancelOutcome {
        if let Some(flight) = in_flight.filter(|f| f.command.alert_id == alert_id) {
            info!(cluster = %self.state.cluster_context(), alert_id = %alert_id, "Cancelling executing command");
            flight.cancel.cancel();
            return CancelOutcome::Signalled;
        }
        match self.state.cancel_pending(alert_id) {
            Some(queued) => {
                info!(cluster = %self.state.cluster_context(), alert_id = %alert_id, "Cancelled waiting command");
                self.report_depth();
                let response = CommandResponse::cancelled(&queued.command, "cancelled before execution");
                self.state.record(&response);
                self.emit(response);
                CancelOutcome::Dequeued
            }
            None => CancelOutcome::NotFound,
        }
    }

    fn launch(&self, queued: QueuedCommand) -> InFlight {
        let dispatcher = self.dispatcher.clone();
        let command = queued.command.clone();
        info!(
            cluster = %self.state.cluster_context(),
            alert_id = %command.alert_id,
            kind = %command.kind,
            priority = command.priority,
            waited_ms = (Utc::now() - queued.queued_at).num_milliseconds(),
            "Executing command"
        );
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { dispatcher.dispatch(&command, &token).await });
        InFlight {
            command: queued.command,
            cancel,
            handle,
        }
    }

    fn complete(&mut self, response: CommandResponse) {
        self.state.finish(&response);
        self.emit(response);
    }

    fn emit(&self, response: CommandResponse) {
        self.metrics
            .inc_commands_completed(self.state.cluster_context(), response.status.as_str());
        if response.status != CommandStatus::Completed {
            warn!(
                cluster = %self.state.cluster_context(),
                alert_id = %response.alert_id,
                status = %response.status.as_str(),
                message = %response.message,
                "Command finished unsuccessfully"
            );
        }
        if self.completions.send(response).is_err() {
            warn!(cluster = %self.state.cluster_context(), "Coordinator gone, completion not reported");
        }
    }

    fn report_depth(&self) {
        self.metrics
            .set_queue_depth(self.state.cluster_context(), self.state.len());
    }
}
