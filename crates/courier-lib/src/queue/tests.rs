use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::dispatch::{CommandHandler, DispatchTable, HandlerOutcome};
use crate::error::{HandlerError, RoutingError};
use crate::models::{Command, CommandKind, CommandResponse, CommandStatus};
use crate::observability::StructuredLogger;
use crate::runtime::ActivityContext;
use crate::testing::command;

/// Records execution order and concurrency; optionally holds one alert until released
#[derive(Default)]
struct Recorder {
    order: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    gated: Option<String>,
    started: Notify,
    release: Notify,
    delay: Duration,
}

impl Recorder {
    fn gated(alert_id: &str) -> Self {
        Self {
            gated: Some(alert_id.to_string()),
            ..Default::default()
        }
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandHandler for Recorder {
    async fn handle(&self, command: &Command, ctx: &ActivityContext) -> Result<HandlerOutcome, HandlerError> {
        self.order.lock().unwrap().push(command.alert_id.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if self.gated.as_deref() == Some(command.alert_id.as_str()) {
            self.started.notify_one();
            tokio::select! {
                _ = self.release.notified() => {}
                _ = ctx.token().cancelled() => {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return Err(HandlerError::Cancelled);
                }
            }
        } else if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(HandlerOutcome {
            success: command.alert_id != "fails",
            message: format!("handled {}", command.alert_id),
            report: None,
        })
    }
}

fn table(recorder: &Arc<Recorder>) -> Arc<DispatchTable> {
    Arc::new(DispatchTable::new().register(CommandKind::ProbeTest, recorder.clone()))
}

fn probe(alert_id: &str, priority: i32) -> Command {
    command(alert_id, CommandKind::ProbeTest, priority)
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<CommandResponse>, n: usize) -> Vec<CommandResponse> {
    let mut responses = Vec::with_capacity(n);
    while responses.len() < n {
        let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("completion channel closed");
        responses.push(response);
    }
    responses
}

fn fast_queue() -> QueueConfig {
    QueueConfig {
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

// ---- state machine ----

#[test]
fn test_duplicate_alert_within_one_tick_keeps_one_entry() {
    let mut state = ClusterQueueState::new("c1", 16);
    assert_eq!(state.enqueue(probe("A1", 0)), EnqueueOutcome::Queued { position: 1 });
    assert_eq!(state.enqueue(probe("A1", 0)), EnqueueOutcome::Duplicate);
    assert_eq!(state.len(), 1);
}

#[test]
fn test_priority_order_with_fifo_tie_break() {
    let mut state = ClusterQueueState::new("c1", 16);
    state.enqueue(probe("low-1", 0));
    state.enqueue(probe("high-1", 10));
    state.enqueue(probe("low-2", 0));
    assert_eq!(state.enqueue(probe("high-2", 10)), EnqueueOutcome::Queued { position: 2 });
    state.enqueue(probe("urgent", 30));

    let mut order = Vec::new();
    while let Some(next) = state.start_next() {
        let response = CommandResponse::rejected(&next.command, "done");
        order.push(next.command.alert_id);
        state.finish(&response);
    }
    assert_eq!(order, vec!["urgent", "high-1", "high-2", "low-1", "low-2"]);
}

#[test]
fn test_single_execution_slot() {
    let mut state = ClusterQueueState::new("c1", 16);
    state.enqueue(probe("A1", 0));
    state.enqueue(probe("A2", 0));
    assert!(state.start_next().is_some());
    assert!(state.start_next().is_none());
    assert_eq!(state.status().currently_executing.as_deref(), Some("A1"));
}

#[test]
fn test_executing_and_recent_alerts_are_duplicates() {
    let mut state = ClusterQueueState::new("c1", 16);
    state.enqueue(probe("A1", 0));
    let running = state.start_next().unwrap();
    assert_eq!(state.enqueue(probe("A1", 0)), EnqueueOutcome::Duplicate);

    state.finish(&CommandResponse::rejected(&running.command, "done"));
    assert_eq!(state.enqueue(probe("A1", 0)), EnqueueOutcome::Duplicate);
}

#[test]
fn test_recent_dispatch_memory_is_bounded() {
    let mut state = ClusterQueueState::new("c1", 2);
    for id in ["A1", "A2", "A3"] {
        state.enqueue(probe(id, 0));
        let next = state.start_next().unwrap();
        state.finish(&CommandResponse::rejected(&next.command, "done"));
    }
    assert!(!state.is_known("A1"));
    assert!(state.is_known("A3"));
}

#[test]
fn test_position_reporting() {
    let mut state = ClusterQueueState::new("c1", 16);
    state.enqueue(probe("A1", 0));
    state.enqueue(probe("A2", 5));
    state.enqueue(probe("A3", 0));
    state.start_next();

    assert_eq!(state.position("A2").position, Some(0));
    let a3 = state.position("A3");
    assert!(a3.found);
    assert_eq!(a3.position, Some(2));
    assert_eq!(a3.priority, Some(0));
    assert!(!state.position("A9").found);
}

#[test]
fn test_carry_forward_keeps_counters_and_pending() {
    let mut state = ClusterQueueState::new("c1", 16);
    for id in ["A1", "A2", "A3", "A4"] {
        state.enqueue(probe(id, 0));
    }
    for _ in 0..3 {
        let next = state.start_next().unwrap();
        let mut response = CommandResponse::rejected(&next.command, "boom");
        response.success = next.command.alert_id != "A2";
        state.finish(&response);
    }
    assert!(state.should_compact(2));
    let started_at = state.status().started_at;

    state.carry_forward();
    let status = state.status();
    assert!(!state.should_compact(2));
    assert_eq!(status.generation, 1);
    assert_eq!(status.total_processed, 3);
    assert_eq!(status.total_failed, 1);
    assert_eq!(status.queue_size, 1);
    assert_eq!(status.started_at, started_at);
    assert_eq!(state.cluster_context(), "c1");
}

// ---- queue actor ----

#[tokio::test]
async fn test_duplicate_alert_dispatched_exactly_once() {
    let recorder = Arc::new(Recorder::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (queue, _task) = ClusterQueue::spawn("c1", fast_queue(), table(&recorder), tx);

    assert_eq!(
        queue.enqueue(probe("A1", 0)).await.unwrap(),
        EnqueueOutcome::Queued { position: 1 }
    );
    assert_eq!(queue.enqueue(probe("A1", 0)).await.unwrap(), EnqueueOutcome::Duplicate);
    assert_ok!(queue.enqueue(probe("A2", 0)).await);

    let responses = collect(&mut rx, 2).await;
    assert!(responses.iter().all(|r| r.status == CommandStatus::Completed));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(recorder.order(), vec!["A1", "A2"]);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_one() {
    let recorder = Arc::new(Recorder {
        delay: Duration::from_millis(10),
        ..Default::default()
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (queue, _task) = ClusterQueue::spawn("c1", fast_queue(), table(&recorder), tx);

    for i in 0..5 {
        queue.enqueue(probe(&format!("A{}", i), i)).await.unwrap();
    }
    collect(&mut rx, 5).await;
    assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_higher_priority_runs_first_once_slot_frees() {
    let recorder = Arc::new(Recorder::gated("first"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (queue, _task) = ClusterQueue::spawn("c1", fast_queue(), table(&recorder), tx);

    queue.enqueue(probe("first", 0)).await.unwrap();
    recorder.started.notified().await;

    queue.enqueue(probe("low", 0)).await.unwrap();
    queue.enqueue(probe("high", 10)).await.unwrap();
    let status = queue.status().await.unwrap();
    assert_eq!(status.queue_size, 2);
    assert_eq!(status.currently_executing.as_deref(), Some("first"));
    assert_eq!(queue.position("high").await.unwrap().position, Some(1));

    recorder.release.notify_one();
    collect(&mut rx, 3).await;
    assert_eq!(recorder.order(), vec!["first", "high", "low"]);
}

#[tokio::test]
async fn test_compaction_carries_state_forward() {
    let recorder = Arc::new(Recorder::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = QueueConfig {
        compaction_threshold: 2,
        ..fast_queue()
    };
    let (queue, _task) = ClusterQueue::spawn("c1", config, table(&recorder), tx);

    for id in ["A1", "A2", "A3", "fails", "A5"] {
        queue.enqueue(probe(id, 0)).await.unwrap();
    }
    collect(&mut rx, 5).await;

    let status = queue.status().await.unwrap();
    assert_eq!(status.generation, 1);
    assert_eq!(status.total_processed, 5);
    assert_eq!(status.total_failed, 1);
    assert!(status.last_error.unwrap().contains("fails"));
    assert_eq!(status.cluster_context, "c1");
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_and_drops_pending() {
    let recorder = Arc::new(Recorder::gated("first"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (queue, task) = ClusterQueue::spawn("c1", fast_queue(), table(&recorder), tx);

    queue.enqueue(probe("first", 0)).await.unwrap();
    recorder.started.notified().await;
    queue.enqueue(probe("second", 0)).await.unwrap();
    queue.enqueue(probe("third", 0)).await.unwrap();
    queue.shutdown().await.unwrap();

    recorder.release.notify_one();
    task.await.unwrap();

    let done = collect(&mut rx, 1).await;
    assert_eq!(done[0].alert_id, "first");
    assert_eq!(done[0].status, CommandStatus::Completed);
    assert!(rx.recv().await.is_none());
    assert_eq!(recorder.order(), vec!["first"]);
    assert!(queue.is_closed());
    assert_eq!(
        queue.enqueue(probe("late", 0)).await.unwrap_err(),
        RoutingError::QueueUnavailable("c1".into())
    );
}

#[tokio::test]
async fn test_cancel_executing_command_reports_cancelled() {
    let recorder = Arc::new(Recorder::gated("long"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (queue, _task) = ClusterQueue::spawn("c1", fast_queue(), table(&recorder), tx);

    queue.enqueue(probe("long", 0)).await.unwrap();
    recorder.started.notified().await;
    queue.enqueue(probe("next", 0)).await.unwrap();

    assert_eq!(queue.cancel("long").await.unwrap(), CancelOutcome::Signalled);
    let responses = collect(&mut rx, 2).await;
    assert_eq!(responses[0].alert_id, "long");
    assert_eq!(responses[0].status, CommandStatus::Cancelled);
    assert!(!responses[0].success);
    assert_eq!(responses[0].attempts, 1);
    assert_eq!(responses[1].alert_id, "next");
    assert_eq!(responses[1].status, CommandStatus::Completed);

    let status = queue.status().await.unwrap();
    assert_eq!(status.total_processed, 2);
    assert_eq!(status.total_cancelled, 1);
    assert_eq!(status.total_failed, 0);
}

#[tokio::test]
async fn test_cancel_waiting_command_never_runs_it() {
    let recorder = Arc::new(Recorder::gated("first"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (queue, _task) = ClusterQueue::spawn("c1", fast_queue(), table(&recorder), tx);

    queue.enqueue(probe("first", 0)).await.unwrap();
    recorder.started.notified().await;
    queue.enqueue(probe("waiting", 0)).await.unwrap();

    assert_eq!(queue.cancel("waiting").await.unwrap(), CancelOutcome::Dequeued);
    assert_eq!(queue.cancel("unknown").await.unwrap(), CancelOutcome::NotFound);
    let cancelled = collect(&mut rx, 1).await;
    assert_eq!(cancelled[0].alert_id, "waiting");
    assert_eq!(cancelled[0].status, CommandStatus::Cancelled);
    assert_eq!(cancelled[0].attempts, 0);
    assert_eq!(queue.enqueue(probe("waiting", 0)).await.unwrap(), EnqueueOutcome::Duplicate);

    recorder.release.notify_one();
    collect(&mut rx, 1).await;
    assert_eq!(recorder.order(), vec!["first"]);
    assert_eq!(queue.status().await.unwrap().queue_size, 0);
}

// ---- coordinator ----

fn coordinator_config(clusters: &[&str]) -> CoordinatorConfig {
    CoordinatorConfig {
        clusters: clusters.iter().map(|c| c.to_string()).collect(),
        drain_poll_interval: Duration::from_millis(10),
        queue: fast_queue(),
        ..Default::default()
    }
}

async fn wait_processed(handle: &CoordinatorHandle, n: u64) -> CoordinatorStatus {
    for _ in 0..500 {
        let status = handle.status().await.unwrap();
        if status.total_processed >= n {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("coordinator never processed {} commands", n);
}

#[tokio::test]
async fn test_routes_to_owning_cluster() {
    let recorder = Arc::new(Recorder::default());
    let (handle, task) = Coordinator::spawn(
        coordinator_config(&["c1", "c2"]),
        table(&recorder),
        StructuredLogger::new("test"),
    );

    assert_ok!(handle.route(probe("A1", 0)).await);
    let mut other = probe("B1", 0);
    other.cluster_context = "c2".into();
    assert_ok!(handle.route(other).await);
    assert_ok!(handle.route(probe("fails", 0)).await);

    let status = wait_processed(&handle, 3).await;
    assert!(status.is_running);
    assert_eq!(status.supported_clusters, vec!["c1", "c2"]);
    assert_eq!(status.total_routed, 3);
    assert_eq!(status.total_failed, 1);
    assert_eq!(status.clusters["c1"].total_processed, 2);
    assert_eq!(status.clusters["c2"].total_processed, 1);

    handle.shutdown("test").await.unwrap();
    let final_status = task.await.unwrap();
    assert!(!final_status.is_running);
    assert_eq!(final_status.total_processed, 3);
}

#[tokio::test]
async fn test_rejections_leave_coordinator_running() {
    let recorder = Arc::new(Recorder::default());
    let (handle, task) = Coordinator::spawn(
        coordinator_config(&["c1"]),
        table(&recorder),
        StructuredLogger::new("test"),
    );

    let mut unknown_cluster = probe("A1", 0);
    unknown_cluster.cluster_context = "c9".into();
    assert_eq!(
        handle.route(unknown_cluster).await.unwrap_err(),
        RoutingError::UnsupportedCluster("c9".into())
    );

    let unsupported_kind = command("A2", CommandKind::FlightRecording, 0);
    assert_eq!(
        handle.route(unsupported_kind).await.unwrap_err(),
        RoutingError::UnsupportedCommandKind("flight-recording".into())
    );

    let mut invalid = probe("A3", 0);
    invalid.namespace = String::new();
    let err = assert_err!(handle.route(invalid).await);
    assert!(matches!(err, RoutingError::InvalidCommand(_)));

    assert_ok!(handle.route(probe("A4", 0)).await);
    let status = wait_processed(&handle, 1).await;
    assert!(status.is_running);
    assert_eq!(status.total_routed, 1);
    assert_eq!(recorder.order(), vec!["A4"]);

    handle.shutdown("test").await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_history_compaction() {
    let recorder = Arc::new(Recorder::default());
    let config = CoordinatorConfig {
        history_threshold: 4,
        ..coordinator_config(&["c1"])
    };
    let (handle, task) = Coordinator::spawn(config, table(&recorder), StructuredLogger::new("test"));

    for i in 0..6 {
        handle.route(probe(&format!("A{}", i), 0)).await.unwrap();
    }
    let status = wait_processed(&handle, 6).await;
    assert_eq!(status.history_size, 3);
    assert_eq!(status.generation, 1);
    assert_eq!(status.total_routed, 6);

    handle.shutdown("test").await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_duplicates_are_counted_apart_from_routed() {
    let recorder = Arc::new(Recorder::default());
    let (handle, task) = Coordinator::spawn(
        coordinator_config(&["c1"]),
        table(&recorder),
        StructuredLogger::new("test"),
    );

    assert_eq!(
        handle.route(probe("A1", 0)).await.unwrap(),
        EnqueueOutcome::Queued { position: 1 }
    );
    wait_processed(&handle, 1).await;
    assert_eq!(handle.route(probe("A1", 0)).await.unwrap(), EnqueueOutcome::Duplicate);
    assert_ok!(handle.route(probe("A2", 0)).await);

    let status = wait_processed(&handle, 2).await;
    assert_eq!(status.total_routed, 2);
    assert_eq!(status.total_duplicates, 1);
    assert_eq!(status.history_size, 2);
    let ids: Vec<&str> = status.recent_history.iter().map(|e| e.alert_id.as_str()).collect();
    assert_eq!(ids, vec!["A2", "A1"]);
    assert_eq!(recorder.order(), vec!["A1", "A2"]);

    handle.shutdown("test").await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_during_shutdown_stops_in_flight_command() {
    let recorder = Arc::new(Recorder::gated("long"));
    let (handle, task) = Coordinator::spawn(
        coordinator_config(&["c1"]),
        table(&recorder),
        StructuredLogger::new("test"),
    );

    handle.route(probe("long", 0)).await.unwrap();
    recorder.started.notified().await;
    handle.shutdown("maintenance").await.unwrap();

    assert_eq!(
        handle.cancel("c9", "long").await.unwrap_err(),
        RoutingError::UnsupportedCluster("c9".into())
    );
    assert_eq!(handle.cancel("c1", "long").await.unwrap(), CancelOutcome::Signalled);

    let final_status = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("coordinator did not drain")
        .unwrap();
    assert_eq!(final_status.total_processed, 1);
    assert_eq!(final_status.total_cancelled, 1);
    assert_eq!(final_status.total_failed, 0);
    assert_eq!(final_status.recent_history[0].status, Some(CommandStatus::Cancelled));
}

#[tokio::test]
async fn test_shutdown_stops_routing_without_interrupting_execution() {
    let recorder = Arc::new(Recorder::gated("long"));
    let (handle, task) = Coordinator::spawn(
        coordinator_config(&["c1"]),
        table(&recorder),
        StructuredLogger::new("test"),
    );

    handle.route(probe("long", 0)).await.unwrap();
    recorder.started.notified().await;
    handle.shutdown("maintenance").await.unwrap();

    assert_eq!(
        handle.route(probe("late", 0)).await.unwrap_err(),
        RoutingError::ShuttingDown
    );
    assert!(!task.is_finished());

    recorder.release.notify_one();
    let final_status = task.await.unwrap();
    assert_eq!(final_status.total_processed, 1);
    assert_eq!(final_status.total_failed, 0);
    assert_eq!(recorder.order(), vec!["long"]);
    assert_eq!(handle.status().await.unwrap_err(), RoutingError::CoordinatorUnavailable);
}
