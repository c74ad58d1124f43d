//! Observability infrastructure for the courier
//!
//! Provides:
//! - Prometheus metrics (routing, queue depth, uploads, deletions, pipeline latency)
//! - Structured lifecycle events with a stable `event` field

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{CommandResponse, PodRef};

/// Pipeline runs range from seconds (nothing found) to hours (large dumps)
const PIPELINE_BUCKETS: &[f64] = &[
    0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0,
];

static GLOBAL_METRICS: OnceLock<CourierMetricsInner> = OnceLock::new();

struct CourierMetricsInner {
    commands_routed: IntCounterVec,
    commands_rejected: IntCounterVec,
    commands_duplicate: IntCounterVec,
    commands_completed: IntCounterVec,
    queue_depth: IntGaugeVec,
    queue_restarts: IntCounterVec,
    files_uploaded: IntCounter,
    bytes_uploaded: IntCounter,
    files_deleted: IntCounter,
    deletion_refusals: IntCounter,
    pipeline_duration_seconds: Histogram,
}

impl CourierMetricsInner {
    fn new() -> Self {
        Self {
            commands_routed: register_int_counter_vec!(
                "courier_commands_routed_total",
                "Commands routed to a cluster queue",
                &["cluster", "kind"]
            )
            .expect("Failed to register commands_routed"),

            commands_rejected: register_int_counter_vec!(
                "courier_commands_rejected_total",
                "Commands rejected at routing time",
                &["reason"]
            )
            .expect("Failed to register commands_rejected"),

            commands_duplicate: register_int_counter_vec!(
                "courier_commands_duplicate_total",
                "Commands ignored because the alert id was already known to the queue",
                &["cluster"]
            )
            .expect("Failed to register commands_duplicate"),

            commands_completed: register_int_counter_vec!(
                "courier_commands_completed_total",
                "Commands that reached a terminal status",
                &["cluster", "status"]
            )
            .expect("Failed to register commands_completed"),

            queue_depth: register_int_gauge_vec!(
                "courier_queue_depth",
                "Commands waiting in a cluster queue",
                &["cluster"]
            )
            .expect("Failed to register queue_depth"),

            queue_restarts: register_int_counter_vec!(
                "courier_queue_restarts_total",
                "Cluster queue actors restarted after terminating",
                &["cluster"]
            )
            .expect("Failed to register queue_restarts"),

            files_uploaded: register_int_counter!(
                "courier_files_uploaded_total",
                "Crash dump files uploaded"
            )
            .expect("Failed to register files_uploaded"),

            bytes_uploaded: register_int_counter!(
                "courier_bytes_uploaded_total",
                "Compressed bytes uploaded"
            )
            .expect("Failed to register bytes_uploaded"),

            files_deleted: register_int_counter!(
                "courier_files_deleted_total",
                "Crash dump files deleted after verified upload"
            )
            .expect("Failed to register files_deleted"),

            deletion_refusals: register_int_counter!(
                "courier_deletion_refusals_total",
                "Deletions refused or unconfirmed"
            )
            .expect("Failed to register deletion_refusals"),

            pipeline_duration_seconds: register_histogram!(
                "courier_pipeline_duration_seconds",
                "Wall time of one crash dump pipeline run",
                PIPELINE_BUCKETS.to_vec()
            )
            .expect("Failed to register pipeline_duration_seconds"),
        }
    }
}

/// Handle to the global courier metrics; clones share the same registry entries.
#[derive(Clone)]
pub struct CourierMetrics {
    _private: (),
}

impl Default for CourierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CourierMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(CourierMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &CourierMetricsInner {
        GLOBAL_METRICS.get_or_init(CourierMetricsInner::new)
    }

    pub fn inc_commands_routed(&self, cluster: &str, kind: &str) {
        self.inner().commands_routed.with_label_values(&[cluster, kind]).inc();
    }

    pub fn inc_commands_rejected(&self, reason: &str) {
        self.inner().commands_rejected.with_label_values(&[reason]).inc();
    }

    pub fn inc_commands_duplicate(&self, cluster: &str) {
        self.inner().commands_duplicate.with_label_values(&[cluster]).inc();
    }

    pub fn inc_commands_completed(&self, cluster: &str, status: &str) {
        self.inner()
            .commands_completed
            .with_label_values(&[cluster, status])
            .inc();
    }

    pub fn set_queue_depth(&self, cluster: &str, depth: usize) {
        self.inner()
            .queue_depth
            .with_label_values(&[cluster])
            .set(depth as i64);
    }

    pub fn inc_queue_restarts(&self, cluster: &str) {
        self.inner().queue_restarts.with_label_values(&[cluster]).inc();
    }

    pub fn inc_files_uploaded(&self, bytes: u64) {
        self.inner().files_uploaded.inc();
        self.inner().bytes_uploaded.inc_by(bytes);
    }

    pub fn inc_files_deleted(&self) {
        self.inner().files_deleted.inc();
    }

    pub fn inc_deletion_refusals(&self) {
        self.inner().deletion_refusals.inc();
    }

    pub fn observe_pipeline_duration(&self, secs: f64) {
        self.inner().pipeline_duration_seconds.observe(secs);
    }
}

/// Operator-facing lifecycle events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, clusters: &[String]) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            version = %version,
            clusters = ?clusters,
            "Crash dump courier started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Crash dump courier shutting down"
        );
    }

    pub fn log_command_routed(&self, cluster: &str, alert_id: &str, kind: &str, priority: i32) {
        info!(
            event = "command_routed",
            instance = %self.instance,
            cluster = %cluster,
            alert_id = %alert_id,
            kind = %kind,
            priority = priority,
            "Command routed to cluster queue"
        );
    }

    pub fn log_command_rejected(&self, cluster: &str, alert_id: &str, reason: &str) {
        warn!(
            event = "command_rejected",
            instance = %self.instance,
            cluster = %cluster,
            alert_id = %alert_id,
            reason = %reason,
            "Command rejected"
        );
    }

    pub fn log_command_completed(&self, response: &CommandResponse) {
        if response.success {
            info!(
                event = "command_completed",
                instance = %self.instance,
                cluster = %response.cluster_context,
                alert_id = %response.alert_id,
                execution_id = %response.execution_id,
                kind = %response.kind,
                attempts = response.attempts,
                duration_secs = response.duration_seconds,
                "Command completed"
            );
        } else {
            warn!(
                event = "command_completed",
                instance = %self.instance,
                cluster = %response.cluster_context,
                alert_id = %response.alert_id,
                execution_id = %response.execution_id,
                kind = %response.kind,
                status = ?response.status,
                attempts = response.attempts,
                message = %response.message,
                "Command did not succeed"
            );
        }
    }

    pub fn log_file_deleted(&self, pod: &PodRef, paths: &[String], remote_key: &str) {
        info!(
            event = "file_deleted",
            instance = %self.instance,
            cluster = %pod.cluster_context,
            namespace = %pod.namespace,
            pod = %pod.name,
            paths = ?paths,
            remote_key = %remote_key,
            "Crash dump deleted after verified upload"
        );
    }

    pub fn log_deletion_refused(&self, pod: &PodRef, path: &str, reason: &str) {
        warn!(
            event = "deletion_refused",
            instance = %self.instance,
            cluster = %pod.cluster_context,
            namespace = %pod.namespace,
            pod = %pod.name,
            path = %path,
            reason = %reason,
            "Crash dump kept in place"
        );
    }
}
