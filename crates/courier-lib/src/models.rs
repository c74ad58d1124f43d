//! Data models for the crash dump courier
//!
//! Pod identities, crash dump artifacts, per-stage results and the
//! commands that flow through the cluster queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RoutingError;

/// Container that runs the database process in every pod.
pub const DEFAULT_CONTAINER: &str = "crate";

/// Immutable identity of a target pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub container: String,
    pub cluster_context: String,
}

impl PodRef {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        container: impl Into<String>,
        cluster_context: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            container: container.into(),
            cluster_context: cluster_context.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster_context, self.namespace, self.name)
    }
}

/// Kind of crash-diagnostic artifact found in a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DumpKind {
    /// The marker heap dump written by the JVM on heap exhaustion
    CriticalHeap,
    /// Any other heap dump next to the marker
    AdditionalHeap,
    /// A JFR flight recording
    FlightRecording,
}

impl DumpKind {
    /// Classify a sibling artifact by extension.
    ///
    /// Returns `None` for paths that are not dump artifacts.
    pub fn for_sibling(path: &str) -> Option<Self> {
        if path.ends_with(".hprof") {
            Some(DumpKind::AdditionalHeap)
        } else if path.ends_with(".jfr") {
            Some(DumpKind::FlightRecording)
        } else {
            None
        }
    }

    /// Suffix appended to the pod name to form the destination key.
    ///
    /// The critical heap always maps to the same key. Siblings carry their
    /// path below the heap dump directory, with `/` flattened to `-`.
    pub fn key_suffix(&self, relative_path: &str) -> String {
        let flattened = relative_path.trim_start_matches('/').replace('/', "-");
        match self {
            DumpKind::CriticalHeap => "java_pid1.hprof.gz".to_string(),
            DumpKind::AdditionalHeap => format!("heap-{}.gz", flattened),
            DumpKind::FlightRecording => format!("jfr-{}.gz", flattened),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DumpKind::CriticalHeap => "critical-heap",
            DumpKind::AdditionalHeap => "additional-heap",
            DumpKind::FlightRecording => "flight-recording",
        }
    }
}

impl fmt::Display for DumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A crash dump artifact discovered in a pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashDumpFile {
    pub pod_name: String,
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub kind: DumpKind,
}

impl CrashDumpFile {
    pub fn compressed_path(&self) -> String {
        format!("{}.gz", self.path)
    }

    /// Path below `base_dir`, or the full path when the file lies outside it.
    pub fn relative_path(&self, base_dir: &str) -> &str {
        let base = base_dir.trim_end_matches('/');
        self.path
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(&self.path)
    }
}

/// Size and modification time as reported by `stat` in the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub files: Vec<CrashDumpFile>,
    pub requires_upload: bool,
    pub message: String,
}

impl DiscoveryResult {
    /// Nothing to upload for this pod.
    pub fn nothing(message: impl Into<String>) -> Self {
        Self {
            files: Vec::new(),
            requires_upload: false,
            message: message.into(),
        }
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    pub original_path: String,
    pub compressed_path: String,
    pub original_size: u64,
    pub compressed_size: u64,
    /// compressed / original
    pub ratio: f64,
}

impl CompressionResult {
    pub fn new(file: &CrashDumpFile, compressed_path: String, compressed_size: u64) -> Self {
        let ratio = if file.size_bytes > 0 {
            compressed_size as f64 / file.size_bytes as f64
        } else {
            0.0
        };
        Self {
            original_path: file.path.clone(),
            compressed_path,
            original_size: file.size_bytes,
            compressed_size,
            ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    pub remote_key: String,
    pub size_bytes: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResult {
    pub fn failed(remote_key: impl Into<String>, size_bytes: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            remote_key: remote_key.into(),
            size_bytes,
            duration_ms: 0,
            error: Some(error.into()),
        }
    }
}

/// How an upload was confirmed before allowing deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMethod {
    HelperSelfReport,
    HelperReadBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub verified: bool,
    pub remote_key: String,
    pub method: VerificationMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    pub fn failed(
        remote_key: impl Into<String>,
        method: VerificationMethod,
        error: impl Into<String>,
    ) -> Self {
        Self {
            verified: false,
            remote_key: remote_key.into(),
            method,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionResult {
    pub deleted: bool,
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeletionResult {
    pub fn not_deleted(paths: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            deleted: false,
            paths,
            error: Some(error.into()),
        }
    }
}

/// Per-file aggregate across compress, upload, verify and delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOutcome {
    pub file: CrashDumpFile,
    pub compression: Option<CompressionResult>,
    pub upload: Option<UploadResult>,
    pub verification: Option<VerificationResult>,
    pub deletion: Option<DeletionResult>,
    pub success: bool,
    /// Failure that stopped the file before upload (compression or cancellation)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessingOutcome {
    pub fn new(
        file: CrashDumpFile,
        compression: Option<CompressionResult>,
        upload: Option<UploadResult>,
        verification: Option<VerificationResult>,
        deletion: Option<DeletionResult>,
    ) -> Self {
        let success = upload.as_ref().map(|u| u.success).unwrap_or(false)
            && verification.as_ref().map(|v| v.verified).unwrap_or(false)
            && deletion.as_ref().map(|d| d.deleted).unwrap_or(true);
        Self {
            file,
            compression,
            upload,
            verification,
            deletion,
            success,
            error: None,
        }
    }

    /// Outcome for a file that never reached the upload stage.
    pub fn stopped(file: CrashDumpFile, compression: Option<CompressionResult>, error: impl Into<String>) -> Self {
        let mut outcome = Self::new(file, compression, None, None, None);
        outcome.error = Some(error.into());
        outcome
    }

    /// Reason from the first stage that failed, if any.
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        match (&self.upload, &self.verification, &self.deletion) {
            (Some(u), _, _) if !u.success => Some(format!(
                "upload failed: {}",
                u.error.as_deref().unwrap_or("unknown error")
            )),
            (Some(_), Some(v), _) if !v.verified => Some(format!(
                "verification failed: {}",
                v.error.as_deref().unwrap_or("unknown error")
            )),
            (Some(_), None, _) => Some("verification did not run".to_string()),
            (_, _, Some(d)) if !d.deleted => Some(format!(
                "deletion failed: {}",
                d.error.as_deref().unwrap_or("unknown error")
            )),
            (None, _, _) => Some("upload did not run".to_string()),
            _ => None,
        }
    }
}

/// Outbound result of one crash dump pipeline invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub success: bool,
    pub processed_pods: Vec<String>,
    pub outcomes: Vec<ProcessingOutcome>,
    pub uploaded_files: Vec<UploadResult>,
    pub total_size_bytes: u64,
    pub errors: Vec<String>,
    pub message: String,
    pub duration_seconds: f64,
    pub cancelled: bool,
}

impl PipelineReport {
    pub fn upload_count(&self) -> usize {
        self.uploaded_files.len()
    }

    pub fn deletion_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.deletion.as_ref().map(|d| d.deleted).unwrap_or(false))
            .count()
    }

    pub fn total_uploaded_bytes(&self) -> u64 {
        self.uploaded_files.iter().map(|u| u.size_bytes).sum()
    }
}

/// Tag selecting the execution pipeline for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    ProbeTest,
    FlightRecording,
    HeapDumpUpload,
}

impl CommandKind {
    pub const ALL: [CommandKind; 3] = [
        CommandKind::ProbeTest,
        CommandKind::FlightRecording,
        CommandKind::HeapDumpUpload,
    ];

    /// Pipeline an alert should trigger.
    pub fn for_alert(alert_name: &str) -> Self {
        match alert_name {
            "CrateDBContainerRestart" => CommandKind::HeapDumpUpload,
            "CrateDBCloudNotResponsive" => CommandKind::FlightRecording,
            _ => CommandKind::ProbeTest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::ProbeTest => "probe-test",
            CommandKind::FlightRecording => "flight-recording",
            CommandKind::HeapDumpUpload => "heap-dump-upload",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RoutingError::UnsupportedCommandKind(s.to_string()))
    }
}

/// Priority for an alert: environment weight plus alert weight.
pub fn command_priority(alert_name: &str, namespace: &str) -> i32 {
    let mut priority = 0;
    if namespace.contains("prod") {
        priority += 10;
    } else if namespace.contains("staging") {
        priority += 5;
    }
    match alert_name {
        "CrateDBCloudNotResponsive" => priority += 20,
        "CrateDBContainerRestart" => priority += 10,
        _ => {}
    }
    priority
}

/// Which pods a command targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodSelector {
    /// Exact pod name
    Name(String),
    /// Label selector, e.g. `app=crate,cluster=abc`
    Labels(String),
}

impl PodSelector {
    pub fn is_empty(&self) -> bool {
        match self {
            PodSelector::Name(s) | PodSelector::Labels(s) => s.trim().is_empty(),
        }
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodSelector::Name(name) => write!(f, "pod {}", name),
            PodSelector::Labels(selector) => write!(f, "selector {}", selector),
        }
    }
}

/// A normalized request to run a pipeline against a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub alert_id: String,
    pub correlation_id: String,
    pub cluster_context: String,
    pub kind: CommandKind,
    pub namespace: String,
    pub pod_selector: PodSelector,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Command {
    /// Build a command from an alert, deriving kind and priority from the alert name.
    pub fn from_alert(
        alert_name: &str,
        alert_id: impl Into<String>,
        correlation_id: Option<String>,
        cluster_context: impl Into<String>,
        namespace: impl Into<String>,
        pod_selector: PodSelector,
        labels: BTreeMap<String, String>,
    ) -> Self {
        let alert_id = alert_id.into();
        let namespace = namespace.into();
        let created_at = Utc::now();
        let correlation_id = correlation_id
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| format!("{}-{}", alert_id, created_at.timestamp_millis()));
        Self {
            priority: command_priority(alert_name, &namespace),
            kind: CommandKind::for_alert(alert_name),
            alert_id,
            correlation_id,
            cluster_context: cluster_context.into(),
            namespace,
            pod_selector,
            labels,
            created_at,
        }
    }

    pub fn validate(&self) -> Result<(), RoutingError> {
        let missing = if self.alert_id.trim().is_empty() {
            Some("alertId")
        } else if self.cluster_context.trim().is_empty() {
            Some("clusterContext")
        } else if self.namespace.trim().is_empty() {
            Some("namespace")
        } else if self.pod_selector.is_empty() {
            Some("podSelector")
        } else {
            None
        };
        match missing {
            Some(field) => Err(RoutingError::InvalidCommand(format!("{} must not be empty", field))),
            None => Ok(()),
        }
    }

    /// Container to exec into, overridable through the `container` label.
    pub fn container(&self) -> &str {
        self.labels
            .get("container")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONTAINER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Completed,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of dispatching one command, reported back to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub alert_id: String,
    pub correlation_id: String,
    pub cluster_context: String,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub success: bool,
    pub message: String,
    pub execution_id: String,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PipelineReport>,
}

impl CommandResponse {
    /// A failed response for a command that never ran.
    pub fn rejected(command: &Command, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            alert_id: command.alert_id.clone(),
            correlation_id: command.correlation_id.clone(),
            cluster_context: command.cluster_context.clone(),
            kind: command.kind,
            status: CommandStatus::Failed,
            success: false,
            message: message.into(),
            execution_id: String::new(),
            attempts: 0,
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            report: None,
        }
    }

    /// A cancelled response for a command taken off the queue before it ran.
    pub fn cancelled(command: &Command, message: impl Into<String>) -> Self {
        let mut response = Self::rejected(command, message);
        response.status = CommandStatus::Cancelled;
        response
    }
}
