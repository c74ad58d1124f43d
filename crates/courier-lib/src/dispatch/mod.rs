//! Command dispatch
//!
//! A fixed table from [`CommandKind`] to handler. Each dispatch is its own
//! execution with an id, a retry policy and heartbeat supervision.

mod handlers;

pub use handlers::{
    FlightRecordingConfig, FlightRecordingHandler, HeapDumpHandler, NamedPodResolver, PodResolver,
    ProbeTestHandler,
};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::models::{Command, CommandKind, CommandResponse, CommandStatus, PipelineReport};
use crate::runtime::{retry_with, supervise, ActivityContext, RetryPolicy};

/// What a handler produced for one attempt
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub success: bool,
    pub message: String,
    pub report: Option<PipelineReport>,
}

/// Executes one kind of command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command, ctx: &ActivityContext) -> Result<HandlerOutcome, HandlerError>;
}

/// Retry and liveness settings for a registered handler
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub retry: RetryPolicy,
    /// Attempts without a heartbeat for this long are cancelled and retried
    pub heartbeat_timeout: Duration,
}

impl HandlerSettings {
    pub fn for_kind(kind: CommandKind) -> Self {
        match kind {
            CommandKind::ProbeTest => Self {
                retry: RetryPolicy::standard(),
                heartbeat_timeout: Duration::from_secs(120),
            },
            CommandKind::FlightRecording => Self {
                retry: RetryPolicy::standard(),
                heartbeat_timeout: Duration::from_secs(300),
            },
            // stages retry internally; the whole pipeline gets one more go
            CommandKind::HeapDumpUpload => Self {
                retry: RetryPolicy {
                    max_attempts: 2,
                    ..RetryPolicy::standard()
                },
                heartbeat_timeout: Duration::from_secs(300),
            },
        }
    }
}

struct Registered {
    handler: Arc<dyn CommandHandler>,
    settings: HandlerSettings,
}

#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<CommandKind, Registered>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self, kind: CommandKind, handler: Arc<dyn CommandHandler>) -> Self {
        self.register_with(kind, handler, HandlerSettings::for_kind(kind))
    }

    pub fn register_with(
        mut self,
        kind: CommandKind,
        handler: Arc<dyn CommandHandler>,
        settings: HandlerSettings,
    ) -> Self {
        self.handlers.insert(kind, Registered { handler, settings });
        self
    }

    pub fn supports(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn supported_kinds(&self) -> Vec<CommandKind> {
        CommandKind::ALL
            .into_iter()
            .filter(|k| self.supports(*k))
            .collect()
    }

    /// Run `command` to a terminal status. `cancel` aborts between remote calls.
    pub async fn dispatch(&self, command: &Command, cancel: &CancellationToken) -> CommandResponse {
        let started_at = Utc::now();
        let clock = Instant::now();
        let execution_id = format!(
            "{}-{}-{}",
            command.kind,
            command.alert_id,
            started_at.timestamp_millis()
        );

        let entry = match self.handlers.get(&command.kind) {
            Some(entry) => entry,
            None => {
                warn!(kind = %command.kind, alert_id = %command.alert_id, "No handler registered");
                let mut response = CommandResponse::rejected(
                    command,
                    format!("unsupported command kind: {}", command.kind),
                );
                response.execution_id = execution_id;
                return response;
            }
        };

        info!(
            execution_id = %execution_id,
            cluster = %command.cluster_context,
            alert_id = %command.alert_id,
            kind = %command.kind,
            "Dispatching command"
        );

        let timeout = entry.settings.heartbeat_timeout;
        let exec_id = execution_id.as_str();
        let (result, attempts) = retry_with(
            &entry.settings.retry,
            cancel,
            exec_id,
            move |attempt| {
                let ctx = ActivityContext::child_of(format!("{}#{}", exec_id, attempt), cancel);
                async move {
                    let result = supervise(&ctx, timeout, entry.handler.handle(command, &ctx)).await;
                    if ctx.is_cancelled() {
                        if cancel.is_cancelled() {
                            return Err(HandlerError::Cancelled);
                        }
                        return Err(HandlerError::Stalled(timeout));
                    }
                    result
                }
            },
            |r| matches!(r, Err(e) if e.is_retryable()),
        )
        .await;

        let (status, success, message, report) = match result {
            Ok(outcome) => (
                if outcome.success {
                    CommandStatus::Completed
                } else {
                    CommandStatus::Failed
                },
                outcome.success,
                outcome.message,
                outcome.report,
            ),
            Err(HandlerError::Cancelled) => (CommandStatus::Cancelled, false, "cancelled".to_string(), None),
            Err(e) => (CommandStatus::Failed, false, e.to_string(), None),
        };

        CommandResponse {
            alert_id: command.alert_id.clone(),
            correlation_id: command.correlation_id.clone(),
            cluster_context: command.cluster_context.clone(),
            kind: command.kind,
            status,
            success,
            message,
            execution_id,
            attempts,
            started_at,
            completed_at: Utc::now(),
            duration_seconds: clock.elapsed().as_secs_f64(),
            report,
        }
    }
}
