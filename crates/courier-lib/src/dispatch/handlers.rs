//! Handlers for the three command kinds and pod resolution

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{CommandHandler, HandlerOutcome};
use crate::error::HandlerError;
use crate::exec::{ExecRequest, RemoteExecutor};
use crate::models::{Command, PodRef, PodSelector};
use crate::pipeline::CrashDumpPipeline;
use crate::runtime::{with_heartbeats, ActivityContext};

/// Turns a command's pod selector into concrete pods
#[async_trait]
pub trait PodResolver: Send + Sync {
    async fn resolve(&self, command: &Command) -> Result<Vec<PodRef>, HandlerError>;
}

/// Resolves exact pod names only; label selectors need cluster access.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedPodResolver;

#[async_trait]
impl PodResolver for NamedPodResolver {
    async fn resolve(&self, command: &Command) -> Result<Vec<PodRef>, HandlerError> {
        match &command.pod_selector {
            PodSelector::Name(name) => Ok(vec![PodRef::new(
                name.clone(),
                command.namespace.clone(),
                command.container(),
                command.cluster_context.clone(),
            )]),
            PodSelector::Labels(selector) => Err(HandlerError::Resolution(format!(
                "label selector {} cannot be resolved without cluster access",
                selector
            ))),
        }
    }
}

async fn resolve_pods(resolver: &dyn PodResolver, command: &Command) -> Result<Vec<PodRef>, HandlerError> {
    let pods = resolver.resolve(command).await?;
    if pods.is_empty() {
        return Err(HandlerError::NoPods(command.pod_selector.to_string()));
    }
    Ok(pods)
}

/// Connectivity probe in every selected pod
pub struct ProbeTestHandler {
    executor: Arc<dyn RemoteExecutor>,
    resolver: Arc<dyn PodResolver>,
    timeout: Duration,
}

impl ProbeTestHandler {
    pub fn new(executor: Arc<dyn RemoteExecutor>, resolver: Arc<dyn PodResolver>) -> Self {
        Self {
            executor,
            resolver,
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl CommandHandler for ProbeTestHandler {
    async fn handle(&self, command: &Command, ctx: &ActivityContext) -> Result<HandlerOutcome, HandlerError> {
        let pods = resolve_pods(self.resolver.as_ref(), command).await?;
        let mut results = Vec::with_capacity(pods.len());
        let mut all_ok = true;

        for pod in &pods {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            ctx.heartbeat("probing");
            let output = self
                .executor
                .exec(pod, &ExecRequest::new(["uname", "-a"]).timeout(self.timeout))
                .await?;
            if output.success() {
                results.push(format!("{}: ok ({})", pod.name, output.stdout.trim()));
            } else {
                all_ok = false;
                results.push(format!(
                    "{}: exit {} ({})",
                    pod.name,
                    output.exit_code,
                    output.stderr.trim()
                ));
            }
        }

        info!(alert_id = %command.alert_id, pods = pods.len(), success = all_ok, "Probe test finished");
        Ok(HandlerOutcome {
            success: all_ok,
            message: results.join("; "),
            report: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FlightRecordingConfig {
    /// Command template; `{dir}`, `{pod}` and `{alert_id}` are substituted
    pub argv: Vec<String>,
    pub output_dir: String,
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for FlightRecordingConfig {
    fn default() -> Self {
        Self {
            argv: ["jcmd", "1", "JFR.dump", "name=1", "filename={dir}/{pod}-{alert_id}.jfr"]
                .into_iter()
                .map(String::from)
                .collect(),
            output_dir: "/resource/heapdump".to_string(),
            timeout: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl FlightRecordingConfig {
    pub fn render(&self, pod: &PodRef, command: &Command) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{dir}", self.output_dir.trim_end_matches('/'))
                    .replace("{pod}", &pod.name)
                    .replace("{alert_id}", &command.alert_id)
            })
            .collect()
    }
}

/// Dumps a JFR recording in every selected pod
pub struct FlightRecordingHandler {
    executor: Arc<dyn RemoteExecutor>,
    resolver: Arc<dyn PodResolver>,
    config: FlightRecordingConfig,
}

impl FlightRecordingHandler {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        resolver: Arc<dyn PodResolver>,
        config: FlightRecordingConfig,
    ) -> Self {
        Self {
            executor,
            resolver,
            config,
        }
    }
}

#[async_trait]
impl CommandHandler for FlightRecordingHandler {
    async fn handle(&self, command: &Command, ctx: &ActivityContext) -> Result<HandlerOutcome, HandlerError> {
        let pods = resolve_pods(self.resolver.as_ref(), command).await?;
        let mut results = Vec::with_capacity(pods.len());
        let mut all_ok = true;

        for pod in &pods {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            let request = ExecRequest::new(self.config.render(pod, command)).timeout(self.config.timeout);
            let output = with_heartbeats(
                ctx,
                self.config.heartbeat_interval,
                "flight_recording",
                self.executor.exec(pod, &request),
            )
            .await?;
            if output.success() {
                results.push(format!("{}: recording written", pod.name));
            } else {
                all_ok = false;
                warn!(
                    pod = %pod,
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Flight recording failed"
                );
                results.push(format!("{}: exit {} ({})", pod.name, output.exit_code, output.stderr.trim()));
            }
        }

        Ok(HandlerOutcome {
            success: all_ok,
            message: results.join("; "),
            report: None,
        })
    }
}

/// Runs the crash dump pipeline across every selected pod
pub struct HeapDumpHandler {
    pipeline: Arc<CrashDumpPipeline>,
    resolver: Arc<dyn PodResolver>,
}

impl HeapDumpHandler {
    pub fn new(pipeline: Arc<CrashDumpPipeline>, resolver: Arc<dyn PodResolver>) -> Self {
        Self { pipeline, resolver }
    }
}

#[async_trait]
impl CommandHandler for HeapDumpHandler {
    async fn handle(&self, command: &Command, ctx: &ActivityContext) -> Result<HandlerOutcome, HandlerError> {
        let pods = resolve_pods(self.resolver.as_ref(), command).await?;
        let report = self.pipeline.run(&pods, ctx).await;
        Ok(HandlerOutcome {
            success: report.success,
            message: report.message.clone(),
            report: Some(report),
        })
    }
}
