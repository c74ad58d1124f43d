//! Pod exec and pod listing through the Kubernetes API

use async_trait::async_trait;
use courier_lib::dispatch::PodResolver;
use courier_lib::exec::{ExecOutput, ExecRequest, RemoteExecutor};
use courier_lib::{Command, ExecError, HandlerError, PodRef, PodSelector};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, ListParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One client per cluster context, created on first use
pub struct KubeClients {
    in_cluster_context: Option<String>,
    clients: RwLock<HashMap<String, Client>>,
}

impl KubeClients {
    pub fn new(in_cluster_context: Option<String>) -> Self {
        Self {
            in_cluster_context,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn client(&self, context: &str) -> Result<Client, ExecError> {
        if let Some(client) = self.clients.read().await.get(context) {
            return Ok(client.clone());
        }

        let config = if self.in_cluster_context.as_deref() == Some(context) {
            Config::incluster().map_err(|e| ExecError::UnknownContext(format!("{}: {}", context, e)))?
        } else {
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            };
            Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ExecError::UnknownContext(format!("{}: {}", context, e)))?
        };
        let client =
            Client::try_from(config).map_err(|e| ExecError::UnknownContext(format!("{}: {}", context, e)))?;

        info!(context = %context, "Kubernetes client created");
        self.clients
            .write()
            .await
            .insert(context.to_string(), client.clone());
        Ok(client)
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buffer).await {
            debug!(error = %e, "Exec stream ended early");
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Exit code from the exec status channel; success carries no cause.
fn exit_code(status: Option<Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .and_then(|details| details.causes)
        .and_then(|causes| {
            causes
                .into_iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
                .and_then(|cause| cause.message)
        })
        .and_then(|code| code.parse().ok())
        .unwrap_or(-1)
}

/// Runs commands in pod containers over the exec subresource
pub struct KubeExecutor {
    clients: Arc<KubeClients>,
}

impl KubeExecutor {
    pub fn new(clients: Arc<KubeClients>) -> Self {
        Self { clients }
    }

    async fn run(&self, pod: &PodRef, request: &ExecRequest) -> Result<ExecOutput, ExecError> {
        let transport = |message: String| ExecError::Transport {
            pod: pod.to_string(),
            command: request.display(),
            message,
        };

        let client = self.clients.client(&pod.cluster_context).await?;
        let pods: Api<Pod> = Api::namespaced(client, &pod.namespace);
        let params = AttachParams::default()
            .container(pod.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let started = Instant::now();
        let mut attached = pods
            .exec(&pod.name, request.command_line(), &params)
            .await
            .map_err(|e| transport(e.to_string()))?;

        let status = attached.take_status();
        let (stdout, stderr) = tokio::join!(read_stream(attached.stdout()), read_stream(attached.stderr()));
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.map_err(|e| transport(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: exit_code(status),
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl RemoteExecutor for KubeExecutor {
    async fn exec(&self, pod: &PodRef, request: &ExecRequest) -> Result<ExecOutput, ExecError> {
        debug!(pod = %pod, command = %request.display(), "Exec");
        match tokio::time::timeout(request.timeout, self.run(pod, request)).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout {
                pod: pod.to_string(),
                command: request.display(),
                timeout: request.timeout,
            }),
        }
    }
}

/// Resolves label selectors by listing pods in the command's namespace
pub struct KubePodResolver {
    clients: Arc<KubeClients>,
}

impl KubePodResolver {
    pub fn new(clients: Arc<KubeClients>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl PodResolver for KubePodResolver {
    async fn resolve(&self, command: &Command) -> Result<Vec<PodRef>, HandlerError> {
        let selector = match &command.pod_selector {
            PodSelector::Name(name) => {
                return Ok(vec![PodRef::new(
                    name.clone(),
                    command.namespace.clone(),
                    command.container(),
                    command.cluster_context.clone(),
                )])
            }
            PodSelector::Labels(selector) => selector,
        };

        let client = self
            .clients
            .client(&command.cluster_context)
            .await
            .map_err(|e| HandlerError::Resolution(e.to_string()))?;
        let pods: Api<Pod> = Api::namespaced(client, &command.namespace);
        let listed = pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| HandlerError::Resolution(format!("listing pods for {}: {}", selector, e)))?;

        let mut names: Vec<String> = listed
            .items
            .into_iter()
            .filter(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map_or(false, |phase| phase == "Running")
            })
            .filter_map(|pod| pod.metadata.name)
            .collect();
        names.sort();

        debug!(selector = %selector, namespace = %command.namespace, pods = ?names, "Resolved pods");
        Ok(names
            .into_iter()
            .map(|name| {
                PodRef::new(
                    name,
                    command.namespace.clone(),
                    command.container(),
                    command.cluster_context.clone(),
                )
            })
            .collect())
    }
}
