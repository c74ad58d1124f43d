//! Crash Dump Courier
//!
//! Receives commands for database clusters, queues them per cluster and
//! ships crash dumps out of pods into the object store.

use anyhow::{Context, Result};
use courier_lib::{
    dispatch::{
        DispatchTable, FlightRecordingConfig, FlightRecordingHandler, HeapDumpHandler, ProbeTestHandler,
    },
    health::{components, HealthRegistry},
    pipeline::{CredentialBroker, CrashDumpPipeline},
    queue::Coordinator,
    CommandKind, CourierMetrics, StructuredLogger,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod broker;
mod config;
mod kube_exec;

const COURIER_VERSION: &str = env!("CARGO_PKG_VERSION");

fn credential_broker(config: &config::CourierConfig) -> Result<Arc<dyn CredentialBroker>> {
    let settings = &config.broker;
    match (&settings.endpoint, &settings.static_credentials) {
        (Some(endpoint), _) => {
            let broker = broker::HttpCredentialBroker::new(
                endpoint,
                settings.token.clone(),
                Duration::from_secs(settings.request_timeout_secs),
            )
            .context("failed to build credential broker client")?;
            Ok(Arc::new(broker))
        }
        (None, Some(credentials)) => {
            warn!("Using static upload credentials");
            Ok(Arc::new(broker::StaticCredentialBroker::new(credentials.clone())))
        }
        (None, None) => anyhow::bail!("no credential source configured"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting dump-courier");

    let config = config::CourierConfig::load().context("failed to load configuration")?;
    info!(instance = %config.instance_name, clusters = ?config.clusters, "Courier configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::EXECUTOR).await;
    health_registry.register(components::CREDENTIAL_BROKER).await;

    // Initialize metrics before anything records into them
    let _metrics = CourierMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);

    let clients = Arc::new(kube_exec::KubeClients::new(config.in_cluster_context.clone()));
    for cluster in &config.clusters {
        if let Err(e) = clients.client(cluster).await {
            warn!(cluster = %cluster, error = %e, "Cluster client unavailable at startup");
            health_registry
                .set_degraded(components::EXECUTOR, e.to_string())
                .await;
        }
    }
    let executor = Arc::new(kube_exec::KubeExecutor::new(clients.clone()));
    let resolver = Arc::new(kube_exec::KubePodResolver::new(clients));
    let broker = credential_broker(&config)?;

    let pipeline = Arc::new(
        CrashDumpPipeline::new(executor.clone(), broker, config.pipeline()).with_logger(logger.clone()),
    );
    let dispatcher = Arc::new(
        DispatchTable::new()
            .register(
                CommandKind::ProbeTest,
                Arc::new(ProbeTestHandler::new(executor.clone(), resolver.clone())),
            )
            .register(
                CommandKind::FlightRecording,
                Arc::new(FlightRecordingHandler::new(
                    executor.clone(),
                    resolver.clone(),
                    FlightRecordingConfig {
                        output_dir: config.dumps.heapdump_dir.clone(),
                        ..Default::default()
                    },
                )),
            )
            .register(
                CommandKind::HeapDumpUpload,
                Arc::new(HeapDumpHandler::new(pipeline, resolver)),
            ),
    );

    let (coordinator, coordinator_task) =
        Coordinator::spawn(config.coordinator(), dispatcher, logger.clone());
    logger.log_startup(COURIER_VERSION, &config.clusters);

    // Fold queue status into health
    let refresh_registry = health_registry.clone();
    let refresh_coordinator = coordinator.clone();
    let refresh_interval = Duration::from_secs(config.health_refresh_secs.max(1));
    let refresh_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_interval);
        loop {
            ticker.tick().await;
            match refresh_coordinator.status().await {
                Ok(status) => refresh_registry.apply_coordinator_status(&status).await,
                Err(e) => {
                    refresh_registry
                        .set_unhealthy(components::COORDINATOR, e.to_string())
                        .await;
                }
            }
        }
    });

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), coordinator.clone()));
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        served = api_handle => {
            match served {
                Ok(Ok(())) => warn!("API server exited"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
        }
    }

    health_registry.set_ready(false).await;
    if let Err(e) = coordinator.shutdown("SIGINT received").await {
        warn!(error = %e, "Coordinator already stopped");
    }
    let final_status = coordinator_task.await.context("coordinator task failed")?;
    refresh_handle.abort();

    info!(
        total_routed = final_status.total_routed,
        total_processed = final_status.total_processed,
        total_failed = final_status.total_failed,
        "Shutting down"
    );

    Ok(())
}
