//! HTTP API for health checks, metrics and command intake

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_lib::{
    health::{ComponentStatus, HealthRegistry},
    queue::{CancelOutcome, CoordinatorHandle, EnqueueOutcome},
    Command, CommandKind, PodSelector, RoutingError,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub coordinator: CoordinatorHandle,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, coordinator: CoordinatorHandle) -> Self {
        Self {
            health_registry,
            coordinator,
        }
    }
}

/// Inbound command; kind and priority default from the alert name
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub alert_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub cluster_context: String,
    pub namespace: String,
    pub pod_selector: PodSelector,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub alert_name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl CommandRequest {
    pub fn into_command(self) -> Result<Command, RoutingError> {
        let kind = self.kind.as_deref().map(str::parse::<CommandKind>).transpose()?;
        let mut command = Command::from_alert(
            self.alert_name.as_deref().unwrap_or_default(),
            self.alert_id,
            self.correlation_id,
            self.cluster_context,
            self.namespace,
            self.pod_selector,
            self.labels,
        );
        if let Some(kind) = kind {
            command.kind = kind;
        }
        if let Some(priority) = self.priority {
            command.priority = priority;
        }
        Ok(command)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Accepted {
    alert_id: String,
    correlation_id: String,
    cluster_context: String,
    kind: CommandKind,
    priority: i32,
    /// The alert id was already queued, executing or recently dispatched
    duplicate: bool,
    position: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    cluster_context: String,
    alert_id: String,
    outcome: CancelOutcome,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    reason: &'static str,
}

fn routing_error(err: RoutingError) -> Response {
    let status = match err {
        RoutingError::ShuttingDown
        | RoutingError::CoordinatorUnavailable
        | RoutingError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RoutingError::UnsupportedCluster(_)
        | RoutingError::UnsupportedCommandKind(_)
        | RoutingError::InvalidCommand(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    let body = ErrorBody {
        reason: err.reason(),
        error: err.to_string(),
    };
    (status, Json(body)).into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Coordinator and per-cluster queue status
async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => routing_error(e),
    }
}

async fn submit_command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Response {
    let command = match request.into_command() {
        Ok(command) => command,
        Err(e) => return routing_error(e),
    };
    let mut accepted = Accepted {
        alert_id: command.alert_id.clone(),
        correlation_id: command.correlation_id.clone(),
        cluster_context: command.cluster_context.clone(),
        kind: command.kind,
        priority: command.priority,
        duplicate: false,
        position: None,
    };

    match state.coordinator.route(command).await {
        Ok(EnqueueOutcome::Queued { position }) => {
            accepted.position = Some(position);
            (StatusCode::ACCEPTED, Json(accepted)).into_response()
        }
        Ok(EnqueueOutcome::Duplicate) => {
            accepted.duplicate = true;
            (StatusCode::OK, Json(accepted)).into_response()
        }
        Err(e) => routing_error(e),
    }
}

async fn cancel_command(
    State(state): State<Arc<AppState>>,
    Path((cluster, alert_id)): Path<(String, String)>,
) -> Response {
    match state.coordinator.cancel(&cluster, &alert_id).await {
        Ok(outcome) => {
            let status = match outcome {
                CancelOutcome::Signalled => StatusCode::ACCEPTED,
                CancelOutcome::Dequeued => StatusCode::OK,
                CancelOutcome::NotFound => StatusCode::NOT_FOUND,
            };
            let body = CancelBody {
                cluster_context: cluster,
                alert_id,
                outcome,
            };
            (status, Json(body)).into_response()
        }
        Err(e) => routing_error(e),
    }
}

async fn command_position(
    State(state): State<Arc<AppState>>,
    Path((cluster, alert_id)): Path<(String, String)>,
) -> Response {
    match state.coordinator.position(&cluster, &alert_id).await {
        Ok(position) if position.found => (StatusCode::OK, Json(position)).into_response(),
        Ok(position) => (StatusCode::NOT_FOUND, Json(position)).into_response(),
        Err(e) => routing_error(e),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/commands", post(submit_command))
        .route(
            "/commands/:cluster/:alert_id",
            get(command_position).delete(cancel_command),
        )
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
