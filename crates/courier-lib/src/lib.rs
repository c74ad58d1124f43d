//! Crash dump courier library
//!
//! This crate provides the core functionality for:
//! - Remote command execution against database pods
//! - Crash dump discovery, compression, upload, verification and safe deletion
//! - Per-cluster command queues with priority and duplicate suppression
//! - Coordination of cluster queues with bounded history
//! - Health checks and observability

pub mod dispatch;
pub mod error;
pub mod exec;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CredentialError, ExecError, HandlerError, ProbeError, RoutingError, StageError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{CourierMetrics, StructuredLogger};
