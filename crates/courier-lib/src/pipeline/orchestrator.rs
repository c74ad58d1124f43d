//! Crash dump pipeline orchestration
//!
//! Runs discovery per pod, then compress → upload → verify → delete per file
//! with one shared credential set, and aggregates everything into a
//! [`PipelineReport`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::compress::{CompressionConfig, Compressor};
use super::credentials::{CredentialBroker, UploadCredentials, UPLOAD_IDENTITY};
use super::delete::Deleter;
use super::discovery::{Discoverer, DiscoveryConfig};
use super::upload::{destination_key, UploadConfig, Uploader};
use super::verify::{VerificationMode, Verifier};
use crate::error::CredentialError;
use crate::exec::RemoteExecutor;
use crate::models::{
    CrashDumpFile, DeletionResult, DiscoveryResult, PipelineReport, PodRef, ProcessingOutcome,
    VerificationResult,
};
use crate::observability::{CourierMetrics, StructuredLogger};
use crate::runtime::{retry_with, ActivityContext, RetryPolicy};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub discovery: DiscoveryConfig,
    pub compression: CompressionConfig,
    pub upload: UploadConfig,
    pub verification_mode: VerificationMode,
    /// Identity requested from the credential broker
    pub credential_identity: String,
    /// Lifetime of the issued credentials
    pub credential_duration: Duration,
    pub credential_retry: RetryPolicy,
    pub compression_retry: RetryPolicy,
    pub upload_retry: RetryPolicy,
    pub verification_retry: RetryPolicy,
    pub deletion_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            compression: CompressionConfig::default(),
            upload: UploadConfig::default(),
            verification_mode: VerificationMode::default(),
            credential_identity: UPLOAD_IDENTITY.to_string(),
            credential_duration: Duration::from_secs(3600),
            credential_retry: RetryPolicy::standard(),
            compression_retry: RetryPolicy::compression(),
            upload_retry: RetryPolicy::upload(),
            verification_retry: RetryPolicy::verification(),
            deletion_retry: RetryPolicy::deletion(),
        }
    }
}

pub struct CrashDumpPipeline {
    discoverer: Discoverer,
    compressor: Compressor,
    uploader: Arc<Uploader>,
    verifier: Verifier,
    deleter: Deleter,
    broker: Arc<dyn CredentialBroker>,
    config: PipelineConfig,
    metrics: CourierMetrics,
    logger: StructuredLogger,
}

impl CrashDumpPipeline {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        broker: Arc<dyn CredentialBroker>,
        config: PipelineConfig,
    ) -> Self {
        let uploader = Arc::new(Uploader::new(executor.clone(), config.upload.clone()));
        Self {
            discoverer: Discoverer::new(executor.clone(), config.discovery.clone()),
            compressor: Compressor::new(executor.clone(), config.compression.clone()),
            verifier: Verifier::new(config.verification_mode, uploader.clone()),
            deleter: Deleter::new(executor),
            uploader,
            broker,
            config,
            metrics: CourierMetrics::new(),
            logger: StructuredLogger::new("crash-dump-courier"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Process every crash dump found in `pods`.
    pub async fn run(&self, pods: &[PodRef], ctx: &ActivityContext) -> PipelineReport {
        let started = Instant::now();
        let mut report = PipelineReport {
            processed_pods: pods.iter().map(|p| p.name.clone()).collect(),
            ..Default::default()
        };

        let mut discoveries: Vec<(&PodRef, DiscoveryResult)> = Vec::with_capacity(pods.len());
        for pod in pods {
            if ctx.is_cancelled() {
                break;
            }
            let discovery = self.discoverer.discover(pod, ctx).await;
            discoveries.push((pod, discovery));
        }

        if ctx.is_cancelled() {
            report.cancelled = true;
            report.message = "Cancelled during discovery".to_string();
            return self.finish(report, started);
        }

        let pending: Vec<&(&PodRef, DiscoveryResult)> =
            discoveries.iter().filter(|(_, d)| d.requires_upload).collect();
        if pending.is_empty() {
            report.success = true;
            report.message = match discoveries.as_slice() {
                [(_, only)] => only.message.clone(),
                _ => format!("No crash dumps found in {} pod(s)", pods.len()),
            };
            info!(pods = pods.len(), "No crash dumps require upload");
            return self.finish(report, started);
        }

        report.total_size_bytes = pending.iter().map(|(_, d)| d.total_size_bytes()).sum();

        let creds = match self.request_credentials(ctx).await {
            Ok(creds) => creds,
            Err(e) => {
                warn!(error = %e, "Could not obtain upload credentials");
                report.errors.push(format!("credential request failed: {}", e));
                report.message = "Upload credentials unavailable, nothing was uploaded".to_string();
                return self.finish(report, started);
            }
        };

        // Each destination key is written at most once per run.
        let mut claimed_keys: HashSet<String> = HashSet::new();
        for (pod, discovery) in pending {
            for file in &discovery.files {
                let key = destination_key(&pod.name, file, &self.config.discovery.heapdump_dir);
                let outcome = if ctx.is_cancelled() {
                    ProcessingOutcome::stopped(file.clone(), None, "cancelled")
                } else if !claimed_keys.insert(key.clone()) {
                    warn!(pod = %pod, path = %file.path, key = %key, "Destination key already used in this run, skipping file");
                    ProcessingOutcome::stopped(
                        file.clone(),
                        None,
                        format!("destination key {} already used in this run", key),
                    )
                } else {
                    self.process_file(pod, file, &key, &creds, ctx).await
                };
                if let Some(reason) = outcome.failure_reason() {
                    report.errors.push(format!("{}:{}: {}", pod.name, file.path, reason));
                }
                if let Some(upload) = outcome.upload.as_ref().filter(|u| u.success) {
                    report.uploaded_files.push(upload.clone());
                }
                report.outcomes.push(outcome);
            }
        }

        report.cancelled = ctx.is_cancelled();
        report.success = !report.cancelled && report.outcomes.iter().all(|o| o.success);
        report.message = format!(
            "Processed {} file(s): {} uploaded, {} deleted, {} failed",
            report.outcomes.len(),
            report.upload_count(),
            report.deletion_count(),
            report.outcomes.iter().filter(|o| !o.success).count()
        );
        self.finish(report, started)
    }

    fn finish(&self, mut report: PipelineReport, started: Instant) -> PipelineReport {
        report.duration_seconds = started.elapsed().as_secs_f64();
        self.metrics.observe_pipeline_duration(report.duration_seconds);
        info!(
            success = report.success,
            cancelled = report.cancelled,
            pods = report.processed_pods.len(),
            uploads = report.upload_count(),
            deletions = report.deletion_count(),
            errors = report.errors.len(),
            duration_secs = report.duration_seconds,
            "Crash dump pipeline finished"
        );
        report
    }

    async fn request_credentials(&self, ctx: &ActivityContext) -> Result<UploadCredentials, CredentialError> {
        let identity = self.config.credential_identity.as_str();
        let duration = self.config.credential_duration;
        let (result, attempts) = retry_with(
            &self.config.credential_retry,
            ctx.token(),
            "credential_request",
            |_| self.broker.issue(identity, duration),
            |r| matches!(r, Err(e) if e.is_retryable()),
        )
        .await;
        if result.is_ok() {
            info!(identity = %identity, attempts = attempts, "Upload credentials issued");
        }
        result
    }

    async fn process_file(
        &self,
        pod: &PodRef,
        file: &CrashDumpFile,
        key: &str,
        creds: &UploadCredentials,
        ctx: &ActivityContext,
    ) -> ProcessingOutcome {
        let (compression, _) = retry_with(
            &self.config.compression_retry,
            ctx.token(),
            "compress",
            |_| self.compressor.compress(pod, file, ctx),
            |r| matches!(r, Err(e) if e.is_retryable()),
        )
        .await;
        let compression = match compression {
            Ok(c) => c,
            Err(e) => return ProcessingOutcome::stopped(file.clone(), None, format!("compression failed: {}", e)),
        };

        let (upload, _) = retry_with(
            &self.config.upload_retry,
            ctx.token(),
            "upload",
            |_| self.uploader.upload(pod, &compression, creds, key, ctx),
            |r| !r.success,
        )
        .await;
        if !upload.success {
            return ProcessingOutcome::new(file.clone(), Some(compression), Some(upload), None, None);
        }
        self.metrics.inc_files_uploaded(upload.size_bytes);

        let (verification, _) = retry_with(
            &self.config.verification_retry,
            ctx.token(),
            "verify",
            |_| self.verifier.verify(pod, &upload, creds, ctx),
            |r| matches!(r, Err(e) if e.is_retryable()),
        )
        .await;
        let verification = verification.unwrap_or_else(|e| {
            VerificationResult::failed(&upload.remote_key, self.verifier.mode().method(), e.to_string())
        });
        if !verification.verified {
            return ProcessingOutcome::new(file.clone(), Some(compression), Some(upload), Some(verification), None);
        }

        let (deletion, _) = retry_with(
            &self.config.deletion_retry,
            ctx.token(),
            "delete",
            |_| self.deleter.delete(pod, file, &compression, &verification, ctx),
            |r| matches!(r, Err(e) if e.is_retryable()),
        )
        .await;
        let deletion = deletion.unwrap_or_else(|e| {
            DeletionResult::not_deleted(
                vec![file.path.clone(), compression.compressed_path.clone()],
                e.to_string(),
            )
        });
        if deletion.deleted {
            self.metrics.inc_files_deleted();
            self.logger.log_file_deleted(pod, &deletion.paths, key);
        } else {
            self.metrics.inc_deletion_refusals();
            self.logger
                .log_deletion_refused(pod, &file.path, deletion.error.as_deref().unwrap_or("unknown"));
        }

        ProcessingOutcome::new(
            file.clone(),
            Some(compression),
            Some(upload),
            Some(verification),
            Some(deletion),
        )
    }
}
