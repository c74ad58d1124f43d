//! Upload stage
//!
//! Delivery is delegated to a helper script run inside the pod. The script
//! is written fresh before every upload and its digest checked in place, so
//! a stale or modified helper never receives credentials.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::credentials::UploadCredentials;
use crate::error::ExecError;
use crate::exec::{ExecOutput, ExecRequest, RemoteExecutor};
use crate::models::{CompressionResult, CrashDumpFile, PodRef, UploadResult};
use crate::runtime::{with_heartbeats, ActivityContext};

/// Helper bytes shipped with the binary
pub const HELPER_SCRIPT: &str = include_str!("../../assets/upload-helper.sh");

const HEREDOC_DELIMITER: &str = "COURIER_HELPER_EOF";

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub bucket: String,
    /// Where the helper is written inside the pod
    pub helper_path: String,
    /// Timeout for a single helper run
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket: "cratedb-cloud-heapdumps".to_string(),
            helper_path: "/tmp/crash-dump-upload-helper.sh".to_string(),
            timeout: Duration::from_secs(2 * 60 * 60),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Deterministic object key for a dump, so retries overwrite instead of duplicating.
///
/// Siblings are keyed by their path below `heapdump_dir`, so same-named
/// files in different subdirectories land on different objects.
pub fn destination_key(pod_name: &str, file: &CrashDumpFile, heapdump_dir: &str) -> String {
    format!("{}-{}", pod_name, file.kind.key_suffix(file.relative_path(heapdump_dir)))
}

pub struct Uploader {
    executor: Arc<dyn RemoteExecutor>,
    config: UploadConfig,
    script: String,
    digest: String,
}

impl Uploader {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: UploadConfig) -> Self {
        let mut script = HELPER_SCRIPT.to_string();
        if !script.ends_with('\n') {
            script.push('\n');
        }
        let digest = hex::encode(Sha256::digest(script.as_bytes()));
        Self {
            executor,
            config,
            script,
            digest,
        }
    }

    /// Write the helper into the pod and check its digest there.
    async fn install_helper(&self, pod: &PodRef) -> Result<(), String> {
        let path = &self.config.helper_path;
        let install = format!(
            "cat > {path} << '{delim}'\n{body}{delim}\nchmod 700 {path}\n",
            path = path,
            delim = HEREDOC_DELIMITER,
            body = self.script
        );
        let output = self
            .executor
            .exec(pod, &ExecRequest::new(["sh", "-c", install.as_str()]))
            .await
            .map_err(|e| e.to_string())?;
        if !output.success() {
            return Err(format!("helper install failed: {}", output.stderr.trim()));
        }

        let output = self
            .executor
            .exec(pod, &ExecRequest::new(["sha256sum", path.as_str()]))
            .await
            .map_err(|e| e.to_string())?;
        let remote_digest = output.stdout.split_whitespace().next().unwrap_or_default();
        if !output.success() || remote_digest != self.digest {
            return Err(format!(
                "helper digest mismatch: expected {}, found {:?}",
                self.digest, remote_digest
            ));
        }
        debug!(pod = %pod, path = %path, "Upload helper installed");
        Ok(())
    }

    fn helper_request<I, S>(&self, args: I, creds: &UploadCredentials) -> ExecRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = ["sh".to_string(), self.config.helper_path.clone()]
            .into_iter()
            .chain(args.into_iter().map(Into::into));
        creds
            .env()
            .into_iter()
            .fold(ExecRequest::new(argv).timeout(self.config.timeout), |req, (k, v)| req.env(k, v))
    }

    /// Upload the compressed artifact. Failures are captured in the result.
    pub async fn upload(
        &self,
        pod: &PodRef,
        compression: &CompressionResult,
        creds: &UploadCredentials,
        key: &str,
        ctx: &ActivityContext,
    ) -> UploadResult {
        let size = compression.compressed_size;
        if ctx.is_cancelled() {
            return UploadResult::failed(key, size, "cancelled");
        }
        let started = Instant::now();

        if let Err(reason) = self.install_helper(pod).await {
            warn!(pod = %pod, key = %key, reason = %reason, "Upload helper unavailable");
            return UploadResult::failed(key, size, reason);
        }

        let request = self.helper_request(
            [
                "upload",
                compression.compressed_path.as_str(),
                "--bucket",
                self.config.bucket.as_str(),
                "--key",
                key,
                "--region",
                creds.region.as_str(),
            ],
            creds,
        );
        let output = with_heartbeats(
            ctx,
            self.config.heartbeat_interval,
            "uploading",
            self.executor.exec(pod, &request),
        )
        .await;

        match output {
            Ok(out) if out.success() => {
                let result = UploadResult {
                    success: true,
                    remote_key: key.to_string(),
                    size_bytes: size,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                };
                info!(
                    pod = %pod,
                    key = %key,
                    bucket = %self.config.bucket,
                    bytes = size,
                    duration_ms = result.duration_ms,
                    "Uploaded crash dump"
                );
                result
            }
            Ok(out) => {
                let reason = format!("helper exited with {}: {}", out.exit_code, out.stderr.trim());
                warn!(pod = %pod, key = %key, reason = %reason, "Upload failed");
                UploadResult {
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..UploadResult::failed(key, size, reason)
                }
            }
            Err(e) => {
                warn!(pod = %pod, key = %key, error = %e, "Upload transport failure");
                UploadResult {
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..UploadResult::failed(key, size, e.to_string())
                }
            }
        }
    }

    /// Ask the helper whether `key` exists remotely with `expected_size` bytes.
    pub async fn read_back(
        &self,
        pod: &PodRef,
        key: &str,
        expected_size: u64,
        creds: &UploadCredentials,
    ) -> Result<ExecOutput, ExecError> {
        if let Err(reason) = self.install_helper(pod).await {
            return Err(ExecError::Transport {
                pod: pod.name.clone(),
                command: "install upload helper".to_string(),
                message: reason,
            });
        }
        let expected = expected_size.to_string();
        let request = self.helper_request(
            [
                "verify",
                "--bucket",
                self.config.bucket.as_str(),
                "--key",
                key,
                "--region",
                creds.region.as_str(),
                "--expected-size",
                expected.as_str(),
            ],
            creds,
        );
        self.executor.exec(pod, &request).await
    }
}
