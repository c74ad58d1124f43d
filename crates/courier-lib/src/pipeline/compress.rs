//! Compression stage

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::StageError;
use crate::exec::{ExecRequest, FileProbe, RemoteExecutor, DEFAULT_PROBE_TIMEOUT};
use crate::models::{CompressionResult, CrashDumpFile, PodRef};
use crate::runtime::{with_heartbeats, ActivityContext};

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Timeout for the gzip command itself
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

pub struct Compressor {
    executor: Arc<dyn RemoteExecutor>,
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: CompressionConfig) -> Self {
        Self { executor, config }
    }

    /// Gzip `file` next to itself, keeping the original.
    ///
    /// gzip's exit code is advisory; only the compressed file existing
    /// afterwards counts as success.
    pub async fn compress(
        &self,
        pod: &PodRef,
        file: &CrashDumpFile,
        ctx: &ActivityContext,
    ) -> Result<CompressionResult, StageError> {
        ctx.check_cancelled()?;
        let compressed_path = file.compressed_path();

        let cleanup = ExecRequest::new(["rm", "-f", compressed_path.as_str()]);
        self.executor.exec(pod, &cleanup).await?;
        ctx.check_cancelled()?;

        let gzip = ExecRequest::new(["gzip", "-k", "-f", file.path.as_str()]).timeout(self.config.timeout);
        let output = with_heartbeats(
            ctx,
            self.config.heartbeat_interval,
            "compressing",
            self.executor.exec(pod, &gzip),
        )
        .await?;
        if !output.success() {
            warn!(
                pod = %pod,
                path = %file.path,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "gzip reported failure, checking for output anyway"
            );
        }
        ctx.check_cancelled()?;

        let probe = FileProbe::new(self.executor.as_ref(), pod, DEFAULT_PROBE_TIMEOUT);
        let stat = match probe.stat(&compressed_path).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!(pod = %pod, path = %compressed_path, error = %e, "Compressed artifact missing");
                return Err(StageError::CompressedMissing {
                    path: compressed_path,
                });
            }
        };

        let result = CompressionResult::new(file, compressed_path, stat.size_bytes);
        info!(
            pod = %pod,
            path = %file.path,
            original_bytes = result.original_size,
            compressed_bytes = result.compressed_size,
            ratio = result.ratio,
            "Compressed crash dump"
        );
        Ok(result)
    }
}
