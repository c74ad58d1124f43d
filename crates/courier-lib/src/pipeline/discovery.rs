//! Crash dump discovery
//!
//! Decides whether a pod has anything worth uploading. The common answer is
//! "no": the marker heap dump only exists after a heap-exhaustion crash.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::StageError;
use crate::exec::{FileProbe, RemoteExecutor, DEFAULT_PROBE_TIMEOUT};
use crate::models::{CrashDumpFile, DiscoveryResult, DumpKind, PodRef};
use crate::runtime::ActivityContext;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Directory the JVM writes heap dumps into
    pub heapdump_dir: String,
    /// File name of the marker heap dump inside `heapdump_dir`
    pub marker_file: String,
    /// Timeout for every probe command
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heapdump_dir: "/resource/heapdump".to_string(),
            marker_file: "java_pid1.hprof".to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl DiscoveryConfig {
    pub fn marker_path(&self) -> String {
        format!("{}/{}", self.heapdump_dir.trim_end_matches('/'), self.marker_file)
    }
}

pub struct Discoverer {
    executor: Arc<dyn RemoteExecutor>,
    config: DiscoveryConfig,
}

impl Discoverer {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: DiscoveryConfig) -> Self {
        Self { executor, config }
    }

    /// Find crash dumps in `pod`. Never fails; errors degrade to "nothing to upload".
    pub async fn discover(&self, pod: &PodRef, ctx: &ActivityContext) -> DiscoveryResult {
        match self.try_discover(pod, ctx).await {
            Ok(result) => result,
            Err(StageError::Cancelled) => DiscoveryResult::nothing("Discovery cancelled"),
            Err(e) => {
                warn!(pod = %pod, error = %e, "Discovery failed, assuming no upload required");
                DiscoveryResult::nothing(format!("Discovery failed: {}", e))
            }
        }
    }

    async fn try_discover(&self, pod: &PodRef, ctx: &ActivityContext) -> Result<DiscoveryResult, StageError> {
        let probe = FileProbe::new(self.executor.as_ref(), pod, self.config.probe_timeout);
        let dir = &self.config.heapdump_dir;

        ctx.heartbeat("checking_heapdump_dir");
        if !probe.dir_exists(dir).await {
            debug!(pod = %pod, dir = %dir, "Heap dump directory not present");
            return Ok(DiscoveryResult::nothing(format!(
                "Heap dump directory {} not found",
                dir
            )));
        }
        ctx.check_cancelled()?;

        let marker = self.config.marker_path();
        ctx.heartbeat("checking_marker");
        if !probe.exists(&marker).await {
            debug!(pod = %pod, marker = %marker, "No marker heap dump");
            return Ok(DiscoveryResult::nothing(format!(
                "No {} found, restart was not caused by heap exhaustion",
                self.config.marker_file
            )));
        }
        ctx.check_cancelled()?;

        let stat = probe.stat(&marker).await?;
        let mut files = vec![CrashDumpFile {
            pod_name: pod.name.clone(),
            path: marker.clone(),
            size_bytes: stat.size_bytes,
            modified_at: stat.modified_at,
            kind: DumpKind::CriticalHeap,
        }];

        ctx.heartbeat("searching_siblings");
        match probe.find_dumps(dir).await {
            Ok(candidates) => {
                for path in candidates {
                    ctx.check_cancelled()?;
                    if path == marker || path.ends_with(".gz") {
                        continue;
                    }
                    let Some(kind) = DumpKind::for_sibling(&path) else {
                        continue;
                    };
                    match probe.stat(&path).await {
                        Ok(stat) => files.push(CrashDumpFile {
                            pod_name: pod.name.clone(),
                            path,
                            size_bytes: stat.size_bytes,
                            modified_at: stat.modified_at,
                            kind,
                        }),
                        Err(e) => {
                            warn!(pod = %pod, path = %path, error = %e, "Skipping sibling that could not be stat'ed")
                        }
                    }
                    ctx.heartbeat("searching_siblings");
                }
            }
            Err(e) => warn!(pod = %pod, error = %e, "Sibling search failed, continuing with marker only"),
        }

        let result = DiscoveryResult {
            requires_upload: true,
            message: format!("Found {} crash dump file(s)", files.len()),
            files,
        };
        info!(
            pod = %pod,
            files = result.files.len(),
            total_bytes = result.total_size_bytes(),
            "Crash dumps discovered"
        );
        Ok(result)
    }
}
