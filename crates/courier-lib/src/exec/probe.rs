//! File existence and stat queries built on the remote executor

use chrono::{TimeZone, Utc};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ExecRequest, RemoteExecutor};
use crate::error::ProbeError;
use crate::models::{FileStat, PodRef};

/// Probes files in one pod
pub struct FileProbe<'a> {
    executor: &'a dyn RemoteExecutor,
    pod: &'a PodRef,
    timeout: Duration,
}

impl<'a> FileProbe<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, pod: &'a PodRef, timeout: Duration) -> Self {
        Self {
            executor,
            pod,
            timeout,
        }
    }

    /// Whether `path` is a directory. Probe failures count as absent.
    pub async fn dir_exists(&self, path: &str) -> bool {
        self.test("-d", path).await.unwrap_or_else(|e| {
            warn!(pod = %self.pod, path = %path, error = %e, "Directory probe failed, treating as absent");
            false
        })
    }

    /// Whether `path` is a regular file. Probe failures count as absent.
    pub async fn exists(&self, path: &str) -> bool {
        self.try_exists(path).await.unwrap_or_else(|e| {
            warn!(pod = %self.pod, path = %path, error = %e, "File probe failed, treating as absent");
            false
        })
    }

    /// Like [`exists`](Self::exists) but surfaces transport failures.
    pub async fn try_exists(&self, path: &str) -> Result<bool, ProbeError> {
        self.test("-f", path).await
    }

    async fn test(&self, flag: &str, path: &str) -> Result<bool, ProbeError> {
        let request = ExecRequest::new(["test", flag, path]).timeout(self.timeout);
        let output = self.executor.exec(self.pod, &request).await?;
        Ok(output.success())
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat, ProbeError> {
        let request = ExecRequest::new(["stat", "-c", "%s %Y", path]).timeout(self.timeout);
        let output = self.executor.exec(self.pod, &request).await?;
        if !output.success() {
            return Err(ProbeError::NotFound {
                path: path.to_string(),
            });
        }
        parse_stat(path, &output.stdout)
    }

    /// Heap dumps and flight recordings under `dir`, excluding compressed artifacts.
    pub async fn find_dumps(&self, dir: &str) -> Result<Vec<String>, ProbeError> {
        let request = ExecRequest::new([
            "find", dir, "-type", "f", "(", "-name", "*.hprof", "-o", "-name", "*.jfr", ")", "!",
            "-name", "*.gz",
        ])
        .timeout(self.timeout);
        let output = self.executor.exec(self.pod, &request).await?;
        if !output.success() {
            return Err(ProbeError::Search {
                dir: dir.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        let paths: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(pod = %self.pod, dir = %dir, count = paths.len(), "Found dump candidates");
        Ok(paths)
    }
}

/// Parse `stat -c "%s %Y"` output.
fn parse_stat(path: &str, stdout: &str) -> Result<FileStat, ProbeError> {
    let unparseable = || ProbeError::Unparseable {
        path: path.to_string(),
        output: stdout.to_string(),
    };
    let mut parts = stdout.split_whitespace();
    let size_bytes = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(unparseable)?;
    let modified_at = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    Ok(FileStat {
        size_bytes,
        modified_at,
    })
}
