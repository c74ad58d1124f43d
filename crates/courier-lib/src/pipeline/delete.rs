//! Deletion stage
//!
//! The only stage that destroys data. It runs only behind a verified upload
//! and an unchanged file size.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::StageError;
use crate::exec::{ExecRequest, FileProbe, RemoteExecutor, DEFAULT_PROBE_TIMEOUT};
use crate::models::{CompressionResult, CrashDumpFile, DeletionResult, PodRef, VerificationResult};
use crate::runtime::ActivityContext;

/// Why a deletion was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionRefusal {
    Unverified { reason: String },
    SizeMismatch { path: String, expected: u64, actual: u64 },
}

impl std::fmt::Display for DeletionRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionRefusal::Unverified { reason } => {
                write!(f, "refusing to delete unverified upload: {}", reason)
            }
            DeletionRefusal::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "size mismatch for {}: discovered {} bytes, now {} bytes",
                path, expected, actual
            ),
        }
    }
}

pub struct Deleter {
    executor: Arc<dyn RemoteExecutor>,
    timeout: Duration,
}

impl Deleter {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Delete the original and compressed copies of `file`.
    ///
    /// Refusals come back as `deleted == false` results. Errors are
    /// transport failures the retry policy may try again.
    pub async fn delete(
        &self,
        pod: &PodRef,
        file: &CrashDumpFile,
        compression: &CompressionResult,
        verification: &VerificationResult,
        ctx: &ActivityContext,
    ) -> Result<DeletionResult, StageError> {
        let targets = vec![file.path.clone(), compression.compressed_path.clone()];

        if !verification.verified {
            let refusal = DeletionRefusal::Unverified {
                reason: verification
                    .error
                    .clone()
                    .unwrap_or_else(|| "verification failed".to_string()),
            };
            warn!(pod = %pod, path = %file.path, reason = %refusal, "Deletion refused");
            return Ok(DeletionResult::not_deleted(targets, refusal.to_string()));
        }
        ctx.check_cancelled()?;

        let probe = FileProbe::new(self.executor.as_ref(), pod, self.timeout);
        if probe.try_exists(&file.path).await? {
            let current = probe.stat(&file.path).await?;
            if current.size_bytes != file.size_bytes {
                let refusal = DeletionRefusal::SizeMismatch {
                    path: file.path.clone(),
                    expected: file.size_bytes,
                    actual: current.size_bytes,
                };
                warn!(pod = %pod, path = %file.path, reason = %refusal, "Deletion refused");
                return Ok(DeletionResult::not_deleted(targets, refusal.to_string()));
            }
        } else {
            warn!(
                pod = %pod,
                path = %file.path,
                compressed = %compression.compressed_path,
                "Original already gone, size recheck skipped"
            );
        }
        ctx.check_cancelled()?;

        ctx.heartbeat("deleting");
        let mut argv = vec!["rm".to_string(), "-f".to_string()];
        argv.extend(targets.iter().cloned());
        let output = self
            .executor
            .exec(pod, &ExecRequest::new(argv).timeout(self.timeout))
            .await?;
        if !output.success() {
            warn!(pod = %pod, exit_code = output.exit_code, stderr = %output.stderr.trim(), "rm reported failure");
        }

        let mut remaining = Vec::new();
        for path in &targets {
            match probe.try_exists(path).await {
                Ok(false) => {}
                Ok(true) => remaining.push(format!("{} still exists", path)),
                Err(e) => remaining.push(format!("could not confirm removal of {}: {}", path, e)),
            }
        }

        if remaining.is_empty() {
            info!(pod = %pod, paths = ?targets, "Deleted crash dump");
            Ok(DeletionResult {
                deleted: true,
                paths: targets,
                error: None,
            })
        } else {
            Ok(DeletionResult::not_deleted(targets, remaining.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DumpKind, VerificationMethod};
    use crate::testing::FakePod;

    const PATH: &str = "/resource/heapdump/java_pid1.hprof";

    fn fixture(size: u64) -> (CrashDumpFile, CompressionResult) {
        let file = CrashDumpFile {
            pod_name: "db-1".into(),
            path: PATH.into(),
            size_bytes: size,
            modified_at: None,
            kind: DumpKind::CriticalHeap,
        };
        let compression = CompressionResult::new(&file, format!("{}.gz", PATH), size / 4);
        (file, compression)
    }

    fn verification(verified: bool) -> VerificationResult {
        VerificationResult {
            verified,
            remote_key: "db-1-java_pid1.hprof.gz".into(),
            method: VerificationMethod::HelperSelfReport,
            error: if verified { None } else { Some("helper exited with 1".into()) },
        }
    }

    fn seeded(size: u64) -> Arc<FakePod> {
        let fake = Arc::new(FakePod::new());
        fake.add_file("db-1", PATH, size);
        fake.add_file("db-1", &format!("{}.gz", PATH), size / 4);
        fake
    }

    #[tokio::test]
    async fn test_refuses_unverified_without_touching_pod() {
        let fake = seeded(100);
        let (file, compression) = fixture(100);
        let result = Deleter::new(fake.clone())
            .delete(&FakePod::pod("db-1"), &file, &compression, &verification(false), &ActivityContext::new("t"))
            .await
            .unwrap();
        assert!(!result.deleted);
        assert!(result.error.unwrap().contains("unverified"));
        assert!(fake.calls().is_empty());
        assert_eq!(fake.file_size("db-1", PATH), Some(100));
    }

    #[tokio::test]
    async fn test_refuses_on_size_change() {
        let fake = seeded(200);
        let (file, compression) = fixture(100);
        let result = Deleter::new(fake.clone())
            .delete(&FakePod::pod("db-1"), &file, &compression, &verification(true), &ActivityContext::new("t"))
            .await
            .unwrap();
        assert!(!result.deleted);
        assert!(result.error.unwrap().contains("size mismatch"));
        assert_eq!(fake.program_calls("rm"), 0);
    }

    #[tokio::test]
    async fn test_deletes_and_confirms() {
        let fake = seeded(100);
        let (file, compression) = fixture(100);
        let result = Deleter::new(fake.clone())
            .delete(&FakePod::pod("db-1"), &file, &compression, &verification(true), &ActivityContext::new("t"))
            .await
            .unwrap();
        assert!(result.deleted);
        assert_eq!(result.paths.len(), 2);
        assert_eq!(fake.file_size("db-1", PATH), None);
        assert_eq!(fake.file_size("db-1", &format!("{}.gz", PATH)), None);
    }

    #[tokio::test]
    async fn test_vanished_original_skips_recheck_and_removes_compressed() {
        let fake = Arc::new(FakePod::new());
        fake.add_file("db-1", &format!("{}.gz", PATH), 25);
        let (file, compression) = fixture(100);
        let result = Deleter::new(fake.clone())
            .delete(&FakePod::pod("db-1"), &file, &compression, &verification(true), &ActivityContext::new("t"))
            .await
            .unwrap();
        assert!(result.deleted);
        assert_eq!(fake.program_calls("stat"), 0);
        assert_eq!(fake.program_calls("rm"), 1);
        assert_eq!(fake.file_size("db-1", &format!("{}.gz", PATH)), None);
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let fake = seeded(100);
        fake.fail_next("test", 1);
        let (file, compression) = fixture(100);
        let err = Deleter::new(fake.clone())
            .delete(&FakePod::pod("db-1"), &file, &compression, &verification(true), &ActivityContext::new("t"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fake.file_size("db-1", PATH), Some(100));
    }
}
