//! Verification stage: the gate in front of deletion

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::credentials::UploadCredentials;
use super::upload::Uploader;
use crate::error::StageError;
use crate::models::{PodRef, UploadResult, VerificationMethod, VerificationResult};
use crate::runtime::ActivityContext;

/// How uploads are confirmed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMode {
    /// Trust the helper's own size check after the transfer
    #[default]
    HelperReport,
    /// Run the helper again in `verify` mode and compare the remote size
    ReadBack,
}

impl VerificationMode {
    pub fn method(&self) -> VerificationMethod {
        match self {
            VerificationMode::HelperReport => VerificationMethod::HelperSelfReport,
            VerificationMode::ReadBack => VerificationMethod::HelperReadBack,
        }
    }
}

pub struct Verifier {
    mode: VerificationMode,
    uploader: Arc<Uploader>,
}

impl Verifier {
    pub fn new(mode: VerificationMode, uploader: Arc<Uploader>) -> Self {
        Self { mode, uploader }
    }

    pub fn mode(&self) -> VerificationMode {
        self.mode
    }

    /// Confirm an upload. A failed upload is never verified.
    ///
    /// Errors only when a read-back could not be performed at all; the
    /// retry policy applies to those.
    pub async fn verify(
        &self,
        pod: &PodRef,
        upload: &UploadResult,
        creds: &UploadCredentials,
        ctx: &ActivityContext,
    ) -> Result<VerificationResult, StageError> {
        let method = self.mode.method();
        if !upload.success {
            return Ok(VerificationResult::failed(
                &upload.remote_key,
                method,
                upload.error.clone().unwrap_or_else(|| "upload did not succeed".to_string()),
            ));
        }

        match self.mode {
            VerificationMode::HelperReport => Ok(VerificationResult {
                verified: true,
                remote_key: upload.remote_key.clone(),
                method,
                error: None,
            }),
            VerificationMode::ReadBack => {
                ctx.check_cancelled()?;
                ctx.heartbeat("verifying");
                let output = self
                    .uploader
                    .read_back(pod, &upload.remote_key, upload.size_bytes, creds)
                    .await?;
                if output.success() {
                    info!(pod = %pod, key = %upload.remote_key, "Remote copy confirmed by read-back");
                    Ok(VerificationResult {
                        verified: true,
                        remote_key: upload.remote_key.clone(),
                        method,
                        error: None,
                    })
                } else {
                    let reason = format!("read-back exited with {}: {}", output.exit_code, output.stderr.trim());
                    warn!(pod = %pod, key = %upload.remote_key, reason = %reason, "Read-back verification failed");
                    Ok(VerificationResult::failed(&upload.remote_key, method, reason))
                }
            }
        }
    }
}
