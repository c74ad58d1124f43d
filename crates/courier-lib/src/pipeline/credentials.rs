//! Short-lived upload credentials

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::CredentialError;

/// Identity requested from the broker for crash dump uploads
pub const UPLOAD_IDENTITY: &str = "crash-dump-upload-session";

/// Scoped object-store credentials shared by every file of one pipeline run
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub region: String,
    pub expires_at: DateTime<Utc>,
}

impl UploadCredentials {
    /// Variables understood by the upload helper.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("AWS_ACCESS_KEY_ID".to_string(), self.access_key_id.clone()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), self.secret_access_key.clone()),
            ("AWS_SESSION_TOKEN".to_string(), self.session_token.clone()),
            ("AWS_DEFAULT_REGION".to_string(), self.region.clone()),
        ]
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

impl fmt::Debug for UploadCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("region", &self.region)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues short-lived credentials for an identity
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn issue(&self, identity: &str, duration: Duration) -> Result<UploadCredentials, CredentialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> UploadCredentials {
        UploadCredentials {
            access_key_id: "AKIA123".into(),
            secret_access_key: "very-secret".into(),
            session_token: "session".into(),
            region: "eu-central-1".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let printed = format!("{:?}", creds());
        assert!(printed.contains("AKIA123"));
        assert!(!printed.contains("very-secret"));
        assert!(!printed.contains("session\""));
    }

    #[test]
    fn test_env_names() {
        let env = creds().env();
        let names: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "AWS_SESSION_TOKEN", "AWS_DEFAULT_REGION"]
        );
        assert!(!creds().is_expired());
    }
}
