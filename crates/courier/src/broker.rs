//! Credential brokers used by the heap dump pipeline

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_lib::pipeline::{CredentialBroker, UploadCredentials};
use courier_lib::CredentialError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::StaticCredentials;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest<'a> {
    identity: &'a str,
    duration_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueResponse {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    region: String,
    expires_at: DateTime<Utc>,
}

/// Requests credentials from an HTTP endpoint
pub struct HttpCredentialBroker {
    http: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpCredentialBroker {
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        let endpoint = Url::parse(endpoint).context("Invalid broker URL")?;
        Ok(Self { http, endpoint, token })
    }
}

#[async_trait]
impl CredentialBroker for HttpCredentialBroker {
    async fn issue(&self, identity: &str, duration: Duration) -> Result<UploadCredentials, CredentialError> {
        let mut request = self.http.post(self.endpoint.clone()).json(&IssueRequest {
            identity,
            duration_seconds: duration.as_secs(),
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CredentialError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CredentialError::Request(format!("broker returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, identity = %identity, "Credential request rejected");
            return Err(CredentialError::Rejected(format!("{}: {}", status, body.trim())));
        }

        let issued: IssueResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        debug!(identity = %identity, expires_at = %issued.expires_at, "Upload credentials issued");

        let credentials = UploadCredentials {
            access_key_id: issued.access_key_id,
            secret_access_key: issued.secret_access_key,
            session_token: issued.session_token,
            region: issued.region,
            expires_at: issued.expires_at,
        };
        if credentials.is_expired() {
            return Err(CredentialError::Malformed("credentials already expired".to_string()));
        }
        Ok(credentials)
    }
}

/// Hands out fixed credentials; for development clusters only
pub struct StaticCredentialBroker {
    credentials: StaticCredentials,
}

impl StaticCredentialBroker {
    pub fn new(credentials: StaticCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialBroker for StaticCredentialBroker {
    async fn issue(&self, _identity: &str, duration: Duration) -> Result<UploadCredentials, CredentialError> {
        let lifetime = chrono::Duration::from_std(duration)
            .map_err(|e| CredentialError::Rejected(format!("invalid duration: {}", e)))?;
        Ok(UploadCredentials {
            access_key_id: self.credentials.access_key_id.clone(),
            secret_access_key: self.credentials.secret_access_key.clone(),
            session_token: self.credentials.session_token.clone(),
            region: self.credentials.region.clone(),
            expires_at: Utc::now() + lifetime,
        })
    }
}
