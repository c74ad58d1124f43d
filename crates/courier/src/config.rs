//! Courier configuration

use anyhow::{bail, Context, Result};
use courier_lib::pipeline::{
    DiscoveryConfig, PipelineConfig, UploadConfig, VerificationMode, UPLOAD_IDENTITY,
};
use courier_lib::queue::{CoordinatorConfig, QueueConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional TOML file
pub const CONFIG_PATH_ENV: &str = "COURIER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct CourierConfig {
    /// Name used in lifecycle events, usually the pod name
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics/commands
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Cluster contexts served by this instance; one queue each
    #[serde(default)]
    pub clusters: Vec<String>,

    /// Context served with the in-cluster service account instead of kubeconfig
    #[serde(default)]
    pub in_cluster_context: Option<String>,

    #[serde(default)]
    pub dumps: DumpConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub queue: QueueSettings,

    /// How often coordinator status is folded into health
    #[serde(default = "default_health_refresh")]
    pub health_refresh_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DumpConfig {
    #[serde(default = "default_heapdump_dir")]
    pub heapdump_dir: String,
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_helper_path")]
    pub helper_path: String,
    #[serde(default)]
    pub verification_mode: VerificationMode,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            heapdump_dir: default_heapdump_dir(),
            marker_file: default_marker_file(),
            bucket: default_bucket(),
            helper_path: default_helper_path(),
            verification_mode: VerificationMode::default(),
            upload_timeout_secs: default_upload_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// HTTP endpoint issuing upload credentials
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer token for the endpoint
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_credential_duration")]
    pub duration_secs: u64,
    #[serde(default = "default_broker_timeout")]
    pub request_timeout_secs: u64,
    /// Fixed credentials for development clusters
    #[serde(default)]
    pub static_credentials: Option<StaticCredentials>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            identity: default_identity(),
            duration_secs: default_credential_duration(),
            request_timeout_secs: default_broker_timeout(),
            static_credentials: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: String,
    pub region: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_history_threshold")]
    pub history_threshold: usize,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            compaction_threshold: default_compaction_threshold(),
            poll_interval_secs: default_poll_interval(),
            history_threshold: default_history_threshold(),
            monitor_interval_secs: default_monitor_interval(),
        }
    }
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "dump-courier".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_health_refresh() -> u64 {
    15
}

fn default_heapdump_dir() -> String {
    DiscoveryConfig::default().heapdump_dir
}

fn default_marker_file() -> String {
    DiscoveryConfig::default().marker_file
}

fn default_bucket() -> String {
    UploadConfig::default().bucket
}

fn default_helper_path() -> String {
    UploadConfig::default().helper_path
}

fn default_upload_timeout() -> u64 {
    UploadConfig::default().timeout.as_secs()
}

fn default_identity() -> String {
    UPLOAD_IDENTITY.to_string()
}

fn default_credential_duration() -> u64 {
    3600
}

fn default_broker_timeout() -> u64 {
    30
}

fn default_compaction_threshold() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_history_threshold() -> usize {
    1000
}

fn default_monitor_interval() -> u64 {
    30
}

impl CourierConfig {
    /// Load from the optional `COURIER_CONFIG` file layered under `COURIER_*` variables
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref(), None)
    }

    /// `env` replaces the process environment when given
    pub fn load_from(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("COURIER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("clusters")
                .source(env),
        );

        let config: CourierConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("at least one cluster context must be configured");
        }
        if self.clusters.iter().any(|c| c.trim().is_empty()) {
            bail!("cluster contexts must not be empty");
        }
        if self.queue.compaction_threshold == 0 || self.queue.history_threshold == 0 {
            bail!("queue thresholds must be greater than zero");
        }
        if self.queue.poll_interval_secs == 0 || self.queue.monitor_interval_secs == 0 {
            bail!("queue intervals must be greater than zero");
        }
        match (&self.broker.endpoint, &self.broker.static_credentials) {
            (Some(endpoint), _) => {
                let url = url::Url::parse(endpoint)
                    .with_context(|| format!("malformed broker endpoint {}", endpoint))?;
                if !matches!(url.scheme(), "http" | "https") {
                    bail!("broker endpoint must be http or https, got {}", url.scheme());
                }
            }
            (None, Some(_)) => {}
            (None, None) => bail!("either broker.endpoint or broker.static_credentials is required"),
        }
        Ok(())
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            discovery: DiscoveryConfig {
                heapdump_dir: self.dumps.heapdump_dir.clone(),
                marker_file: self.dumps.marker_file.clone(),
                ..Default::default()
            },
            upload: UploadConfig {
                bucket: self.dumps.bucket.clone(),
                helper_path: self.dumps.helper_path.clone(),
                timeout: Duration::from_secs(self.dumps.upload_timeout_secs),
                ..Default::default()
            },
            verification_mode: self.dumps.verification_mode,
            credential_identity: self.broker.identity.clone(),
            credential_duration: Duration::from_secs(self.broker.duration_secs),
            ..Default::default()
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            clusters: self.clusters.clone(),
            history_threshold: self.queue.history_threshold,
            monitor_interval: Duration::from_secs(self.queue.monitor_interval_secs),
            queue: QueueConfig {
                compaction_threshold: self.queue.compaction_threshold,
                poll_interval: Duration::from_secs(self.queue.poll_interval_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
