//! Remote command execution against pods
//!
//! The executor runs a single argv in a pod container and reports what came
//! back. It never retries; retry policy lives with the caller.

mod probe;

pub use probe::FileProbe;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::ExecError;
use crate::models::PodRef;

/// Default timeout for short probe commands
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// A command to run in a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// Injected as environment variables of the remote process
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Full argv including the `env K=V` prefix when variables are set.
    ///
    /// Pod exec has no native environment parameter, so variables ride on
    /// the command line of `env`.
    pub fn command_line(&self) -> Vec<String> {
        if self.env.is_empty() {
            return self.argv.clone();
        }
        let mut argv = Vec::with_capacity(self.env.len() + self.argv.len() + 1);
        argv.push("env".to_string());
        argv.extend(self.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        argv.extend(self.argv.iter().cloned());
        argv
    }

    /// Printable form for logs; never includes environment values.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for running commands inside pod containers
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `request` in the pod.
    ///
    /// Errors only on transport failure or timeout, never on a non-zero exit.
    async fn exec(&self, pod: &PodRef, request: &ExecRequest) -> Result<ExecOutput, ExecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_prefixes_env() {
        let req = ExecRequest::new(["sh", "/tmp/helper.sh", "upload"])
            .env("AWS_DEFAULT_REGION", "eu-west-1")
            .env("AWS_ACCESS_KEY_ID", "AKIA");
        assert_eq!(
            req.command_line(),
            vec![
                "env",
                "AWS_DEFAULT_REGION=eu-west-1",
                "AWS_ACCESS_KEY_ID=AKIA",
                "sh",
                "/tmp/helper.sh",
                "upload"
            ]
        );
        assert_eq!(req.display(), "sh /tmp/helper.sh upload");
    }

    #[test]
    fn test_command_line_without_env() {
        let req = ExecRequest::new(["uname", "-a"]).timeout(Duration::from_secs(5));
        assert_eq!(req.command_line(), vec!["uname", "-a"]);
        assert_eq!(req.timeout, Duration::from_secs(5));
    }
}
