//! Test doubles shared by the pipeline, dispatch and queue tests

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{CredentialError, ExecError};
use crate::exec::{ExecOutput, ExecRequest, RemoteExecutor};
use crate::models::{Command, CommandKind, PodRef, PodSelector};
use crate::pipeline::credentials::{CredentialBroker, UploadCredentials};

/// A recorded exec call
#[derive(Debug, Clone)]
pub struct Call {
    pub pod: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Default)]
struct FakeState {
    dirs: HashSet<(String, String)>,
    files: BTreeMap<(String, String), u64>,
    helpers: HashMap<(String, String), String>,
    uploaded: BTreeMap<String, u64>,
    fail_upload: HashSet<String>,
    grow_on_upload: HashMap<String, u64>,
    skip_compression: HashSet<String>,
    failing_stats: HashSet<String>,
    tamper_helper: bool,
    transport_failures: HashMap<String, u32>,
    calls: Vec<Call>,
}

/// In-memory pods: a simulated filesystem per pod plus the upload helper.
#[derive(Default)]
pub struct FakePod {
    state: Mutex<FakeState>,
}

fn out(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> ExecOutput {
    ExecOutput {
        exit_code,
        stdout: stdout.into(),
        stderr: stderr.into(),
        duration: Duration::from_millis(1),
    }
}

fn flag<'a>(argv: &'a [String], name: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == name)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

impl FakePod {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pod(name: &str) -> PodRef {
        PodRef::new(name, "ns", "crate", "c1")
    }

    pub fn add_dir(&self, pod: &str, path: &str) {
        self.lock().dirs.insert((pod.to_string(), path.to_string()));
    }

    pub fn add_file(&self, pod: &str, path: &str, size: u64) {
        self.lock().files.insert((pod.to_string(), path.to_string()), size);
    }

    pub fn file_size(&self, pod: &str, path: &str) -> Option<u64> {
        self.lock().files.get(&(pod.to_string(), path.to_string())).copied()
    }

    /// Make the helper fail when uploading this compressed path.
    pub fn fail_upload_for(&self, compressed_path: &str) {
        self.lock().fail_upload.insert(compressed_path.to_string());
    }

    /// Rewrite the original file to `size` once its compressed copy is uploaded.
    pub fn grow_on_upload(&self, original_path: &str, size: u64) {
        self.lock().grow_on_upload.insert(original_path.to_string(), size);
    }

    /// gzip exits 0 but writes nothing for this path.
    pub fn skip_compression(&self, original_path: &str) {
        self.lock().skip_compression.insert(original_path.to_string());
    }

    /// `stat` on this path exits non-zero while the file stays visible to `test` and `find`.
    pub fn fail_stat_for(&self, path: &str) {
        self.lock().failing_stats.insert(path.to_string());
    }

    pub fn tamper_helper(&self) {
        self.lock().tamper_helper = true;
    }

    /// Fail the next `count` calls of `program` at the transport level.
    pub fn fail_next(&self, program: &str, count: u32) {
        self.lock().transport_failures.insert(program.to_string(), count);
    }

    pub fn uploaded(&self, key: &str) -> Option<u64> {
        self.lock().uploaded.get(key).copied()
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        self.lock().uploaded.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of helper invocations in the given mode (`upload` or `verify`).
    pub fn helper_calls(&self, mode: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.argv.first().map(String::as_str) == Some("sh") && c.argv.get(2).map(String::as_str) == Some(mode))
            .count()
    }

    pub fn program_calls(&self, program: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.argv.first().map(String::as_str) == Some(program))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

impl FakeState {
    fn key(pod: &str, path: &str) -> (String, String) {
        (pod.to_string(), path.to_string())
    }

    fn run(&mut self, pod: &str, request: &ExecRequest) -> ExecOutput {
        let argv = &request.argv;
        let arg = |i: usize| argv.get(i).map(String::as_str).unwrap_or("");
        match arg(0) {
            "test" => {
                let present = match arg(1) {
                    "-d" => self.dirs.contains(&Self::key(pod, arg(2))),
                    _ => self.files.contains_key(&Self::key(pod, arg(2))),
                };
                out(if present { 0 } else { 1 }, "", "")
            }
            "stat" if self.failing_stats.contains(arg(3)) => out(1, "", "stat: Permission denied"),
            "stat" => match self.files.get(&Self::key(pod, arg(3))) {
                Some(size) => out(0, format!("{} 1700000000\n", size), ""),
                None => out(1, "", "stat: No such file or directory"),
            },
            "find" => {
                let prefix = format!("{}/", arg(1));
                let found: Vec<String> = self
                    .files
                    .keys()
                    .filter(|(p, path)| p == pod && path.starts_with(&prefix))
                    .filter(|(_, path)| path.ends_with(".hprof") || path.ends_with(".jfr"))
                    .map(|(_, path)| path.clone())
                    .collect();
                out(0, found.join("\n"), "")
            }
            "rm" => {
                for path in argv.iter().skip(2) {
                    self.files.remove(&Self::key(pod, path));
                }
                out(0, "", "")
            }
            "gzip" => {
                let path = argv.last().map(String::as_str).unwrap_or("");
                match self.files.get(&Self::key(pod, path)).copied() {
                    None => out(1, "", "gzip: No such file or directory"),
                    Some(_) if self.skip_compression.contains(path) => out(0, "", ""),
                    Some(size) => {
                        self.files
                            .insert(Self::key(pod, &format!("{}.gz", path)), (size / 4).max(1));
                        out(0, "", "")
                    }
                }
            }
            "sha256sum" => match self.helpers.get(&Self::key(pod, arg(1))) {
                Some(body) => {
                    let bytes = if self.tamper_helper { "tampered" } else { body.as_str() };
                    out(0, format!("{}  {}\n", hex::encode(Sha256::digest(bytes.as_bytes())), arg(1)), "")
                }
                None => out(1, "", "sha256sum: No such file or directory"),
            },
            "sh" if arg(1) == "-c" => {
                let script = arg(2);
                if let Some(rest) = script.strip_prefix("cat > ") {
                    let path = rest.split(" <<").next().unwrap_or("").trim_matches('\'');
                    let body = script
                        .split_once('\n')
                        .and_then(|(_, tail)| tail.rsplit_once("COURIER_HELPER_EOF"))
                        .map(|(body, _)| body.to_string())
                        .unwrap_or_default();
                    self.helpers.insert(Self::key(pod, path), body);
                }
                out(0, "", "")
            }
            "sh" => self.run_helper(pod, request),
            "uname" => out(0, "Linux db 5.15.0 x86_64 GNU/Linux\n", ""),
            "jcmd" => out(0, "1:\nDump written\n", ""),
            other => out(127, "", format!("{}: command not found", other)),
        }
    }

    fn run_helper(&mut self, pod: &str, request: &ExecRequest) -> ExecOutput {
        let argv = &request.argv;
        if !self.helpers.contains_key(&Self::key(pod, &argv[1])) {
            return out(127, "", "helper not installed");
        }
        if !request.env.iter().any(|(k, _)| k == "AWS_ACCESS_KEY_ID") {
            return out(2, "", "missing credentials");
        }
        let key = flag(argv, "--key").unwrap_or("").to_string();
        match argv.get(2).map(String::as_str) {
            Some("upload") => {
                let file = argv.get(3).cloned().unwrap_or_default();
                if self.fail_upload.contains(&file) {
                    return out(1, "", "upload failed: access denied");
                }
                let Some(size) = self.files.get(&Self::key(pod, &file)).copied() else {
                    return out(1, "", "local file missing");
                };
                self.uploaded.insert(key, size);
                if let Some(original) = file.strip_suffix(".gz") {
                    if let Some(grown) = self.grow_on_upload.get(original).copied() {
                        self.files.insert(Self::key(pod, original), grown);
                    }
                }
                out(0, "upload verified\n", "")
            }
            Some("verify") => {
                let expected = flag(argv, "--expected-size").and_then(|s| s.parse::<u64>().ok());
                match (self.uploaded.get(&key), expected) {
                    (Some(size), Some(expected)) if *size == expected => out(0, "verified\n", ""),
                    (Some(_), _) => out(3, "", "size mismatch"),
                    (None, _) => out(4, "", "object not found"),
                }
            }
            _ => out(64, "", "usage"),
        }
    }
}

#[async_trait]
impl RemoteExecutor for FakePod {
    async fn exec(&self, pod: &PodRef, request: &ExecRequest) -> Result<ExecOutput, ExecError> {
        let mut state = self.lock();
        state.calls.push(Call {
            pod: pod.name.clone(),
            argv: request.argv.clone(),
            env: request.env.clone(),
        });
        let program = request.argv.first().cloned().unwrap_or_default();
        if let Some(remaining) = state.transport_failures.get_mut(&program) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ExecError::Transport {
                    pod: pod.name.clone(),
                    command: request.display(),
                    message: "connection reset".to_string(),
                });
            }
        }
        Ok(state.run(&pod.name, request))
    }
}

/// Credential broker that counts requests.
#[derive(Default)]
pub struct CountingBroker {
    pub requests: AtomicUsize,
    pub fail: bool,
}

impl CountingBroker {
    pub fn failing() -> Self {
        Self {
            requests: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialBroker for CountingBroker {
    async fn issue(&self, _identity: &str, duration: Duration) -> Result<UploadCredentials, CredentialError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CredentialError::Rejected("identity not allowed".to_string()));
        }
        Ok(UploadCredentials {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
            region: "eu-west-1".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(duration.as_secs() as i64),
        })
    }
}

pub fn command(alert_id: &str, kind: CommandKind, priority: i32) -> Command {
    Command {
        alert_id: alert_id.to_string(),
        correlation_id: format!("corr-{}", alert_id),
        cluster_context: "c1".to_string(),
        kind,
        namespace: "ns".to_string(),
        pod_selector: PodSelector::Name("db-0".to_string()),
        priority,
        labels: BTreeMap::new(),
        created_at: Utc::now(),
    }
}
