//! Heartbeats, cooperative cancellation and stall supervision for long-running work

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StageError;

/// Last liveness signal of an activity
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub at: Instant,
    pub stage: String,
    pub count: u64,
}

/// Context handed to every unit of remote work.
///
/// Cloning shares the same cancellation token and heartbeat channel.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    name: Arc<str>,
    cancel: CancellationToken,
    heartbeat: Arc<watch::Sender<Heartbeat>>,
}

impl ActivityContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_token(name, CancellationToken::new())
    }

    /// Context cancelled whenever `parent` is.
    pub fn child_of(name: impl Into<String>, parent: &CancellationToken) -> Self {
        Self::with_token(name, parent.child_token())
    }

    fn with_token(name: impl Into<String>, cancel: CancellationToken) -> Self {
        let (tx, _rx) = watch::channel(Heartbeat {
            at: Instant::now(),
            stage: "started".to_string(),
            count: 0,
        });
        Self {
            name: Arc::from(name.into()),
            cancel,
            heartbeat: Arc::new(tx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heartbeat(&self, stage: &str) {
        self.heartbeat.send_modify(|hb| {
            hb.at = Instant::now();
            hb.stage = stage.to_string();
            hb.count += 1;
        });
    }

    pub fn last_heartbeat(&self) -> Heartbeat {
        self.heartbeat.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checked between remote calls.
    pub fn check_cancelled(&self) -> Result<(), StageError> {
        if self.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn subscribe(&self) -> watch::Receiver<Heartbeat> {
        self.heartbeat.subscribe()
    }
}

/// Drive `fut` to completion, cancelling `ctx` if no heartbeat arrives within `timeout`.
///
/// The future is never dropped early; it is expected to notice the
/// cancellation at its next remote-call boundary and return.
pub async fn supervise<F: Future>(ctx: &ActivityContext, timeout: Duration, fut: F) -> F::Output {
    let mut heartbeats = ctx.subscribe();
    let mut watching = true;
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return output,
            changed = tokio::time::timeout(timeout, heartbeats.changed()), if watching => {
                match changed {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => watching = false,
                    Err(_) => {
                        let last = ctx.last_heartbeat();
                        warn!(
                            activity = %ctx.name(),
                            last_stage = %last.stage,
                            heartbeats = last.count,
                            timeout_secs = timeout.as_secs(),
                            "No heartbeat within timeout, cancelling stalled activity"
                        );
                        ctx.cancel();
                        watching = false;
                    }
                }
            }
        }
    }
}

/// Await `fut` while heartbeating `stage` every `interval`.
pub async fn with_heartbeats<F: Future>(
    ctx: &ActivityContext,
    interval: Duration,
    stage: &str,
    fut: F,
) -> F::Output {
    let mut ticker = tokio::time::interval(interval);
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return output,
            _ = ticker.tick() => {
                debug!(activity = %ctx.name(), stage = %stage, "Heartbeat");
                ctx.heartbeat(stage);
            }
        }
    }
}
