//! Retry, heartbeat and cancellation primitives for remote work

mod activity;
mod retry;

pub use activity::{supervise, with_heartbeats, ActivityContext, Heartbeat};
pub use retry::{retry_with, RetryPolicy};
