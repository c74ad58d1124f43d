//! Crash dump pipeline: discover → compress → upload → verify → delete
//!
//! Nothing is ever deleted unless its remote copy was confirmed and the file
//! is unchanged since discovery.

pub mod compress;
pub mod credentials;
pub mod delete;
pub mod discovery;
mod orchestrator;
pub mod upload;
pub mod verify;


pub use credentials::{CredentialBroker, UploadCredentials, UPLOAD_IDENTITY};
pub use discovery::DiscoveryConfig;
pub use orchestrator::{CrashDumpPipeline, PipelineConfig};
pub use upload::{destination_key, UploadConfig};
pub use verify::VerificationMode;
