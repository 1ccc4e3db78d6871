//! Signing Server - code signing as an asynchronous network service
//!
//! A client uploads an unsigned binary, the service runs an external signing
//! tool against a hardware-backed key, and the client polls for completion
//! and downloads the signed artifact exactly once.
//!
//! ## Architecture
//!
//! - **Workspace**: private directory per job under one root
//! - **Signer**: opaque external tool (`jsign` in place, `osslsigncode` separate output)
//! - **Registry**: concurrent map of job id to state
//! - **Orchestrator**: upload → scope → pending job → background signing → cleanup
//! - **Gateway**: status reads and the consuming download
//!
//! ## Job Lifecycle
//!
//! ```text
//! POST /sign ──► Pending ──► Succeeded ──► GET /download ──► removed
//!                   │                 └──(cleanup delay)───► removed
//!                   └──────► Failed ────(cleanup delay)────► removed
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod signer;
pub mod stream;
pub mod workspace;

// Re-exports
pub use client::{ClientError, SigningClient};
pub use config::Args;
pub use error::GatewayError;
pub use gateway::{Download, Gateway};
pub use http::HttpServer;
pub use orchestrator::{JobOrchestrator, OrchestratorConfig};
pub use registry::{Job, JobRegistry, JobState, JobStatus};
pub use signer::{AppMetadata, CommandSigner, SignOutcome, SignRequest, Signer, SignerError, SignerKind};
pub use workspace::WorkspaceManager;
