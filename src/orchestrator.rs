//! Job orchestration
//!
//! Ties the workspace, the registry and the signer together:
//!
//! ```text
//! submit ──► allocate scope ──► write upload ──► registry.create (Pending)
//!                                                     │
//!                                    spawn ◄──────────┘   (returns id)
//!                                      │
//!                        wait for a signer permit
//!                                      │
//!                         signer.sign(input) ... exits
//!                         ┌────────────┴─────────────┐
//!                    Succeeded                    Failed
//!              schedule cleanup          destroy scope now,
//!              after the delay           schedule registry removal
//! ```
//!
//! Signer invocations never run on the request path. A semaphore bounds how
//! many external processes run at once; extra jobs stay Pending until a
//! permit frees up.

use crate::error::GatewayError;
use crate::registry::{JobRegistry, JobStatus};
use crate::signer::{AppMetadata, SignOutcome, SignRequest, Signer, SignerError};
use crate::workspace::{Scope, WorkspaceManager};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Default grace period before an unconsumed job is removed (5 minutes)
pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_secs(5 * 60);

/// Default upload limit (1GB; executables rarely exceed this)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 1024 * 1024 * 1024;

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delay before a terminal job is removed if nobody downloaded it
    pub cleanup_delay: Duration,
    /// Upload size limit in bytes
    pub max_upload_bytes: u64,
    /// Signer processes allowed to run at once
    pub max_concurrent_signers: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cleanup_delay: DEFAULT_CLEANUP_DELAY,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_concurrent_signers: 4,
        }
    }
}

/// Millisecond-timestamp job ids, forced strictly increasing
#[derive(Debug, Default)]
pub struct JobIdGenerator {
    last: AtomicI64,
}

impl JobIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max(now_ms, last + 1)`, so ids stay unique within the process even
    /// when two jobs land in the same millisecond or the clock steps back
    pub fn next_id(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// State shared with background tasks
#[derive(Clone)]
struct Lifecycle {
    registry: Arc<JobRegistry>,
    workspace: Arc<WorkspaceManager>,
    cleanup_delay: Duration,
}

impl Lifecycle {
    /// Record the signer result on the job
    async fn complete(&self, job_id: i64, result: Result<SignOutcome, SignerError>) {
        match result {
            Ok(outcome) => {
                if let Err(e) = self.registry.mark_succeeded(job_id, outcome.artifact) {
                    error!(job_id, error = %e, "Failed to record job success");
                    let _ = self.workspace.destroy(job_id).await;
                    return;
                }
                info!(job_id, output = %outcome.output.trim(), "Job completed");
                self.schedule_cleanup(job_id);
            }
            Err(err) => {
                let message = err.to_string();
                error!(job_id, error = %message, "Job failed");

                // scope is gone before the failure becomes visible
                let _ = self.workspace.destroy(job_id).await;
                if let Err(e) = self.registry.mark_failed(job_id, message) {
                    error!(job_id, error = %e, "Failed to record job failure");
                }
                self.schedule_cleanup(job_id);
            }
        }
    }

    fn schedule_cleanup(&self, job_id: i64) {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(lifecycle.cleanup_delay).await;
            lifecycle.cleanup(job_id).await;
        });
    }

    /// Drop an unconsumed job. A job already taken by download is left alone,
    /// the downloader owns its scope.
    async fn cleanup(&self, job_id: i64) {
        if self.registry.remove(job_id).is_some() {
            debug!(job_id, "Cleaning up expired job");
            let _ = self.workspace.destroy(job_id).await;
        }
    }
}

/// Accepts uploads and drives each job to a terminal state
pub struct JobOrchestrator {
    lifecycle: Lifecycle,
    signer: Arc<dyn Signer>,
    permits: Arc<Semaphore>,
    ids: JobIdGenerator,
    config: OrchestratorConfig,
}

impl JobOrchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        workspace: Arc<WorkspaceManager>,
        signer: Arc<dyn Signer>,
        config: OrchestratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_signers.max(1)));

        Self {
            lifecycle: Lifecycle {
                registry,
                workspace,
                cleanup_delay: config.cleanup_delay,
            },
            signer,
            permits,
            ids: JobIdGenerator::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.lifecycle.registry
    }

    pub fn workspace(&self) -> &Arc<WorkspaceManager> {
        &self.lifecycle.workspace
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Persist an upload, register a pending job and start signing in the
    /// background. Returns as soon as the job exists.
    ///
    /// On any failure before the job is registered, the scope is destroyed
    /// and no job is created.
    pub async fn submit<S, E>(&self, body: S, metadata: AppMetadata) -> Result<i64, GatewayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let job_id = self.ids.next_id();
        let workspace = &self.lifecycle.workspace;

        let scope = workspace.allocate(job_id).await?;
        info!(job_id, working_dir = %scope.dir.display(), "Working directory");

        let size = match self.persist_upload(&scope, body).await {
            Ok(size) => size,
            Err(e) => {
                error!(job_id, error = %e, "Failed to save file");
                let _ = workspace.destroy(job_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.lifecycle.registry.create(job_id) {
            let _ = workspace.destroy(job_id).await;
            return Err(e);
        }

        info!(job_id, bytes = size, signer = self.signer.name(), "Processing job");

        self.spawn_signing(scope, metadata);

        Ok(job_id)
    }

    /// Current state of a job
    pub fn status(&self, job_id: i64) -> Result<JobStatus, GatewayError> {
        self.lifecycle.registry.get(job_id).map(|job| job.status())
    }

    /// Drain the body into the scope's input file and sync it to disk
    async fn persist_upload<S, E>(&self, scope: &Scope, body: S) -> Result<u64, GatewayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let limit = self.config.max_upload_bytes;
        let path = scope.input_path();

        let mut file = File::create(&path)
            .await
            .map_err(|e| GatewayError::Resource(format!("failed to create file: {}", e)))?;

        debug!(job_id = scope.job_id, file = %path.display(), "Saving file");

        let mut body = std::pin::pin!(body);
        let mut written: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| GatewayError::Resource(format!("failed to save file: {}", e)))?;

            written += chunk.len() as u64;
            if written > limit {
                return Err(GatewayError::UploadTooLarge { limit });
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| GatewayError::Resource(format!("failed to save file: {}", e)))?;
        }

        file.flush()
            .await
            .map_err(|e| GatewayError::Resource(format!("failed to save file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| GatewayError::Resource(format!("failed to save file: {}", e)))?;

        Ok(written)
    }

    fn spawn_signing(&self, scope: Scope, metadata: AppMetadata) {
        let lifecycle = self.lifecycle.clone();
        let signer = Arc::clone(&self.signer);
        let permits = Arc::clone(&self.permits);
        let job_id = scope.job_id;

        tokio::spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(job_id, "Signer pool closed");
                    lifecycle
                        .complete(
                            job_id,
                            Err(SignerError::Spawn(std::io::Error::other("signer pool closed"))),
                        )
                        .await;
                    return;
                }
            };

            debug!(job_id, "Signer slot acquired");

            let request = SignRequest {
                job_id,
                input: scope.input_path(),
                metadata,
            };
            let result = signer.sign(&request).await;
            drop(permit);

            lifecycle.complete(job_id, result).await;
        });
    }
}
