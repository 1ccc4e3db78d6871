//! Status and download read side
//!
//! Download is a consuming read: the job entry is removed atomically before
//! the artifact is handed out, so a second download sees `NotFound`.

use crate::error::GatewayError;
use crate::registry::{Claim, JobRegistry, JobStatus};
use crate::workspace::WorkspaceManager;
use std::sync::Arc;
use tokio::fs::File;
use tracing::{error, info};

/// Result of a download attempt that is not an error
#[derive(Debug)]
pub enum Download {
    /// Signed artifact, opened and ready to stream
    Ready { job_id: i64, file: File, size: u64 },
    /// Signer has not finished
    InProgress,
    /// Signer failed with this error
    Failed(String),
}

pub struct Gateway {
    registry: Arc<JobRegistry>,
    workspace: Arc<WorkspaceManager>,
}

impl Gateway {
    pub fn new(registry: Arc<JobRegistry>, workspace: Arc<WorkspaceManager>) -> Self {
        Self {
            registry,
            workspace,
        }
    }

    pub fn status(&self, job_id: i64) -> Result<JobStatus, GatewayError> {
        self.registry.get(job_id).map(|job| job.status())
    }

    /// Hand out the signed artifact once, deleting the job and its scope
    ///
    /// The artifact is opened before the scope is removed; the open handle
    /// keeps the data readable while it streams.
    pub async fn download(&self, job_id: i64) -> Result<Download, GatewayError> {
        let artifact = match self.registry.claim(job_id)? {
            Claim::Artifact(artifact) => artifact,
            Claim::Pending => return Ok(Download::InProgress),
            Claim::Failed(error) => return Ok(Download::Failed(error)),
        };

        let opened = match File::open(&artifact).await {
            Ok(file) => file.metadata().await.map(|meta| (file, meta.len())),
            Err(e) => Err(e),
        };

        if let Err(e) = self.workspace.destroy(job_id).await {
            error!(job_id, error = %e, "Failed to cleanup working directory");
        }

        match opened {
            Ok((file, size)) => {
                info!(job_id, file = %artifact.display(), bytes = size, "Serving file");
                Ok(Download::Ready { job_id, file, size })
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to open file");
                Err(GatewayError::Resource(format!("failed to open file: {}", e)))
            }
        }
    }
}
