//! Per-job working directories
//!
//! Every job owns one directory under the configured root:
//!
//! ```text
//! <work_dir>/
//! ├── 1718000000000/
//! │   ├── file          # uploaded input (signed in place by jsign)
//! │   └── file.signed   # separate output (osslsigncode)
//! └── 1718000000001/
//! ```
//!
//! The manager does not track ownership. The orchestrator decides when a
//! scope is destroyed.

use crate::error::GatewayError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// File name of the uploaded input inside a scope
pub const INPUT_FILE_NAME: &str = "file";

/// Handle to an allocated job directory
#[derive(Debug, Clone)]
pub struct Scope {
    pub job_id: i64,
    pub dir: PathBuf,
}

impl Scope {
    /// Path the upload is written to
    pub fn input_path(&self) -> PathBuf {
        self.dir.join(INPUT_FILE_NAME)
    }
}

/// Allocates and destroys job directories under a single root
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager, making sure the root exists
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self, GatewayError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            GatewayError::Resource(format!(
                "failed to create working directory {}: {}",
                root.display(),
                e
            ))
        })?;

        info!(path = %root.display(), "Initialized workspace");

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a job, whether or not it exists
    pub fn scope_dir(&self, job_id: i64) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create a fresh, empty directory for `job_id`
    ///
    /// Fails if the directory already exists.
    pub async fn allocate(&self, job_id: i64) -> Result<Scope, GatewayError> {
        let dir = self.scope_dir(job_id);

        fs::create_dir(&dir).await.map_err(|e| {
            GatewayError::Resource(format!("failed to create working directory: {}", e))
        })?;

        debug!(job_id, working_dir = %dir.display(), "Allocated working directory");

        Ok(Scope { job_id, dir })
    }

    /// Recursively remove the directory for `job_id`
    ///
    /// Removing an absent directory is not an error.
    pub async fn destroy(&self, job_id: i64) -> Result<(), GatewayError> {
        let dir = self.scope_dir(job_id);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(job_id, working_dir = %dir.display(), "Destroyed working directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(job_id, error = %e, "Failed to cleanup working directory");
                Err(GatewayError::Resource(format!(
                    "failed to cleanup working directory: {}",
                    e
                )))
            }
        }
    }

    /// Remove the whole root, used at shutdown
    pub async fn purge(&self) -> Result<(), GatewayError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                info!(path = %self.root.display(), "Removed working directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::Resource(format!(
                "failed to cleanup working directory: {}",
                e
            ))),
        }
    }
}
