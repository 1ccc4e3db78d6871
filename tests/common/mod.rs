//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use signing_server::orchestrator::OrchestratorConfig;
use signing_server::{
    AppMetadata, GatewayError, HttpServer, JobOrchestrator, JobRegistry, JobStatus, SignOutcome,
    SignRequest, Signer, SignerError, WorkspaceManager,
};
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

pub const TEST_KEY: &str = "test-request-key";

/// Prefix the stub writes in front of the input to form the artifact
pub const SIGNED_PREFIX: &[u8] = b"SIGNED:";

/// What the stub does once released
#[derive(Debug, Clone)]
pub enum StubOutcome {
    /// Write `SIGNED:<input>` to `<input>.signed`
    Succeed,
    /// Exit non-zero with this output
    Fail(String),
    /// Fail inputs containing [`FAIL_MARKER`] with the input echoed as the
    /// output, succeed otherwise
    PerInput,
}

/// Payload marker that makes a [`StubOutcome::PerInput`] stub fail
pub const FAIL_MARKER: &[u8] = b"#fail";

/// Deterministic in-process signer
///
/// With a gate, every invocation blocks until a permit is released, which
/// keeps jobs Pending for as long as a test needs.
pub struct StubSigner {
    outcome: StubOutcome,
    gate: Option<Arc<Semaphore>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    seen: Mutex<Vec<AppMetadata>>,
}

impl StubSigner {
    pub fn new(outcome: StubOutcome) -> Self {
        Self {
            outcome,
            gate: None,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(StubOutcome::Succeed)
    }

    pub fn failing(output: &str) -> Self {
        Self::new(StubOutcome::Fail(output.to_string()))
    }

    pub fn per_input() -> Self {
        Self::new(StubOutcome::PerInput)
    }

    /// Block every invocation on `gate`
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_metadata(&self) -> Vec<AppMetadata> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signer for StubSigner {
    fn name(&self) -> &str {
        "stub"
    }

    async fn sign(&self, request: &SignRequest) -> Result<SignOutcome, SignerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.metadata.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(ref gate) = self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let result = match self.outcome {
            StubOutcome::Succeed => Ok(write_artifact(request).await),
            StubOutcome::Fail(ref output) => Err(failed(output.clone())),
            StubOutcome::PerInput => {
                let input = tokio::fs::read(&request.input).await.unwrap();
                if input.windows(FAIL_MARKER.len()).any(|w| w == FAIL_MARKER) {
                    Err(failed(format!(
                        "token error: {}",
                        String::from_utf8_lossy(&input)
                    )))
                } else {
                    Ok(write_artifact(request).await)
                }
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

async fn write_artifact(request: &SignRequest) -> SignOutcome {
    let input = tokio::fs::read(&request.input).await.unwrap();
    let artifact = request.input.with_extension("signed");
    tokio::fs::write(&artifact, signed(&input)).await.unwrap();
    SignOutcome {
        artifact,
        output: "Adding Authenticode signature".to_string(),
    }
}

fn failed(output: String) -> SignerError {
    SignerError::Failed {
        status: exit_failure(),
        output,
    }
}

/// Exit status of a process that exited with code 1
pub fn exit_failure() -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(1 << 8)
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(1)
    }
}

/// Expected artifact contents for an upload
pub fn signed(input: &[u8]) -> Vec<u8> {
    let mut out = SIGNED_PREFIX.to_vec();
    out.extend_from_slice(input);
    out
}

pub struct TestContext {
    pub orchestrator: Arc<JobOrchestrator>,
    pub signer: Arc<StubSigner>,
    pub temp: TempDir,
}

impl TestContext {
    pub async fn new(signer: StubSigner, config: OrchestratorConfig) -> Self {
        let temp = TempDir::new().unwrap();
        let signer = Arc::new(signer);
        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(JobRegistry::new()),
            Arc::new(WorkspaceManager::new(temp.path().join("work")).await.unwrap()),
            signer.clone(),
            config,
        ));

        Self {
            orchestrator,
            signer,
            temp,
        }
    }

    pub fn work_root(&self) -> std::path::PathBuf {
        self.orchestrator.workspace().root().to_path_buf()
    }

    /// Number of job directories currently on disk
    pub fn scope_count(&self) -> usize {
        std::fs::read_dir(self.work_root()).unwrap().count()
    }

    pub async fn submit(&self, data: &[u8]) -> Result<i64, GatewayError> {
        self.orchestrator
            .submit(body(data), AppMetadata::default())
            .await
    }

    /// Poll until the job leaves Pending
    pub async fn wait_terminal(&self, job_id: i64) -> JobStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = self.orchestrator.status(job_id).unwrap();
            if !status.processing {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} never finished",
                job_id
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Serve the HTTP API on an ephemeral local port
    pub async fn spawn_server(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(HttpServer::new(
            Arc::clone(&self.orchestrator),
            TEST_KEY,
            addr,
        ));
        tokio::spawn(server.serve(listener));
        addr
    }
}

/// Upload body delivered in small chunks
pub fn body(
    data: &[u8],
) -> impl futures::Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send + 'static {
    let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = data
        .chunks(4)
        .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(chunks)
}

/// Config with a short cleanup delay
pub fn fast_cleanup(delay: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        cleanup_delay: delay,
        ..Default::default()
    }
}
