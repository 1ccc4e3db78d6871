//! Integration tests for the job lifecycle
//!
//! Drives the orchestrator and gateway directly with a stub signer, no
//! network involved.

mod common;

use common::{body, fast_cleanup, signed, StubSigner, TestContext};
use signing_server::orchestrator::OrchestratorConfig;
use signing_server::{AppMetadata, Download, Gateway, GatewayError, JobState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

fn gateway(ctx: &TestContext) -> Gateway {
    Gateway::new(
        Arc::clone(ctx.orchestrator.registry()),
        Arc::clone(ctx.orchestrator.workspace()),
    )
}

async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
    let mut data = Vec::new();
    file.read_to_end(&mut data).await.unwrap();
    data
}

#[tokio::test]
async fn test_status_is_pending_right_after_submit() {
    let gate = Arc::new(Semaphore::new(0));
    let ctx = TestContext::new(
        StubSigner::succeeding().gated(gate.clone()),
        OrchestratorConfig::default(),
    )
    .await;

    let id = ctx.submit(b"0123456789").await.unwrap();

    let status = ctx.orchestrator.status(id).unwrap();
    assert_eq!(status.id, id);
    assert!(status.processing);
    assert!(!status.success);
    assert!(status.error.is_empty());

    // the upload is on disk before submit returns
    let input = ctx.work_root().join(id.to_string()).join("file");
    assert_eq!(std::fs::read(input).unwrap(), b"0123456789");

    gate.add_permits(1);
    assert!(ctx.wait_terminal(id).await.success);
}

/// Upload, sign, download once; the second download finds nothing
#[tokio::test]
async fn test_successful_job_is_downloaded_once() {
    let ctx = TestContext::new(StubSigner::succeeding(), OrchestratorConfig::default()).await;
    let gateway = gateway(&ctx);
    let upload = b"MZ\x90\x00unsigned";

    let id = ctx.submit(upload).await.unwrap();
    let status = ctx.wait_terminal(id).await;
    assert!(status.success);
    assert!(status.error.is_empty());

    match gateway.download(id).await.unwrap() {
        Download::Ready { job_id, file, size } => {
            assert_eq!(job_id, id);
            assert_eq!(size, signed(upload).len() as u64);
            // scope is gone, the open handle still reads
            assert!(!ctx.work_root().join(id.to_string()).exists());
            assert_eq!(read_all(file).await, signed(upload));
        }
        other => panic!("expected a ready download, got {:?}", other),
    }

    assert!(matches!(
        gateway.download(id).await,
        Err(GatewayError::NotFound(n)) if n == id
    ));
    assert!(matches!(
        ctx.orchestrator.status(id),
        Err(GatewayError::NotFound(_))
    ));
}

/// A signer failure surfaces through status and download, never the artifact
#[tokio::test]
async fn test_failed_job_reports_signer_output() {
    let ctx = TestContext::new(StubSigner::failing("token error"), OrchestratorConfig::default())
        .await;
    let gateway = gateway(&ctx);

    let id = ctx.submit(b"0123456789").await.unwrap();
    let status = ctx.wait_terminal(id).await;

    assert!(!status.processing);
    assert!(!status.success);
    assert!(status.error.contains("token error"), "{}", status.error);
    assert!(status.error.starts_with("failed to sign file"));

    match gateway.download(id).await.unwrap() {
        Download::Failed(error) => assert_eq!(error, status.error),
        other => panic!("expected a failure, got {:?}", other),
    }

    // scope removed at once, entry kept until the cleanup delay
    assert!(!ctx.work_root().join(id.to_string()).exists());
    assert!(ctx.orchestrator.status(id).is_ok());
}

#[tokio::test]
async fn test_download_while_pending() {
    let gate = Arc::new(Semaphore::new(0));
    let ctx = TestContext::new(
        StubSigner::succeeding().gated(gate.clone()),
        OrchestratorConfig::default(),
    )
    .await;
    let gateway = gateway(&ctx);

    let id = ctx.submit(b"data").await.unwrap();
    assert!(matches!(
        gateway.download(id).await,
        Ok(Download::InProgress)
    ));

    // still downloadable once finished
    gate.add_permits(1);
    ctx.wait_terminal(id).await;
    assert!(matches!(
        gateway.download(id).await,
        Ok(Download::Ready { .. })
    ));
}

fn payload(i: usize) -> Vec<u8> {
    if i % 2 == 1 {
        format!("payload-{}#fail", i).into_bytes()
    } else {
        format!("payload-{}", i).into_bytes()
    }
}

/// Each concurrent job ends in its own outcome with its own artifact
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_resolve_independently() {
    let ctx = TestContext::new(StubSigner::per_input(), OrchestratorConfig::default()).await;
    let gateway = gateway(&ctx);

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let orchestrator = Arc::clone(&ctx.orchestrator);
            tokio::spawn(async move {
                let id = orchestrator
                    .submit(body(&payload(i)), AppMetadata::default())
                    .await
                    .unwrap();
                (i, id)
            })
        })
        .collect();

    let mut jobs = Vec::new();
    for handle in handles {
        jobs.push(handle.await.unwrap());
    }

    let ids: HashSet<i64> = jobs.iter().map(|(_, id)| *id).collect();
    assert_eq!(ids.len(), 32);

    for (i, id) in jobs {
        let status = ctx.wait_terminal(id).await;
        assert_eq!(status.id, id);

        if i % 2 == 1 {
            assert!(!status.success, "job {} should fail", i);
            let own = format!("token error: payload-{}#fail", i);
            assert!(status.error.ends_with(&own), "{}", status.error);
            match gateway.download(id).await.unwrap() {
                Download::Failed(error) => assert_eq!(error, status.error),
                other => panic!("expected a failure for {}, got {:?}", i, other),
            }
        } else {
            assert!(status.success, "job {} failed: {}", i, status.error);
            match gateway.download(id).await.unwrap() {
                Download::Ready { file, .. } => {
                    assert_eq!(read_all(file).await, signed(&payload(i)))
                }
                other => panic!("expected an artifact for {}, got {:?}", i, other),
            }
        }
    }
    assert_eq!(ctx.signer.calls(), 32);
}

#[tokio::test]
async fn test_unconsumed_job_is_cleaned_up() {
    let ctx = TestContext::new(
        StubSigner::succeeding(),
        fast_cleanup(Duration::from_millis(100)),
    )
    .await;

    let id = ctx.submit(b"never downloaded").await.unwrap();
    assert!(ctx.wait_terminal(id).await.success);
    assert!(ctx.work_root().join(id.to_string()).exists());

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(matches!(
        ctx.orchestrator.status(id),
        Err(GatewayError::NotFound(_))
    ));
    assert!(!ctx.work_root().join(id.to_string()).exists());
    assert!(ctx.orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_failed_job_expires() {
    let ctx = TestContext::new(
        StubSigner::failing("token error"),
        fast_cleanup(Duration::from_millis(100)),
    )
    .await;

    let id = ctx.submit(b"data").await.unwrap();
    ctx.wait_terminal(id).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        ctx.orchestrator.status(id),
        Err(GatewayError::NotFound(_))
    ));
}

/// Cleanup firing after a download must not disturb anything
#[tokio::test]
async fn test_cleanup_after_download_is_noop() {
    let ctx = TestContext::new(
        StubSigner::succeeding(),
        fast_cleanup(Duration::from_millis(100)),
    )
    .await;
    let gateway = gateway(&ctx);

    let id = ctx.submit(b"data").await.unwrap();
    ctx.wait_terminal(id).await;
    assert!(matches!(
        gateway.download(id).await,
        Ok(Download::Ready { .. })
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ctx.orchestrator.registry().is_empty());
    assert_eq!(ctx.scope_count(), 0);
}

#[tokio::test]
async fn test_oversized_upload_creates_no_job() {
    let ctx = TestContext::new(
        StubSigner::succeeding(),
        OrchestratorConfig {
            max_upload_bytes: 8,
            ..Default::default()
        },
    )
    .await;

    let result = ctx.submit(b"0123456789abcdef").await;
    assert!(matches!(
        result,
        Err(GatewayError::UploadTooLarge { limit: 8 })
    ));
    assert!(ctx.orchestrator.registry().is_empty());
    assert_eq!(ctx.scope_count(), 0);
    assert_eq!(ctx.signer.calls(), 0);

    // exactly at the limit is fine
    let id = ctx.submit(b"01234567").await.unwrap();
    assert!(ctx.wait_terminal(id).await.success);
}

#[tokio::test]
async fn test_broken_upload_creates_no_job() {
    let ctx = TestContext::new(StubSigner::succeeding(), OrchestratorConfig::default()).await;

    let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
        Ok(bytes::Bytes::from_static(b"partial")),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        )),
    ];
    let result = ctx
        .orchestrator
        .submit(futures::stream::iter(chunks), AppMetadata::default())
        .await;

    match result {
        Err(GatewayError::Resource(msg)) => assert!(msg.contains("connection reset"), "{}", msg),
        other => panic!("expected a resource error, got {:?}", other),
    }
    assert!(ctx.orchestrator.registry().is_empty());
    assert_eq!(ctx.scope_count(), 0);
}

#[tokio::test]
async fn test_signer_concurrency_is_bounded() {
    let gate = Arc::new(Semaphore::new(0));
    let ctx = TestContext::new(
        StubSigner::succeeding().gated(gate.clone()),
        OrchestratorConfig {
            max_concurrent_signers: 2,
            ..Default::default()
        },
    )
    .await;

    let mut ids = Vec::new();
    for i in 0..5u8 {
        ids.push(ctx.submit(&[i; 16]).await.unwrap());
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.signer.running(), 2);
    assert_eq!(ctx.orchestrator.registry().len(), 5);
    for id in &ids {
        assert!(ctx.orchestrator.status(*id).unwrap().processing);
    }

    gate.add_permits(5);
    for id in ids {
        assert!(ctx.wait_terminal(id).await.success);
    }
    assert_eq!(ctx.signer.peak(), 2);
    assert_eq!(ctx.signer.calls(), 5);
}

#[tokio::test]
async fn test_metadata_reaches_signer() {
    let ctx = TestContext::new(StubSigner::succeeding(), OrchestratorConfig::default()).await;

    let metadata = AppMetadata::new(
        Some("Example Tool".to_string()),
        Some("https://example.com".to_string()),
    )
    .unwrap();
    let id = ctx
        .orchestrator
        .submit(body(b"data"), metadata.clone())
        .await
        .unwrap();
    ctx.wait_terminal(id).await;

    assert_eq!(ctx.signer.seen_metadata(), vec![metadata]);
}

#[tokio::test]
async fn test_registry_state_after_success() {
    let ctx = TestContext::new(StubSigner::succeeding(), OrchestratorConfig::default()).await;

    let id = ctx.submit(b"data").await.unwrap();
    ctx.wait_terminal(id).await;

    let job = ctx.orchestrator.registry().get(id).unwrap();
    match job.state {
        JobState::Succeeded { artifact } => {
            assert!(artifact.starts_with(ctx.work_root().join(id.to_string())));
            assert_eq!(std::fs::read(artifact).unwrap(), signed(b"data"));
        }
        other => panic!("expected success, got {:?}", other),
    }
}
