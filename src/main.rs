//! Signing Server Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Sign with jsign against a PIV token
//! REQUEST_KEY=secret TOKEN_PIN=123456 CERT_FILE=/etc/signing-server/cert.crt signing-server
//!
//! # Separate-output signer on a custom port
//! signing-server --listen 0.0.0.0:8080 --signer osslsigncode \
//!     --pkcs11-module /usr/lib/libykcs11.so --key-id 'pkcs11:id=%02'
//! ```
//!
//! ## HTTP API
//!
//! - `POST /sign` - Upload a binary, returns a job id
//! - `GET /status/{id}` - Job state
//! - `GET /download/{id}` - Signed binary (consumes the job)
//! - `GET /health` - Health check

use clap::Parser;
use signing_server::{
    logging, Args, HttpServer, JobOrchestrator, JobRegistry, Signer, WorkspaceManager,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let signer = args.build_signer();
    let work_dir = args.work_dir();

    info!("======================================");
    info!("  Signing Server");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Working directory: {}", work_dir.display());
    info!("Certificate: {}", args.cert_file.display());
    info!("Signer: {}", signer.name());
    info!("Max concurrent signers: {}", args.max_concurrent_signers);
    info!("Cleanup delay: {}s", args.cleanup_delay_secs);
    info!("======================================");

    let registry = Arc::new(JobRegistry::new());
    let workspace = Arc::new(WorkspaceManager::new(&work_dir).await?);
    let orchestrator = Arc::new(JobOrchestrator::new(
        registry,
        Arc::clone(&workspace),
        Arc::new(signer),
        args.orchestrator_config(),
    ));

    let http_server = Arc::new(
        HttpServer::new(orchestrator, args.request_key(), args.listen)
            .with_trusted_proxies(args.trusted_proxies.clone()),
    );

    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    let result = tokio::select! {
        result = http_server.run() => result,
        _ = shutdown => Ok(()),
    };

    if let Err(e) = workspace.purge().await {
        error!(error = %e, "Failed to cleanup working directory");
    }

    if let Err(e) = result {
        error!(error = %e, "HTTP server error");
        std::process::exit(1);
    }

    Ok(())
}
