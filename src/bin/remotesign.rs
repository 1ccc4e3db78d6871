//! remotesign - submit a binary to a signing server and fetch the result
//!
//! ## Usage
//!
//! ```bash
//! ENDPOINT=sign.example.com REQUEST_TOKEN=secret \
//!     remotesign --input tool.exe --output tool-signed.exe --appname Tool
//! ```
//!
//! Exit codes: 1 missing endpoint/token, 2 missing input/output, 3 input
//! unreadable, 4 job creation failed, 5 status polling failed, 6 job or
//! download failed, 7 output not creatable, 8 output write failed.

use clap::Parser;
use signing_server::client::DEFAULT_POLL_INTERVAL;
use signing_server::config::LogFormat;
use signing_server::{logging, ClientError, SigningClient};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

const SPINNER_FRAMES: [&str; 8] = ["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];
const SPINNER_TICK: Duration = Duration::from_millis(100);

/// Remote code-signing client
#[derive(Parser, Debug)]
#[command(name = "remotesign")]
#[command(about = "Sign a binary on a remote signing server")]
struct Cli {
    /// Input file
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Application name
    #[arg(long)]
    appname: Option<String>,

    /// Application URL
    #[arg(long)]
    appurl: Option<String>,

    /// Signing server host or URL
    #[arg(long, env = "ENDPOINT", hide = true)]
    endpoint: Option<String>,

    /// Shared secret for the signing server
    #[arg(long, env = "REQUEST_TOKEN", hide = true, hide_env_values = true)]
    request_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Elapsed-time spinner drawn on stdout while the job runs
struct Spinner {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Spinner {
    fn start() -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let started = Instant::now();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SPINNER_TICK);
            let mut frame = 0;
            loop {
                tokio::select! {
                    _ = &mut stopped => {
                        print!("\x1b[2K\r✓ Done ({}s)\n", started.elapsed().as_secs());
                        let _ = std::io::stdout().flush();
                        return;
                    }
                    _ = ticker.tick() => {
                        print!(
                            "\r{} Processing... ({}s)",
                            SPINNER_FRAMES[frame],
                            started.elapsed().as_secs()
                        );
                        let _ = std::io::stdout().flush();
                        frame = (frame + 1) % SPINNER_FRAMES.len();
                    }
                }
            }
        });

        Self { stop, task }
    }

    async fn finish(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

fn fail(code: i32) -> ! {
    std::process::exit(code)
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    logging::init(&cli.log_level, LogFormat::Text);

    let Some(endpoint) = cli.endpoint.filter(|e| !e.is_empty()) else {
        error!("Endpoint is required");
        fail(1);
    };
    let Some(token) = cli.request_token.filter(|t| !t.is_empty()) else {
        error!("Request token is required");
        fail(1);
    };
    let Some(input) = cli.input else {
        error!("Input file is required");
        fail(2);
    };
    let Some(output) = cli.output else {
        error!("Output file is required");
        fail(2);
    };

    let client = match SigningClient::new(&endpoint, token) {
        Ok(client) => client.with_application(cli.appname, cli.appurl),
        Err(e) => {
            error!(error = %e, "Invalid endpoint");
            fail(1);
        }
    };

    let file = match tokio::fs::File::open(&input).await {
        Ok(file) => file,
        Err(e) => {
            error!(error = %e, input = %input.display(), "Failed to open input file");
            fail(3);
        }
    };

    let job_id = match client.create_job(file).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Failed to create job");
            fail(4);
        }
    };

    info!(job_id, "Job created");

    let spinner = if std::env::var_os("CI").is_some_and(|v| !v.is_empty()) {
        info!("Processing...");
        None
    } else {
        Some(Spinner::start())
    };

    let status = client.wait_for_completion(job_id, DEFAULT_POLL_INTERVAL).await;

    if let Some(spinner) = spinner {
        spinner.finish().await;
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            error!(error = %e, "Failed to get job status");
            fail(5);
        }
    };

    if !status.success {
        error!(job_id, error = %status.error, "Job failed");
        fail(6);
    }

    let mut out = match tokio::fs::File::create(&output).await {
        Ok(out) => out,
        Err(e) => {
            error!(error = %e, output = %output.display(), "Failed to create output file");
            fail(7);
        }
    };

    match client.download(job_id, &mut out).await {
        Ok(bytes) => info!(job_id, bytes, "File signed successfully"),
        Err(ClientError::Io(e)) => {
            error!(error = %e, "Failed to save output file");
            fail(8);
        }
        Err(e) => {
            error!(error = %e, "Failed to download file");
            fail(6);
        }
    }
}
