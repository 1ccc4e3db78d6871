//! External signing tool invocation
//!
//! The signing tool is an opaque subprocess. Two tools are supported:
//!
//! | Tool | Output |
//! |------|--------|
//! | `jsign` | Signs the input file in place |
//! | `osslsigncode` | Writes a separate `file.signed` next to the input |
//!
//! Both sit behind the [`Signer`] trait, which yields either the path of the
//! signed artifact or a failure carrying the tool's combined output verbatim.
//! Arguments are passed directly to the process (no shell), and any
//! client-supplied metadata is validated before it reaches the command line.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Longest accepted application name or URL, in bytes
pub const MAX_METADATA_LEN: usize = 512;

/// Suffix of the artifact produced by separate-output tools
pub const SIGNED_SUFFIX: &str = "signed";

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("failed to start signer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{}", failure_message(.status, .output))]
    Failed { status: ExitStatus, output: String },

    #[error("signer exited successfully but produced no artifact at {0}")]
    MissingArtifact(PathBuf),

    #[error("invalid application metadata: {0}")]
    InvalidMetadata(String),
}

fn failure_message(status: &ExitStatus, output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        format!("failed to sign file: {}", status)
    } else {
        format!("failed to sign file: {}: {}", status, output)
    }
}

/// Which external tool to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SignerKind {
    /// jsign, signs in place
    Jsign,
    /// osslsigncode, writes a separate output file
    Osslsigncode,
}

impl SignerKind {
    pub fn default_program(&self) -> &'static str {
        match self {
            Self::Jsign => "jsign",
            Self::Osslsigncode => "osslsigncode",
        }
    }

    pub fn signs_in_place(&self) -> bool {
        matches!(self, Self::Jsign)
    }
}

impl std::fmt::Display for SignerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_program())
    }
}

/// Optional application metadata forwarded by the client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppMetadata {
    pub name: Option<String>,
    pub url: Option<String>,
}

impl AppMetadata {
    /// Validate client-supplied metadata. Empty values count as absent.
    pub fn new(name: Option<String>, url: Option<String>) -> Result<Self, SignerError> {
        let name = name.filter(|n| !n.is_empty());
        let url = url.filter(|u| !u.is_empty());

        if let Some(ref n) = name {
            check_value("application name", n)?;
        }
        if let Some(ref u) = url {
            check_value("application url", u)?;
            let parsed = url::Url::parse(u).map_err(|e| {
                SignerError::InvalidMetadata(format!("application url is not a valid URL: {}", e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SignerError::InvalidMetadata(format!(
                    "application url must be http or https, got {}",
                    parsed.scheme()
                )));
            }
        }

        Ok(Self { name, url })
    }
}

fn check_value(field: &str, value: &str) -> Result<(), SignerError> {
    if value.len() > MAX_METADATA_LEN {
        return Err(SignerError::InvalidMetadata(format!(
            "{} exceeds {} bytes",
            field, MAX_METADATA_LEN
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(SignerError::InvalidMetadata(format!(
            "{} contains control characters",
            field
        )));
    }
    // would otherwise be parsed as an option by the tool
    if value.starts_with('-') {
        return Err(SignerError::InvalidMetadata(format!(
            "{} must not start with '-'",
            field
        )));
    }
    Ok(())
}

/// Key, certificate and timestamping parameters shared by every invocation
#[derive(Debug, Clone)]
pub struct SignerParams {
    /// Key store type (jsign `--storetype`)
    pub store_type: String,
    /// Key store password or token PIN
    pub store_pass: String,
    /// Certificate chain file
    pub cert_file: PathBuf,
    /// Digest algorithm
    pub digest: String,
    /// Timestamp authority URL
    pub tsa_url: String,
    /// PKCS#11 module (osslsigncode)
    pub pkcs11_module: Option<PathBuf>,
    /// Key reference inside the token (osslsigncode)
    pub key_id: Option<String>,
}

impl Default for SignerParams {
    fn default() -> Self {
        Self {
            store_type: "PIV".to_string(),
            store_pass: String::new(),
            cert_file: PathBuf::from("/etc/signing-server/cert.crt"),
            digest: "sha384".to_string(),
            tsa_url: "http://timestamp.sectigo.com".to_string(),
            pkcs11_module: None,
            key_id: None,
        }
    }
}

/// One signing invocation
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub job_id: i64,
    /// Uploaded file
    pub input: PathBuf,
    pub metadata: AppMetadata,
}

/// Successful invocation
#[derive(Debug, Clone)]
pub struct SignOutcome {
    /// Signed artifact to serve on download
    pub artifact: PathBuf,
    /// Combined tool output
    pub output: String,
}

/// Runs a signing tool against a file and reports where the signed artifact is
#[async_trait]
pub trait Signer: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Sign `request.input`. Blocks until the tool exits.
    async fn sign(&self, request: &SignRequest) -> Result<SignOutcome, SignerError>;
}

/// [`Signer`] backed by an external process
#[derive(Debug, Clone)]
pub struct CommandSigner {
    kind: SignerKind,
    program: PathBuf,
    params: SignerParams,
}

impl CommandSigner {
    pub fn new(kind: SignerKind, params: SignerParams) -> Self {
        Self {
            kind,
            program: PathBuf::from(kind.default_program()),
            params,
        }
    }

    /// Override the executable, e.g. an absolute path
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn kind(&self) -> SignerKind {
        self.kind
    }

    /// Where the signed artifact ends up for `input`
    pub fn artifact_path(&self, input: &Path) -> PathBuf {
        if self.kind.signs_in_place() {
            input.to_path_buf()
        } else {
            let mut name = input
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| OsString::from("file"));
            name.push(".");
            name.push(SIGNED_SUFFIX);
            input.with_file_name(name)
        }
    }

    /// Full argument list for one invocation
    pub fn build_args(&self, request: &SignRequest) -> Vec<OsString> {
        let p = &self.params;
        let mut args: Vec<OsString> = Vec::new();

        match self.kind {
            SignerKind::Jsign => {
                args.extend(
                    [
                        "--storetype",
                        p.store_type.as_str(),
                        "--storepass",
                        p.store_pass.as_str(),
                    ]
                    .map(OsString::from),
                );
                args.push("--certfile".into());
                args.push(p.cert_file.clone().into_os_string());
                args.extend(
                    ["-d", p.digest.as_str(), "--tsaurl", p.tsa_url.as_str()].map(OsString::from),
                );
                if let Some(ref name) = request.metadata.name {
                    args.push("--name".into());
                    args.push(name.into());
                }
                if let Some(ref url) = request.metadata.url {
                    args.push("--url".into());
                    args.push(url.into());
                }
                args.push(request.input.clone().into_os_string());
            }
            SignerKind::Osslsigncode => {
                args.push("sign".into());
                if let Some(ref module) = p.pkcs11_module {
                    args.push("-pkcs11module".into());
                    args.push(module.clone().into_os_string());
                }
                if let Some(ref key) = p.key_id {
                    args.push("-key".into());
                    args.push(key.into());
                }
                args.push("-pass".into());
                args.push((&p.store_pass).into());
                args.push("-certs".into());
                args.push(p.cert_file.clone().into_os_string());
                args.extend(
                    ["-h", p.digest.as_str(), "-ts", p.tsa_url.as_str()].map(OsString::from),
                );
                if let Some(ref name) = request.metadata.name {
                    args.push("-n".into());
                    args.push(name.into());
                }
                if let Some(ref url) = request.metadata.url {
                    args.push("-i".into());
                    args.push(url.into());
                }
                args.push("-in".into());
                args.push(request.input.clone().into_os_string());
                args.push("-out".into());
                args.push(self.artifact_path(&request.input).into_os_string());
            }
        }

        args
    }
}

/// stdout followed by stderr, lossily decoded
fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));
    combined
}

#[async_trait]
impl Signer for CommandSigner {
    fn name(&self) -> &str {
        self.kind.default_program()
    }

    async fn sign(&self, request: &SignRequest) -> Result<SignOutcome, SignerError> {
        let args = self.build_args(request);

        debug!(
            job_id = request.job_id,
            program = %self.program.display(),
            "Starting signer"
        );

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(SignerError::Spawn)?;

        let combined = combine_output(&output.stdout, &output.stderr);

        if !output.status.success() {
            return Err(SignerError::Failed {
                status: output.status,
                output: combined,
            });
        }

        let artifact = self.artifact_path(&request.input);
        if tokio::fs::metadata(&artifact).await.is_err() {
            return Err(SignerError::MissingArtifact(artifact));
        }

        info!(job_id = request.job_id, signer = %self.kind, "Signer finished");

        Ok(SignOutcome {
            artifact,
            output: combined,
        })
    }
}
