//! Configuration for signing-server
//!
//! CLI arguments and environment variable handling using clap.

use crate::orchestrator::{OrchestratorConfig, DEFAULT_MAX_UPLOAD_BYTES};
use crate::signer::{CommandSigner, SignerKind, SignerParams};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default certificate location when CERT_FILE is unset
pub const DEFAULT_CERT_FILE: &str = "/etc/signing-server/cert.crt";

/// Private and link-local ranges
pub const DEFAULT_TRUSTED_PROXIES: [&str; 4] =
    ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "169.254.0.0/16"];

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Signing server - uploads in, signed binaries out
#[derive(Parser, Debug, Clone)]
#[command(name = "signing-server")]
#[command(about = "Asynchronous code-signing service backed by a hardware token")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:80")]
    pub listen: SocketAddr,

    /// Shared secret expected in the X-Request-Key header
    #[arg(long, env = "REQUEST_KEY", hide_env_values = true)]
    pub request_key: Option<String>,

    /// PIN of the token holding the signing key
    #[arg(long, env = "TOKEN_PIN", default_value = "", hide_env_values = true)]
    pub token_pin: String,

    /// Certificate chain file
    #[arg(long, env = "CERT_FILE", default_value = DEFAULT_CERT_FILE)]
    pub cert_file: PathBuf,

    /// Root directory for job scopes (defaults to <tmp>/signing-server)
    #[arg(long, env = "WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Signing tool
    #[arg(long, env = "SIGNER", value_enum, default_value_t = SignerKind::Jsign)]
    pub signer: SignerKind,

    /// Path to the signing tool executable (defaults to the tool name on PATH)
    #[arg(long, env = "SIGNER_PROGRAM")]
    pub signer_program: Option<PathBuf>,

    /// Key store type (jsign)
    #[arg(long, env = "STORE_TYPE", default_value = "PIV")]
    pub store_type: String,

    /// PKCS#11 module (osslsigncode)
    #[arg(long, env = "PKCS11_MODULE")]
    pub pkcs11_module: Option<PathBuf>,

    /// Key reference inside the token (osslsigncode)
    #[arg(long, env = "KEY_ID")]
    pub key_id: Option<String>,

    /// Digest algorithm
    #[arg(long, env = "DIGEST", default_value = "sha384")]
    pub digest: String,

    /// Timestamp authority URL
    #[arg(long, env = "TSA_URL", default_value = "http://timestamp.sectigo.com")]
    pub tsa_url: String,

    /// Seconds before an unconsumed job is removed
    #[arg(long, env = "CLEANUP_DELAY_SECS", default_value = "300")]
    pub cleanup_delay_secs: u64,

    /// Upload size limit in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: u64,

    /// Signer processes allowed to run at once
    #[arg(long, env = "MAX_CONCURRENT_SIGNERS", default_value = "4")]
    pub max_concurrent_signers: usize,

    /// Comma-separated CIDRs whose X-Forwarded-For header is trusted
    #[arg(
        long,
        env = "TRUSTED_PROXIES",
        value_delimiter = ',',
        default_values = DEFAULT_TRUSTED_PROXIES
    )]
    pub trusted_proxies: Vec<Cidr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    /// Effective job scope root
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("signing-server"))
    }

    /// Shared secret, empty if unset
    pub fn request_key(&self) -> &str {
        self.request_key.as_deref().unwrap_or_default()
    }

    pub fn signer_params(&self) -> SignerParams {
        SignerParams {
            store_type: self.store_type.clone(),
            store_pass: self.token_pin.clone(),
            cert_file: self.cert_file.clone(),
            digest: self.digest.clone(),
            tsa_url: self.tsa_url.clone(),
            pkcs11_module: self.pkcs11_module.clone(),
            key_id: self.key_id.clone(),
        }
    }

    pub fn build_signer(&self) -> CommandSigner {
        let signer = CommandSigner::new(self.signer, self.signer_params());
        match self.signer_program {
            Some(ref program) => signer.with_program(program),
            None => signer,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            cleanup_delay: Duration::from_secs(self.cleanup_delay_secs),
            max_upload_bytes: self.max_upload_bytes,
            max_concurrent_signers: self.max_concurrent_signers,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.request_key().is_empty() {
            return Err("REQUEST_KEY is not set".to_string());
        }

        if self.work_dir().as_os_str().is_empty() {
            return Err("Working directory is not set".to_string());
        }

        if !self.cert_file.exists() {
            return Err(format!(
                "CERT_FILE {} does not exist",
                self.cert_file.display()
            ));
        }

        if self.max_concurrent_signers == 0 {
            return Err("MAX_CONCURRENT_SIGNERS must be at least 1".to_string());
        }

        if self.max_upload_bytes == 0 {
            return Err("MAX_UPLOAD_BYTES must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// An IP network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("invalid address in {:?}: {}", s, e))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };

        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|e| format!("invalid prefix in {:?}: {}", s, e))?,
            None => max,
        };
        if prefix > max {
            return Err(format!("prefix /{} too long for {}", prefix, addr));
        }

        Ok(Self { addr, prefix })
    }
}
