//! Error types for signing-server

use hyper::StatusCode;
use thiserror::Error;

use crate::signer::SignerError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Job not found: {0}")]
    NotFound(i64),

    #[error("Job already exists: {0}")]
    DuplicateId(i64),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Upload exceeds limit of {limit} bytes")]
    UploadTooLarge { limit: u64 },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status this error surfaces as
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::DuplicateId(_)
            | Self::Resource(_)
            | Self::Signing(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SignerError> for GatewayError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::InvalidMetadata(msg) => Self::Validation(msg),
            other => Self::Signing(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
