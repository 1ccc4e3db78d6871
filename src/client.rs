//! Client for the signing API
//!
//! Used by the `remotesign` binary: upload, poll until the job leaves the
//! pending state, then download the signed file.

use crate::http::{APP_NAME_HEADER, APP_URL_HEADER, REQUEST_KEY_HEADER};
use crate::registry::{CreateJobResponse, JobStatus};
use crate::stream::file_chunks;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Poll interval between status checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("failed to send request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{action}: {status}\n\t{body}")]
    Status {
        action: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP client bound to one signing server
#[derive(Debug, Clone)]
pub struct SigningClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    app_name: Option<String>,
    app_url: Option<String>,
}

impl SigningClient {
    /// `endpoint` is a host (`sign.example.com`, implies https) or a full URL
    pub fn new(endpoint: &str, token: impl Into<String>) -> Result<Self, ClientError> {
        let endpoint = endpoint.trim();
        let base_url = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{}", endpoint)
        };

        let parsed = url::Url::parse(&base_url).map_err(|e| ClientError::Endpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::Endpoint {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            app_name: None,
            app_url: None,
        })
    }

    /// Application metadata sent with the upload
    pub fn with_application(mut self, name: Option<String>, url: Option<String>) -> Self {
        self.app_name = name.filter(|n| !n.is_empty());
        self.app_url = url.filter(|u| !u.is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Stream `file` to `POST /sign`
    pub async fn create_job(&self, file: File) -> Result<i64, ClientError> {
        let size = file.metadata().await?.len();

        let mut request = self
            .http
            .post(self.url("/sign"))
            .header(REQUEST_KEY_HEADER, &self.token)
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(file_chunks(file)));

        if let Some(ref name) = self.app_name {
            request = request.header(APP_NAME_HEADER, name);
        }
        if let Some(ref url) = self.app_url {
            request = request.header(APP_URL_HEADER, url);
        }

        let response = check(request.send().await?, "failed to create job").await?;
        let created: CreateJobResponse = response.json().await?;
        Ok(created.id)
    }

    /// `GET /status/{id}`
    pub async fn job_status(&self, job_id: i64) -> Result<JobStatus, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/status/{}", job_id)))
            .header(REQUEST_KEY_HEADER, &self.token)
            .send()
            .await?;

        let response = check(response, "failed to get job status").await?;
        Ok(response.json().await?)
    }

    /// Poll until the job is no longer processing
    pub async fn wait_for_completion(
        &self,
        job_id: i64,
        interval: Duration,
    ) -> Result<JobStatus, ClientError> {
        loop {
            let status = self.job_status(job_id).await?;
            if !status.processing {
                return Ok(status);
            }
            debug!(job_id, "Job still processing");
            tokio::time::sleep(interval).await;
        }
    }

    /// Stream `GET /download/{id}` into `out`, returning the byte count
    pub async fn download<W>(&self, job_id: i64, out: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let response = self
            .http
            .get(self.url(&format!("/download/{}", job_id)))
            .header(REQUEST_KEY_HEADER, &self.token)
            .send()
            .await?;

        let response = check(response, "failed to download file").await?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;

        Ok(written)
    }
}

/// Anything other than 200 becomes an error carrying the response text
async fn check(response: Response, action: &'static str) -> Result<Response, ClientError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }

    let body = response.text().await?;
    Err(ClientError::Status {
        action,
        status,
        body,
    })
}
