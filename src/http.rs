//! HTTP API
//!
//! - `POST /sign` - Upload a binary, returns `{"id": <job id>}`
//! - `GET /status/{id}` - Job state
//! - `GET /download/{id}` - Signed binary, once
//! - `GET /health` - Health check
//!
//! Every route requires the shared secret in `X-Request-Key`.
//!
//! ## Example Usage
//!
//! ```bash
//! # Submit
//! curl -X POST -H "X-Request-Key: $KEY" -H "X-Application-Name: Tool" \
//!      --data-binary @tool.exe http://localhost/sign
//!
//! # Poll
//! curl -H "X-Request-Key: $KEY" http://localhost/status/1718000000000
//!
//! # Fetch (202 while processing, 500 with the signer output on failure)
//! curl -H "X-Request-Key: $KEY" -o tool-signed.exe http://localhost/download/1718000000000
//! ```

use crate::config::Cidr;
use crate::error::GatewayError;
use crate::gateway::{Download, Gateway};
use crate::orchestrator::JobOrchestrator;
use crate::registry::CreateJobResponse;
use crate::signer::AppMetadata;
use crate::stream::file_chunks;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Shared secret header
pub const REQUEST_KEY_HEADER: &str = "x-request-key";
/// Optional application name forwarded to the signer
pub const APP_NAME_HEADER: &str = "x-application-name";
/// Optional application URL forwarded to the signer
pub const APP_URL_HEADER: &str = "x-application-url";

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type BoxBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Source of inbound connections
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// HTTP server state
pub struct HttpServer {
    orchestrator: Arc<JobOrchestrator>,
    gateway: Gateway,
    request_key: String,
    trusted_proxies: Vec<Cidr>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        orchestrator: Arc<JobOrchestrator>,
        request_key: impl Into<String>,
        bind_addr: SocketAddr,
    ) -> Self {
        let gateway = Gateway::new(
            Arc::clone(orchestrator.registry()),
            Arc::clone(orchestrator.workspace()),
        );

        Self {
            orchestrator,
            gateway,
            request_key: request_key.into(),
            trusted_proxies: Vec::new(),
            bind_addr,
        }
    }

    /// Peers allowed to set X-Forwarded-For
    pub fn with_trusted_proxies(mut self, proxies: Vec<Cidr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    /// Bind the configured address and serve forever
    pub async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Accept errors (fd exhaustion, aborted handshakes) are logged and the
    /// loop carries on after a short pause; only startup can fail.
    pub async fn serve<A: Acceptor>(self: Arc<Self>, listener: A) -> Result<(), GatewayError> {
        info!(addr = %listener.local_addr()?, "HTTP server listening");

        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let io = TokioIo::new(stream);
                    let server = self.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let server = server.clone();
                            async move { server.handle_request(req, remote_addr).await }
                        });

                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await
                        {
                            warn!(addr = %remote_addr, error = %err, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Authenticate, then route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let ip = self.client_ip(req.headers(), remote_addr);

        debug!(method = %method, path = %path, ip = %ip, "Incoming request");

        if !self.is_authorized(req.headers()) {
            warn!(ip = %ip, path = %path, "Unauthorized request");
            return Ok(error_response(&GatewayError::Unauthorized));
        }

        let result = match (method, path.as_str()) {
            (Method::POST, "/sign") => self.handle_sign(req, ip).await,
            (Method::GET, "/health") => self.handle_health(),
            (Method::GET, p) if p.starts_with("/status/") => {
                let id = p.strip_prefix("/status/").unwrap_or("");
                self.handle_status(id)
            }
            (Method::GET, p) if p.starts_with("/download/") => {
                let id = p.strip_prefix("/download/").unwrap_or("");
                self.handle_download(id, ip).await
            }
            _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        !self.request_key.is_empty()
            && headers
                .get(REQUEST_KEY_HEADER)
                .is_some_and(|v| v.as_bytes() == self.request_key.as_bytes())
    }

    /// Peer address, or the left-most X-Forwarded-For entry when the peer is
    /// a trusted proxy
    fn client_ip(&self, headers: &HeaderMap, remote_addr: SocketAddr) -> IpAddr {
        let peer = remote_addr.ip();
        if !self.trusted_proxies.iter().any(|net| net.contains(peer)) {
            return peer;
        }

        headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(peer)
    }

    /// POST /sign - Store the upload and start a job
    async fn handle_sign(
        &self,
        req: Request<Incoming>,
        ip: IpAddr,
    ) -> Result<Response<BoxBody>, GatewayError> {
        info!(ip = %ip, "Received request");

        let limit = self.orchestrator.config().max_upload_bytes;
        let declared = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(GatewayError::UploadTooLarge { limit });
        }

        let metadata = AppMetadata::new(
            header_value(req.headers(), APP_NAME_HEADER)?,
            header_value(req.headers(), APP_URL_HEADER)?,
        )?;

        let body = req.into_body().into_data_stream();
        let id = self.orchestrator.submit(body, metadata).await?;

        Ok(json_response(StatusCode::OK, &CreateJobResponse { id }))
    }

    /// GET /status/{id}
    fn handle_status(&self, raw_id: &str) -> Result<Response<BoxBody>, GatewayError> {
        let id = parse_job_id(raw_id)?;
        let status = self.gateway.status(id)?;
        Ok(json_response(StatusCode::OK, &status))
    }

    /// GET /download/{id}
    async fn handle_download(
        &self,
        raw_id: &str,
        ip: IpAddr,
    ) -> Result<Response<BoxBody>, GatewayError> {
        let id = parse_job_id(raw_id)?;

        match self.gateway.download(id).await? {
            Download::Ready { job_id, file, size } => {
                info!(job_id, ip = %ip, "Streaming signed file");

                let body = StreamBody::new(file_chunks(file).map_ok(Frame::data)).boxed_unsync();
                let mut response = Response::new(body);
                let headers = response.headers_mut();
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
                Ok(response)
            }
            Download::InProgress => {
                info!(job_id = id, "Job is still processing");
                Ok(text_response(StatusCode::ACCEPTED, "job is still processing"))
            }
            Download::Failed(error) => {
                error!(job_id = id, error = %error, "Job failed");
                Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, error))
            }
        }
    }

    /// GET /health
    fn handle_health(&self) -> Result<Response<BoxBody>, GatewayError> {
        let body = serde_json::json!({
            "status": "ok",
            "jobs": self.orchestrator.registry().len(),
        });
        Ok(json_response(StatusCode::OK, &body))
    }
}

/// Parse a path id, rejecting anything that is not an integer
pub fn parse_job_id(raw: &str) -> Result<i64, GatewayError> {
    raw.parse::<i64>()
        .map_err(|_| GatewayError::Validation("invalid job id".to_string()))
}

fn header_value(headers: &HeaderMap, name: &str) -> Result<Option<String>, GatewayError> {
    match headers.get(name) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .map(|s| Some(s.to_string()))
            .map_err(|_| GatewayError::Validation(format!("{} is not valid text", name))),
    }
}

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());

    let mut response = Response::new(full_body(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(err: &GatewayError) -> Response<BoxBody> {
    let status = err.status_code();
    let message = match err {
        GatewayError::NotFound(_) => "job not found".to_string(),
        GatewayError::Validation(msg) | GatewayError::Resource(msg) => msg.clone(),
        other => other.to_string(),
    };

    if status.is_server_error() {
        error!(status = %status, error = %err, "Request error");
    } else {
        debug!(status = %status, error = %err, "Request rejected");
    }

    text_response(status, message)
}
