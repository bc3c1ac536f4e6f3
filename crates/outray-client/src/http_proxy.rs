//! HTTP reverse proxy to the local service
//!
//! Used for relayed requests when no request handler is registered. Uses
//! hyper's HTTP/1 client with a small connection pool so consecutive
//! requests reuse keep-alive connections to the local server.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use outray_proto::{IncomingRequest, OutgoingResponse};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Maximum number of pooled connections to the local service
const MAX_POOL_SIZE: usize = 10;

struct PooledConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    returned_at: Instant,
}

/// Idle pooled connections older than this are dropped instead of reused
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// HTTP proxy with connection pooling
pub struct HttpProxy {
    /// Target address (host:port)
    target: String,
    timeout: Duration,
    pool: Mutex<Vec<PooledConnection>>,
}

impl HttpProxy {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
            pool: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    async fn get_connection(&self) -> Result<http1::SendRequest<Full<Bytes>>, ProxyError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(conn) = pool.pop() {
                if conn.sender.is_ready() && conn.returned_at.elapsed() < POOL_IDLE_TIMEOUT {
                    debug!("Reusing pooled connection to {}", self.target);
                    return Ok(conn.sender);
                }
                debug!("Discarding stale connection from pool");
            }
        }

        debug!("Creating new connection to {}", self.target);
        let stream = TcpStream::connect(&self.target).await.map_err(|e| {
            ProxyError::ConnectionFailed(format!("failed to connect to {}: {}", self.target, e))
        })?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Local connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    async fn return_connection(&self, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            debug!("Not returning closed connection to pool");
            return;
        }

        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(PooledConnection {
                sender,
                returned_at: Instant::now(),
            });
        }
    }

    /// Drop every idle pooled connection, ending their connection tasks.
    /// Returns how many were dropped.
    pub async fn clear_pool(&self) -> usize {
        let drained: Vec<PooledConnection> = self.pool.lock().await.drain(..).collect();
        if !drained.is_empty() {
            debug!("Closing {} pooled connections to {}", drained.len(), self.target);
        }
        drained.len()
    }

    /// Build the local request from a relayed one
    fn build_request(&self, req: &IncomingRequest) -> Result<Request<Full<Bytes>>, ProxyError> {
        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid method '{}': {}", req.method, e)))?;
        let path = if req.path.is_empty() { "/" } else { req.path.as_str() };

        let mut builder = Request::builder().method(method).uri(path);

        let mut has_host = false;
        for (name, value) in &req.headers {
            // hyper frames the body itself
            if name.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str())
                || name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str())
            {
                continue;
            }
            if name.eq_ignore_ascii_case(HOST.as_str()) {
                has_host = true;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_host {
            let host = HeaderValue::from_str(&self.target)
                .map_err(|e| ProxyError::InvalidRequest(format!("invalid host: {}", e)))?;
            builder = builder.header(HOST, host);
        }

        builder
            .body(Full::new(Bytes::from(req.body.clone())))
            .map_err(|e| ProxyError::InvalidRequest(format!("failed to build request: {}", e)))
    }

    async fn read_response(
        response: Response<Incoming>,
    ) -> Result<OutgoingResponse, ProxyError> {
        let status_code = response.status().as_u16();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            // Multi-valued headers keep their first value
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::ResponseError(format!("failed to read response body: {}", e)))?
            .to_bytes();

        Ok(OutgoingResponse {
            request_id: String::new(),
            status_code,
            headers,
            body: body.to_vec(),
        })
    }

    async fn round_trip(&self, request: Request<Full<Bytes>>) -> Result<OutgoingResponse, ProxyError> {
        let mut sender = self.get_connection().await?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::RequestFailed(format!("failed to send request: {}", e)))?;

        let response = Self::read_response(response).await?;

        // Body fully read, the connection is free for the next request
        self.return_connection(sender).await;
        Ok(response)
    }

    /// Forward a relayed request to the local service
    pub async fn forward(&self, req: &IncomingRequest) -> Result<OutgoingResponse, ProxyError> {
        let start_time = Instant::now();
        let request = self.build_request(req)?;

        info!("Proxying {} {} to {}", req.method, req.path, self.target);

        let mut response = tokio::time::timeout(self.timeout, self.round_trip(request))
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))??;
        response.request_id = req.request_id.clone();

        info!(
            "Response {} {} -> {} ({}ms)",
            req.method,
            req.path,
            response.status_code,
            start_time.elapsed().as_millis()
        );
        Ok(response)
    }

    /// Forward a request, turning failures into an error response
    pub async fn forward_safe(&self, req: &IncomingRequest) -> OutgoingResponse {
        match self.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                error!("Proxy error: {}", e);
                let mut response =
                    OutgoingResponse::text(e.status_code(), format!("Proxy Error: {}", e));
                response.request_id = req.request_id.clone();
                response
            }
        }
    }
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl ProxyError {
    /// Status reported back through the tunnel for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::ResponseError(_) => 500,
            ProxyError::ConnectionFailed(_)
            | ProxyError::RequestFailed(_)
            | ProxyError::Timeout(_) => 502,
        }
    }
}
