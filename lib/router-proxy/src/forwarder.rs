//! HTTP request/response forwarding to backend instances

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};
use anyhow::Result;

/// HTTP request forwarder with connection pooling and timeout support
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    /// Create a new HTTP request forwarder with connection pooling
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new())
            .build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward a request to a target URL and return the buffered response
    ///
    /// Backend failures become 502 responses and timeouts become 504 responses;
    /// only malformed targets and unreadable request bodies are errors.
    pub async fn forward<B>(&self, target_url: &str, request: Request<B>) -> Result<Response<Bytes>>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        debug!("Forwarding request to: {}", target_url);

        let uri: Uri = target_url.parse()?;

        let (mut parts, incoming) = request.into_parts();
        let body_bytes = incoming.collect().await?.to_bytes();

        let mut filtered_headers = hyper::header::HeaderMap::new();
        for (k, v) in parts.headers.iter() {
            if !Self::is_hop_by_hop_header(k.as_str()) {
                filtered_headers.append(k.clone(), v.clone());
            }
        }
        parts.headers = filtered_headers;
        parts.uri = uri;

        let forwarded_request = Request::from_parts(parts, Full::new(body_bytes));

        match tokio_timeout(self.timeout, self.client.request(forwarded_request)).await {
            Ok(Ok(response)) => {
                debug!("Backend responded with status: {}", response.status());

                let (response_parts, body) = response.into_parts();
                let response_bytes = body.collect().await?.to_bytes();

                Ok(Response::from_parts(response_parts, response_bytes))
            }
            Ok(Err(e)) => {
                warn!("Backend request error: {}", e);
                Ok(Self::error_response(
                    StatusCode::BAD_GATEWAY,
                    "Error communicating with backend service",
                ))
            }
            Err(_) => {
                warn!("Backend request timeout after {:?}", self.timeout);
                Ok(Self::error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Backend service request timeout",
                ))
            }
        }
    }

    /// Create an error response
    pub fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
        let mut response = Response::new(Bytes::from(format!("{}\n", message)));
        *response.status_mut() = status;
        response
    }

    /// Check if header is hop-by-hop (should not be forwarded)
    fn is_hop_by_hop_header(name: &str) -> bool {
        matches!(
            name,
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "te"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
        )
    }
}
