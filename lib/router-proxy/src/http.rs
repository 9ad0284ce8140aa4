//! HTTP proxy: admits, resolves and forwards one request

use crate::dispatch::Dispatcher;
use crate::forwarder::RequestForwarder;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use router_core::{BackendInstance, CoreError};
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP proxy for forwarding requests to backend services
pub struct HttpProxy {
    dispatcher: Arc<Dispatcher>,
    forwarder: RequestForwarder,
}

impl HttpProxy {
    /// Create an HTTP proxy over a dispatcher
    pub fn new(dispatcher: Arc<Dispatcher>, forwarder: RequestForwarder) -> Self {
        Self {
            dispatcher,
            forwarder,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Admit the request on `route_key`, pick a backend of `service_name`
    /// and forward the request to it
    pub async fn handle<B>(
        &self,
        route_key: &str,
        service_name: &str,
        request: Request<B>,
    ) -> Response<Bytes>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        if let Err(e) = self.dispatcher.admit(route_key).await {
            warn!("{}", e);
            return Self::service_unavailable_response(&e.to_string());
        }

        let instance = match self.dispatcher.resolve(service_name).await {
            Ok(instance) => instance,
            Err(e @ CoreError::NoBackendAvailable(_)) => {
                debug!("{}", e);
                return Self::service_unavailable_response(&e.to_string());
            }
            Err(e) => return Self::bad_gateway_response(&e.to_string()),
        };

        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let target = Self::build_target_url(&instance, &path);

        match self.forwarder.forward(&target, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Forwarding to {} failed: {}", target, e);
                Self::bad_gateway_response(&e.to_string())
            }
        }
    }

    /// Build a target URL for an instance
    pub fn build_target_url(instance: &BackendInstance, path: &str) -> String {
        format!("http://{}{}", instance.address(), path)
    }

    /// Create a 502 Bad Gateway response
    pub fn bad_gateway_response(reason: &str) -> Response<Bytes> {
        RequestForwarder::error_response(StatusCode::BAD_GATEWAY, &format!("Bad Gateway: {}", reason))
    }

    /// Create a 503 Service Unavailable response
    pub fn service_unavailable_response(reason: &str) -> Response<Bytes> {
        RequestForwarder::error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("Service Unavailable: {}", reason),
        )
    }

    /// Create a 404 Not Found response
    pub fn not_found_response(reason: &str) -> Response<Bytes> {
        RequestForwarder::error_response(StatusCode::NOT_FOUND, &format!("Not Found: {}", reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use http_body_util::Full;
    use router_core::ServiceRegistry;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn proxy() -> HttpProxy {
        let dispatcher = Dispatcher::new(
            Arc::new(ServiceRegistry::new()),
            MetricsCollector::new().expect("Failed to create collector"),
        );
        HttpProxy::new(Arc::new(dispatcher), RequestForwarder::new(Duration::from_secs(5)))
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(uri).body(Full::new(Bytes::new())).unwrap()
    }

    #[test]
    fn test_build_target_url() {
        let instance = BackendInstance::new("a", "10.0.0.1", 8080);
        assert_eq!(
            HttpProxy::build_target_url(&instance, "/api/users?page=2"),
            "http://10.0.0.1:8080/api/users?page=2"
        );
    }

    #[test]
    fn test_error_responses() {
        assert_eq!(HttpProxy::bad_gateway_response("x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            HttpProxy::service_unavailable_response("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(HttpProxy::not_found_response("x").status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_no_backend_is_service_unavailable() {
        let proxy = proxy();
        let response = proxy.handle("users", "users", get("/users")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_request_reaches_resolved_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let address = server.address();
        let proxy = proxy();
        proxy
            .dispatcher()
            .add_instance(
                "users",
                BackendInstance::new("a", address.ip().to_string(), address.port()),
            )
            .await;

        let response = proxy.handle("users", "users", get("/users?page=2")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from("ok"));
    }
}
