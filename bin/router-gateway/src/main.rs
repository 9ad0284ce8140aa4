use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use router_core::ServiceRegistry;
use router_discovery::{
    DiscoveryProvider, HttpDiscoveryClient, Reconciler, Supervisor, SupervisorHandle,
};
use router_proxy::{Dispatcher, HealthChecker, HttpProxy, MetricsCollector, RequestForwarder};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod router;

use config::GatewayConfig;
use router::RouteTable;

/// Shared state for request handling
struct Gateway {
    proxy: HttpProxy,
    routes: RouteTable,
    metrics: MetricsCollector,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting router-gateway...");

    let config = GatewayConfig::load()?;
    config.validate().context("invalid gateway configuration")?;

    let registry = Arc::new(ServiceRegistry::new());
    let metrics = MetricsCollector::new()?;
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), metrics.clone()));
    configure_dispatcher(&dispatcher, &config).await?;
    info!(
        "Dispatcher initialized with {} services and {} routes",
        config.services.len(),
        config.routes.len()
    );

    let supervisor = start_reconciliation(&config, registry, metrics.clone())?;

    let forwarder = RequestForwarder::new(config.forward_timeout);
    let gateway = Arc::new(Gateway {
        proxy: HttpProxy::new(dispatcher, forwarder),
        routes: RouteTable::new(config.routes.clone()),
        metrics,
    });

    let listener = TcpListener::bind(&config.listen).await?;
    info!("HTTP server listening on {}", config.listen);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Error accepting HTTP connection: {}", e);
                    continue;
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        };
        let io = TokioIo::new(stream);
        let gateway = gateway.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, gateway.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }

    supervisor.shutdown().await;
    info!("router-gateway stopped");
    Ok(())
}

/// Plain text logs by default, JSON when `ROUTER_LOG_JSON` is set
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var_os("ROUTER_LOG_JSON").is_some() {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Register configured strategies, seed instances and install route limits
async fn configure_dispatcher(dispatcher: &Dispatcher, config: &GatewayConfig) -> Result<()> {
    for service in &config.services {
        dispatcher
            .register_strategy(&service.name, service.strategy)
            .await?;
        for instance in &service.instances {
            dispatcher.add_instance(&service.name, instance.into()).await;
        }
        info!(
            "Service {} uses {} with {} seeded instances",
            service.name,
            service.strategy,
            service.instances.len()
        );
    }

    for route in &config.routes {
        if let Some(limit) = &route.limit {
            dispatcher
                .set_route_limit(route.route_key(), limit.clone())
                .await?;
        }
    }
    Ok(())
}

fn start_reconciliation(
    config: &GatewayConfig,
    registry: Arc<ServiceRegistry>,
    metrics: MetricsCollector,
) -> Result<SupervisorHandle> {
    let provider = match &config.discovery {
        Some(discovery) => {
            let client = HttpDiscoveryClient::new(discovery)?;
            info!("Discovery provider at {}", client.base_url());
            Some(Arc::new(client) as Arc<dyn DiscoveryProvider>)
        }
        None => {
            warn!("No discovery provider configured, reconciliation will self-check only");
            None
        }
    };

    let reconciler = Arc::new(Reconciler::new(
        registry,
        provider,
        HealthChecker::new(config.health_check.clone()),
        config.registration(),
        metrics.clone(),
    ));
    Ok(Supervisor::new(reconciler, config.reconcile.clone(), metrics)?.spawn())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("{} {}", method, path);

    if path == "/healthz" {
        return Ok(text_response(StatusCode::OK, "OK\n"));
    }

    if path == "/metrics" && method == Method::GET {
        let response = match gateway.metrics.gather() {
            Ok(text) => {
                let mut response = text_response(StatusCode::OK, text);
                if let Ok(value) = "text/plain; version=0.0.4".parse() {
                    response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                }
                response
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
            }
        };
        return Ok(response);
    }

    let response = match gateway.routes.match_route(method.as_str(), &path) {
        Some(route) => {
            gateway
                .proxy
                .handle(route.route_key(), &route.service, req)
                .await
        }
        None => HttpProxy::not_found_response(&format!("no route for {}", path)),
    };

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Full::new(body)))
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
