//! Service registration and proxy server lifecycle

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tonic::service::Routes;
use tonic::transport::Server;

use crate::config::ProxyConfig;
use crate::director::StreamDirector;
use crate::proxy::handler::ProxyService;

/// Bind the proxy handler to explicit `(service, methods)` pairs - the same
/// surface a schema-generated service would register, minus the schema.
pub fn register_service<D: StreamDirector>(
    mut router: Router,
    proxy: &ProxyService<D>,
    service: &str,
    methods: &[String],
) -> Router {
    for method in methods {
        router = router.route_service(&format!("/{service}/{method}"), proxy.clone());
    }
    router
}

/// Bind the proxy handler as the fallback for every method not otherwise
/// registered on the server (transparent mode).
pub fn transparent_handler<D: StreamDirector>(router: Router, proxy: ProxyService<D>) -> Router {
    router.route_service("/*method", proxy)
}

/// Build the route set for the configured registration mode: explicit when
/// `expose` entries are present, transparent otherwise.
pub fn proxy_routes<D: StreamDirector>(config: &ProxyConfig, proxy: ProxyService<D>) -> Routes {
    let mut router = Router::new();
    if config.expose.is_empty() {
        router = transparent_handler(router, proxy);
    } else {
        for exposed in &config.expose {
            router = register_service(router, &proxy, &exposed.service, &exposed.methods);
        }
    }
    Routes::from(router)
}

/// Start the proxy server. Runs until the shutdown future resolves.
pub async fn serve<D: StreamDirector>(
    addr: SocketAddr,
    config: &ProxyConfig,
    director: Arc<D>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    let proxy = ProxyService::new(director, config.backend_send_buffer);
    let routes = proxy_routes(config, proxy);

    let mode = if config.expose.is_empty() {
        "transparent"
    } else {
        "explicit"
    };
    tracing::info!(%addr, mode, "Starting proxy server");

    Server::builder()
        .add_routes(routes)
        .serve_with_shutdown(addr, shutdown)
        .await
}
