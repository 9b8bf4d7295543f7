//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router: upstream forwarding behind the residency middleware
//! - Wire up middleware (tracing, request id, concurrency limit, timeout)
//! - Apply redirect settings pushed by the config watcher
//! - Serve until the shutdown listener fires

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::{
        header::InvalidHeaderName,
        uri::{Authority, PathAndQuery, Scheme},
        StatusCode, Uri, Version,
    },
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::lifecycle::ShutdownListener;
use crate::observability::metrics;
use crate::residency::dispatcher::strip_hop_by_hop;
use crate::residency::{residency_middleware, HyperTransport, Origin, Residency, Transport};

/// Failures building or running the edge server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid upstream address '{0}'")]
    InvalidUpstream(String),

    #[error("invalid redirect header name: {0}")]
    InvalidRedirectHeader(#[from] InvalidHeaderName),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Application state injected into the forwarding handler.
#[derive(Clone)]
pub struct AppState {
    pub upstream: Authority,
    pub transport: Arc<dyn Transport>,
}

/// HTTP server for the residency edge.
pub struct HttpServer {
    router: Router,
    residency: Arc<Residency>,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a server that talks to the network through a hyper client.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let transport = HyperTransport::new(Duration::from_secs(config.timeouts.connect_secs));
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a server whose upstream forwards and replays share `transport`.
    pub fn with_transport(
        config: ProxyConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ServerError> {
        let upstream = config
            .upstream
            .address
            .parse::<Authority>()
            .map_err(|_| ServerError::InvalidUpstream(config.upstream.address.clone()))?;

        // Relative redirect targets name paths on the upstream, never on
        // whatever Host the client sent.
        let residency = Arc::new(
            Residency::new(&config.redirect, &config.pool, transport.clone())?
                .with_origin(Origin::http(upstream.clone())),
        );

        let state = AppState {
            upstream,
            transport,
        };
        let router = Self::build_router(&config, state, residency.clone());

        Ok(Self {
            router,
            residency,
            config,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState, residency: Arc<Residency>) -> Router {
        Router::new()
            .fallback(forward_upstream)
            .with_state(state)
            .layer(middleware::from_fn_with_state(residency, residency_middleware))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(ConcurrencyLimitLayer::new(config.listener.max_connections))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// The router, for serving in tests without a listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn residency(&self) -> &Arc<Residency> {
        &self.residency
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Run the server until `shutdown` fires, applying redirect settings from
    /// `config_updates` as they arrive.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: Option<mpsc::UnboundedReceiver<ProxyConfig>>,
        shutdown: ShutdownListener,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.address,
            "HTTP server starting"
        );

        let reloader = config_updates.map(|updates| {
            let residency = self.residency.clone();
            tokio::spawn(apply_updates(residency, updates))
        });

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.recv())
            .await;

        if let Some(reloader) = reloader {
            reloader.abort();
        }
        served?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn apply_updates(residency: Arc<Residency>, mut updates: mpsc::UnboundedReceiver<ProxyConfig>) {
    while let Some(config) = updates.recv().await {
        if let Err(e) = residency.reload(&config.redirect) {
            tracing::error!(error = %e, "Reloaded redirect settings rejected");
        }
    }
}

/// The next handler: forward the request to the configured upstream.
async fn forward_upstream(State(state): State<AppState>, request: Request) -> Response {
    let start = Instant::now();
    let method = request.method().clone();

    let (mut parts, body) = request.into_parts();
    parts.uri = match upstream_uri(&state.upstream, &parts.uri) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(error = %e, uri = %parts.uri, "Cannot rewrite request for upstream");
            return (StatusCode::BAD_REQUEST, "Invalid request target").into_response();
        }
    };
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);

    tracing::debug!(method = %method, uri = %parts.uri, "Forwarding upstream");

    match state
        .transport
        .round_trip(Request::from_parts(parts, body))
        .await
    {
        Ok(mut response) => {
            strip_hop_by_hop(response.headers_mut());
            metrics::record_request(method.as_str(), response.status().as_u16(), start);
            response
        }
        Err(e) => {
            tracing::error!(upstream = %state.upstream, error = %e, "Upstream error");
            metrics::record_request(method.as_str(), 502, start);
            (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
        }
    }
}

fn upstream_uri(upstream: &Authority, original: &Uri) -> Result<Uri, axum::http::Error> {
    let path = original
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(upstream.clone())
        .path_and_query(path)
        .build()
}
