//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::to_bytes,
    extract::Request,
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
    Router,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use residency_proxy::config::ProxyConfig;
use residency_proxy::lifecycle::Shutdown;
use residency_proxy::residency::region::{requested_region, residency_redirect};
use residency_proxy::HttpServer;

/// Start a simple mock backend that returns a fixed response.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let response_str = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    response.len(),
                    response
                );
                let _ = socket.write_all(response_str.as_bytes()).await;
                let _ = socket.shutdown().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
    });

    addr
}

/// Serve `router` on an ephemeral port.
pub async fn start_router_backend(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A request as seen by the echo backend.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Start a backend that records every request and answers `echo: <path>`.
pub async fn start_echo_backend() -> (SocketAddr, Arc<Mutex<Vec<Seen>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let router = Router::new().fallback(move |request: Request| {
        let log = log.clone();
        async move {
            let (parts, body) = request.into_parts();
            let body = to_bytes(body, usize::MAX).await.unwrap();
            let path = parts.uri.path().to_string();
            log.lock().unwrap().push(Seen {
                method: parts.method,
                path: path.clone(),
                headers: parts.headers,
                body: body.to_vec(),
            });
            format!("echo: {path}")
        }
    });
    (start_router_backend(router).await, seen)
}

/// Start a backend that answers `<kind>: hello <path>` or, when a region is
/// requested and the path is outside it, 451 with a signal to `origin`.
pub async fn start_region_backend(origin: String) -> SocketAddr {
    let router = Router::new().fallback(move |request: Request| {
        let origin = origin.clone();
        async move { region_response(request, &origin) }
    });
    start_router_backend(router).await
}

fn region_response(request: Request, origin: &str) -> Response {
    if let Some(region) = requested_region(&request) {
        if let Some(redirect) = residency_redirect(&request, &region, origin) {
            return redirect;
        }
    }
    let kind = if request.uri().path().ends_with("/session") {
        "session"
    } else {
        "click"
    };
    format!("{kind}: hello {}\n", request.uri().path()).into_response()
}

/// Config pointing the edge at `upstream`.
pub fn proxy_config(upstream: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.address = upstream.to_string();
    config.timeouts.connect_secs = 1;
    config.redirect.replay_timeout_secs = 5;
    config
}

/// Start the edge proxy. It runs until the returned [`Shutdown`] fires.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Shutdown) {
    start_proxy_with_updates(config, None).await
}

pub async fn start_proxy_with_updates(
    config: ProxyConfig,
    updates: Option<mpsc::UnboundedReceiver<ProxyConfig>>,
) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = HttpServer::new(config).unwrap();
    let listener_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        server.run(listener, updates, listener_shutdown).await.unwrap();
    });
    (addr, shutdown)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
