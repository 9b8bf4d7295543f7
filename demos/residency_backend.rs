//! Standalone backend with the residency middleware in front of it.
//!
//! ```text
//! cargo run --example residency_backend
//! curl -i 'http://127.0.0.1:8080/session?region=eu'
//! session: hello /eu/session
//! ```
//!
//! Handlers answer `"<kind>: hello <path>"` unless a region is requested and
//! the path is not already under it. Then they answer 451 with
//! `X-Accel-Redirect` pointing back at this server under `/<region>`, and the
//! middleware replays the request there.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;

use residency_proxy::config::{ObservabilityConfig, PoolConfig, RedirectConfig};
use residency_proxy::observability::logging;
use residency_proxy::residency::region::{requested_region, residency_redirect};
use residency_proxy::residency::{residency_middleware, HyperTransport, Origin, Residency};

const HTTP_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(&ObservabilityConfig::default());

    let transport = Arc::new(HyperTransport::new(Duration::from_secs(5)));
    let residency = Arc::new(
        Residency::new(&RedirectConfig::default(), &PoolConfig::default(), transport)?
            .with_origin(Origin::http(HTTP_ADDR.parse()?)),
    );

    let app = Router::new()
        .route("/session", any(session))
        .route("/{region}/session", any(session))
        .route("/impression/", any(impression))
        .route("/impression/{*rest}", any(impression))
        .fallback(click)
        .layer(middleware::from_fn(log_request))
        .layer(middleware::from_fn_with_state(residency, residency_middleware));

    let listener = TcpListener::bind(HTTP_ADDR).await?;
    tracing::info!(address = HTTP_ADDR, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn click(request: Request) -> Response {
    respond(request, "click")
}

async fn impression(request: Request) -> Response {
    respond(request, "impression")
}

async fn session(request: Request) -> Response {
    respond(request, "session")
}

fn respond(request: Request, kind: &str) -> Response {
    if let Some(region) = requested_region(&request) {
        let origin = format!("http://{HTTP_ADDR}");
        if let Some(redirect) = residency_redirect(&request, &region, &origin) {
            tracing::debug!(kind, region = %region, "Found data residency");
            return redirect;
        }
    }
    format!("{kind}: hello {}\n", request.uri().path()).into_response()
}

async fn log_request(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();

    let response = next.run(request).await;
    tracing::info!(
        method = %method,
        uri = %uri,
        headers = ?headers,
        status = %response.status(),
        elapsed = ?start.elapsed(),
        "request"
    );
    response
}
