//! Proxy replay dispatcher.
//!
//! # Responsibilities
//! - Rebuild the original request against the redirect target
//! - Restore the body from the snapshot
//! - Forward through the shared outbound transport and stream the reply back
//!
//! # Design Decisions
//! - The transport is injected, so tests run against a fake
//! - Hop-by-hop headers never cross the replay, in either direction
//! - One dispatch per request; failures map to 502/504 and are not retried

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use axum::response::Response;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::observability::metrics;
use crate::residency::policy::RedirectSignal;
use crate::residency::snapshot::BodySnapshot;
use crate::residency::ResidencyError;

/// User-Agent sent when the client had none and stripping is disabled.
pub const PROXY_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Transport-level failure of an outbound round trip.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("{0}")]
    Unreachable(String),
}

/// Outbound HTTP client used for upstream forwarding and replays.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response, TransportError>;
}

/// Pooled hyper client. Plain HTTP only.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Body>,
}

impl HyperTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response, TransportError> {
        let response = self.client.request(request).await?;
        Ok(response.map(Body::new))
    }
}

/// What the replay needs from the inbound request once its body is gone.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub peer: Option<SocketAddr>,
}

impl InboundRequest {
    pub fn of<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            peer: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        }
    }
}

/// Per-replay knobs, taken from the live redirect settings.
#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    pub strip_user_agent: bool,
    pub timeout: Duration,
}

/// Replays requests against redirect targets.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send `inbound` to `signal` and return the target's response unbuffered.
    pub async fn replay(
        &self,
        inbound: &InboundRequest,
        signal: &RedirectSignal,
        snapshot: Option<&BodySnapshot>,
        options: ReplayOptions,
    ) -> Result<Response, ResidencyError> {
        let start = Instant::now();
        let request = build_replay_request(inbound, signal, snapshot, options.strip_user_agent)?;
        let target = request.uri().clone();

        tracing::info!(
            method = %inbound.method,
            from = %inbound.uri,
            to = %target,
            body_bytes = snapshot.map_or(0, BodySnapshot::len),
            "Replaying request"
        );

        let result = tokio::time::timeout(options.timeout, self.transport.round_trip(request)).await;
        match result {
            Ok(Ok(mut response)) => {
                strip_hop_by_hop(response.headers_mut());
                metrics::record_replay("ok", start);
                tracing::debug!(to = %target, status = %response.status(), "Replay answered");
                Ok(response)
            }
            Ok(Err(e)) => {
                metrics::record_replay("error", start);
                tracing::error!(to = %target, error = %e, "Replay dispatch failed");
                Err(ResidencyError::OutboundDispatch(e))
            }
            Err(_) => {
                metrics::record_replay("timeout", start);
                tracing::error!(to = %target, timeout = ?options.timeout, "Replay timed out");
                Err(ResidencyError::ReplayTimeout {
                    secs: options.timeout.as_secs(),
                })
            }
        }
    }
}

/// Rewrite the inbound request for the replay target.
///
/// The replay always goes out as HTTP/1.1, whatever the inbound version.
pub fn build_replay_request(
    inbound: &InboundRequest,
    signal: &RedirectSignal,
    snapshot: Option<&BodySnapshot>,
    strip_user_agent: bool,
) -> Result<Request<Body>, ResidencyError> {
    let uri = signal.target_uri(&inbound.uri)?;

    let mut headers = inbound.headers.clone();
    strip_hop_by_hop(&mut headers);

    let host = HeaderValue::from_str(signal.authority().as_str())
        .map_err(|e| ResidencyError::InvalidReplayRequest(e.into()))?;
    headers.insert(header::HOST, host);

    if let Some(peer) = inbound.peer {
        append_forwarded_for(&mut headers, peer);
    }

    if !strip_user_agent && !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(PROXY_USER_AGENT));
    }

    let body = match snapshot {
        Some(snapshot) => {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(snapshot.len()));
            snapshot.to_body()
        }
        None => Body::empty(),
    };

    let mut request = Request::builder()
        .method(inbound.method.clone())
        .uri(uri)
        .body(body)?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Remove connection-scoped headers, including those named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use std::sync::Mutex;

    use crate::residency::policy::Origin;

    /// Records outbound requests and answers with a canned response.
    struct RecordingTransport {
        seen: Mutex<Vec<(Request<()>, bytes::Bytes)>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn round_trip(&self, request: Request<Body>) -> Result<Response, TransportError> {
            let (parts, body) = request.into_parts();
            let body = to_bytes(body, usize::MAX).await.unwrap();
            self.seen
                .lock()
                .unwrap()
                .push((Request::from_parts(parts, ()), body));
            if self.fail {
                return Err(TransportError::Unreachable("connection refused".into()));
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONNECTION, "close")
                .body(Body::from("eu session"))
                .unwrap())
        }
    }

    fn inbound(uri: &str, headers: &[(&'static str, &'static str)]) -> InboundRequest {
        let mut request = Request::post(uri);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let mut request = request.body(()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("10.0.0.7:51000".parse().unwrap()));
        InboundRequest::of(&request)
    }

    fn edge() -> Origin {
        "edge.local".parse().unwrap()
    }

    fn options() -> ReplayOptions {
        ReplayOptions {
            strip_user_agent: true,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_replay_request_rewrites_target_and_headers() {
        let inbound = inbound(
            "/session?user=42",
            &[
                ("host", "edge.local"),
                ("connection", "keep-alive, x-hop"),
                ("x-hop", "1"),
                ("x-region", "eu"),
                ("x-forwarded-for", "192.0.2.1"),
            ],
        );
        let signal = RedirectSignal::parse("http://eu.internal:9000/eu/session", None).unwrap();

        let request = build_replay_request(&inbound, &signal, None, true).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), "http://eu.internal:9000/eu/session?user=42");
        assert_eq!(request.headers()[header::HOST], "eu.internal:9000");
        assert_eq!(request.headers()["x-region"], "eu");
        assert_eq!(request.headers()["x-forwarded-for"], "192.0.2.1, 10.0.0.7");
        assert!(!request.headers().contains_key(header::CONNECTION));
        assert!(!request.headers().contains_key("x-hop"));
        assert!(!request.headers().contains_key(header::USER_AGENT));
    }

    #[test]
    fn test_user_agent_handling() {
        let bare = inbound("/", &[("host", "edge.local")]);
        let signal = RedirectSignal::parse("/eu/", Some(&edge())).unwrap();

        let stripped = build_replay_request(&bare, &signal, None, true).unwrap();
        assert!(!stripped.headers().contains_key(header::USER_AGENT));

        let filled = build_replay_request(&bare, &signal, None, false).unwrap();
        assert_eq!(filled.headers()[header::USER_AGENT], PROXY_USER_AGENT);

        let client = inbound("/", &[("host", "edge.local"), ("user-agent", "curl/8.5")]);
        let kept = build_replay_request(&client, &signal, None, false).unwrap();
        assert_eq!(kept.headers()[header::USER_AGENT], "curl/8.5");
    }

    #[tokio::test]
    async fn test_replay_sends_snapshot_body() {
        let transport = Arc::new(RecordingTransport {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        let dispatcher = Dispatcher::new(transport.clone());

        let inbound = inbound("/session", &[("host", "edge.local")]);
        let signal = RedirectSignal::parse("/eu/session", Some(&edge())).unwrap();
        let pool = crate::residency::pool::BufferPool::default();
        let (_, snapshot) = BodySnapshot::capture(
            Request::post("/session").body(Body::from("payload")).unwrap(),
            &pool,
            1024,
        )
        .await
        .unwrap();

        let response = dispatcher
            .replay(&inbound, &signal, snapshot.as_ref(), options())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(header::CONNECTION));
        assert_eq!(to_bytes(response.into_body(), 1024).await.unwrap(), "eu session");

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.uri(), "http://edge.local/eu/session");
        assert_eq!(seen[0].0.headers()[header::CONTENT_LENGTH], "7");
        assert_eq!(seen[0].1, "payload");
    }

    #[tokio::test]
    async fn test_replay_failure_maps_to_bad_gateway() {
        let transport = Arc::new(RecordingTransport {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let dispatcher = Dispatcher::new(transport.clone());
        let inbound = inbound("/session", &[("host", "edge.local")]);
        let signal = RedirectSignal::parse("/eu/session", Some(&edge())).unwrap();

        let err = dispatcher
            .replay(&inbound, &signal, None, options())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        async fn round_trip(&self, _request: Request<Body>) -> Result<Response, TransportError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Response::new(Body::from("too late")))
        }
    }

    #[tokio::test]
    async fn test_replay_timeout_maps_to_gateway_timeout() {
        let dispatcher = Dispatcher::new(Arc::new(SlowTransport));
        let inbound = inbound("/session", &[("host", "edge.local")]);
        let signal = RedirectSignal::parse("/eu/session", Some(&edge())).unwrap();

        let err = dispatcher
            .replay(
                &inbound,
                &signal,
                None,
                ReplayOptions {
                    strip_user_agent: true,
                    timeout: Duration::from_millis(50),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResidencyError::ReplayTimeout { .. }));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
