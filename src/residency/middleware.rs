//! Middleware orchestrator.
//!
//! # Data Flow
//! ```text
//! request
//!     → snapshot.rs (drain body once, reinstall a copy)
//!     → next handler
//!     → recorder.rs (commit status, decide stream | buffer)
//!         stream: head + RecordedBody returned, bytes flow as the client reads
//!         buffer: drain handler body, finalize
//!             → policy.rs extracts the signal
//!                 valid:             dispatcher.rs replays, its response is returned
//!                 absent/malformed:  buffered response flushed verbatim
//! ```
//!
//! Exactly one response leaves `handle` per request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::InvalidHeaderName;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;

use crate::config::{PoolConfig, RedirectConfig};
use crate::observability::metrics;
use crate::residency::dispatcher::{Dispatcher, InboundRequest, ReplayOptions, Transport};
use crate::residency::policy::{Origin, RedirectPolicy};
use crate::residency::pool::BufferPool;
use crate::residency::recorder::{Mode, Outbox, Outcome, RecordedBody, ResponseRecorder};
use crate::residency::snapshot::BodySnapshot;
use crate::residency::ResidencyError;

/// Live redirect settings, swapped as a whole on reload.
#[derive(Debug)]
pub struct ResidencySettings {
    pub policy: Arc<RedirectPolicy>,
    pub max_body_bytes: usize,
    pub replay: ReplayOptions,
}

impl ResidencySettings {
    pub fn from_config(config: &RedirectConfig) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            policy: Arc::new(RedirectPolicy::from_config(config)?),
            max_body_bytes: config.max_body_bytes,
            replay: ReplayOptions {
                strip_user_agent: config.strip_user_agent_on_replay,
                timeout: Duration::from_secs(config.replay_timeout_secs),
            },
        })
    }
}

/// The redirect middleware: buffer pool, live settings and replay dispatcher.
pub struct Residency {
    settings: ArcSwap<ResidencySettings>,
    pool: BufferPool,
    dispatcher: Dispatcher,
    origin: Option<Origin>,
}

impl Residency {
    pub fn new(
        redirect: &RedirectConfig,
        pool: &PoolConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            settings: ArcSwap::from_pointee(ResidencySettings::from_config(redirect)?),
            pool: BufferPool::new(pool),
            dispatcher: Dispatcher::new(transport),
            origin: None,
        })
    }

    /// Resolve relative redirect targets against `origin`. Without one,
    /// relative targets are treated as malformed and the response is flushed.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    /// Swap in new redirect settings. In-flight requests keep the old ones.
    pub fn reload(&self, redirect: &RedirectConfig) -> Result<(), InvalidHeaderName> {
        let settings = ResidencySettings::from_config(redirect)?;
        tracing::info!(
            header = %settings.policy.header_name(),
            range = ?redirect.buffer_status_range,
            strip_user_agent = settings.replay.strip_user_agent,
            "Redirect settings reloaded"
        );
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    pub fn settings(&self) -> Arc<ResidencySettings> {
        self.settings.load_full()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.dispatcher.transport()
    }

    /// Run `next` for `request`, then stream, flush or replay its response.
    pub async fn handle<F, Fut>(&self, request: Request, next: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let settings = self.settings.load_full();

        let (request, snapshot) =
            match BodySnapshot::capture(request, &self.pool, settings.max_body_bytes).await {
                Ok(captured) => captured,
                Err(e) => {
                    tracing::error!(error = %e, "Request body snapshot failed");
                    return e.into_response();
                }
            };
        let inbound = InboundRequest::of(&request);

        let (parts, body) = next(request).await.into_parts();

        let mut recorder =
            ResponseRecorder::new(Outbox::default(), settings.policy.clone(), self.pool.clone());
        *recorder.headers_mut() = parts.headers;
        *recorder.extensions_mut() = parts.extensions;
        recorder.set_version(parts.version);
        if let Err(e) = recorder.set_status(parts.status) {
            return e.into_response();
        }

        if recorder.mode() == Some(Mode::Stream) {
            metrics::record_response_mode("stream");
            let Some((status, headers)) = recorder.sink_mut().take_head() else {
                return ResidencyError::DoubleWrite.into_response();
            };
            let version = recorder.version();
            let extensions = std::mem::take(recorder.extensions_mut());
            let mut response = Response::new(Body::new(RecordedBody::new(body, recorder)));
            *response.status_mut() = status;
            *response.version_mut() = version;
            *response.headers_mut() = headers;
            *response.extensions_mut() = extensions;
            return response;
        }

        metrics::record_response_mode("buffer");
        let recorded = match drain_into(body, &mut recorder, settings.max_body_bytes).await {
            Ok(Outcome::Buffered(recorded)) => recorded,
            Ok(Outcome::Streamed) => return ResidencyError::DoubleWrite.into_response(),
            Err(e) => {
                tracing::error!(error = %e, "Buffered response could not be recorded");
                return e.into_response();
            }
        };

        let signal = settings
            .policy
            .signal(&recorded.headers, self.origin.as_ref());
        match signal {
            Ok(Some(signal)) => {
                tracing::debug!(
                    status = %recorded.status,
                    target = %signal.authority(),
                    path = signal.path(),
                    "Redirect signal received"
                );
                drop(recorded);
                match self
                    .dispatcher
                    .replay(&inbound, &signal, snapshot.as_ref(), settings.replay)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => e.into_response(),
                }
            }
            Ok(None) => recorded.into_response(),
            Err(e) => {
                metrics::record_malformed_signal();
                tracing::warn!(error = %e, status = %recorded.status, "Ignoring redirect signal");
                recorded.into_response()
            }
        }
    }
}

async fn drain_into(
    mut body: Body,
    recorder: &mut ResponseRecorder<Outbox>,
    limit: usize,
) -> Result<Outcome, ResidencyError> {
    let mut recorded = 0usize;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ResidencyError::ResponseRead)?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        recorded += data.len();
        if recorded > limit {
            return Err(ResidencyError::ResponseTooLarge { limit });
        }
        recorder.write(data)?;
    }
    recorder.finalize()
}

/// axum adapter: `middleware::from_fn_with_state(residency, residency_middleware)`.
pub async fn residency_middleware(
    State(residency): State<Arc<Residency>>,
    request: Request,
    next: Next,
) -> Response {
    residency.handle(request, |request| next.run(request)).await
}
