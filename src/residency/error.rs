//! Error taxonomy for the redirect middleware.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::residency::dispatcher::TransportError;

/// Failures raised while snapshotting, recording or replaying a request.
#[derive(Debug, Error)]
pub enum ResidencyError {
    /// The inbound body could not be read into the snapshot.
    #[error("failed to read request body: {0}")]
    BodyRead(#[source] axum::Error),

    /// The inbound body exceeds the replay limit.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The buffered handler response could not be drained.
    #[error("failed to read handler response body: {0}")]
    ResponseRead(#[source] axum::Error),

    /// A held-back handler response outgrew the buffer limit.
    #[error("buffered response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    /// The replay target was unreachable or failed at the transport level.
    #[error("replay dispatch failed: {0}")]
    OutboundDispatch(#[from] TransportError),

    /// The replay target did not answer within the deadline.
    #[error("replay timed out after {secs}s")]
    ReplayTimeout { secs: u64 },

    /// The rewritten outbound request could not be assembled.
    #[error("invalid replay request: {0}")]
    InvalidReplayRequest(#[from] axum::http::Error),

    /// The redirect header is present but does not name a usable target.
    #[error("malformed redirect signal '{value}': {reason}")]
    MalformedRedirectSignal { value: String, reason: &'static str },

    /// A finalized recorder was used again.
    #[error("response recorder used after finalize")]
    DoubleWrite,
}

impl ResidencyError {
    /// Status code reported to the client for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ResidencyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ResidencyError::OutboundDispatch(_)
            | ResidencyError::InvalidReplayRequest(_)
            | ResidencyError::ResponseTooLarge { .. } => StatusCode::BAD_GATEWAY,
            ResidencyError::ReplayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ResidencyError::BodyRead(_)
            | ResidencyError::ResponseRead(_)
            | ResidencyError::MalformedRedirectSignal { .. }
            | ResidencyError::DoubleWrite => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ResidencyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match status {
            StatusCode::PAYLOAD_TOO_LARGE => "Request body too large",
            StatusCode::BAD_GATEWAY => "Upstream request failed",
            StatusCode::GATEWAY_TIMEOUT => "Upstream request timed out",
            _ => "Internal server error",
        };
        (status, message).into_response()
    }
}
