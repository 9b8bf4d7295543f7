//! Region selector helpers for business handlers.
//!
//! Handlers consult the requested region to decide whether to answer
//! themselves or to emit a redirect signal. A region comes from the
//! `X-Region` header or the `region` query field; absent or empty means no
//! preference.

use std::collections::HashMap;

use axum::extract::Query;
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};

pub const REGION_HEADER: HeaderName = HeaderName::from_static("x-region");
pub const REGION_FIELD: &str = "region";
pub const DEFAULT_REDIRECT_HEADER: HeaderName = HeaderName::from_static("x-accel-redirect");

/// The region the client asked for, if any.
///
/// Values that are not a single path segment are ignored.
pub fn requested_region<B>(request: &Request<B>) -> Option<String> {
    let from_header = request
        .headers()
        .get(&REGION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let region = from_header.or_else(|| {
        let Query(mut fields) =
            Query::<HashMap<String, String>>::try_from_uri(request.uri()).ok()?;
        fields.remove(REGION_FIELD).filter(|value| !value.is_empty())
    })?;

    is_segment(&region).then_some(region)
}

/// Build the 451 + signal response a handler returns to move a request to
/// `origin/<region><path>`, or `None` when the request is already there.
pub fn residency_redirect<B>(request: &Request<B>, region: &str, origin: &str) -> Option<Response> {
    let path = request.uri().path();
    if path.starts_with(&format!("/{region}/")) {
        return None;
    }

    let target = format!("{}/{region}{path}", origin.trim_end_matches('/'));
    let target = HeaderValue::from_str(&target).ok()?;
    tracing::debug!(region, path, target = ?target, "Requesting residency redirect");

    Some((StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS, [(DEFAULT_REDIRECT_HEADER, target)]).into_response())
}

fn is_segment(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
