//! Request body snapshot.
//!
//! The inbound body is a single-read stream. It is drained once and a fresh
//! body over the captured bytes is put back on the request, so the next
//! handler reads the same content. The replay later builds its own body from
//! the same snapshot.
//!
//! A body with an exact length is read straight into a buffer of that size
//! and frozen. Only bodies of unknown length go through a pooled staging
//! buffer, which is then copied once into an exact-size `Bytes`.

use axum::body::{Body, HttpBody};
use axum::http::Request;
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;

use crate::residency::pool::BufferPool;
use crate::residency::ResidencyError;

/// Materialized copy of an inbound request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodySnapshot {
    bytes: Bytes,
}

impl BodySnapshot {
    /// Drain the body of `request` and reinstall a replayable copy.
    ///
    /// Returns `None` for requests without a body. On failure the request is
    /// consumed and must not reach the next handler.
    pub async fn capture(
        request: Request<Body>,
        pool: &BufferPool,
        limit: usize,
    ) -> Result<(Request<Body>, Option<Self>), ResidencyError> {
        let (parts, mut body) = request.into_parts();
        if body.is_end_stream() {
            return Ok((Request::from_parts(parts, body), None));
        }

        let bytes = match body.size_hint().exact() {
            Some(len) if len > limit as u64 => {
                return Err(ResidencyError::BodyTooLarge { limit });
            }
            Some(len) => {
                let mut exact = BytesMut::with_capacity(len as usize);
                drain(&mut body, &mut exact, limit).await?;
                exact.freeze()
            }
            None => {
                let mut staging = pool.acquire();
                drain(&mut body, &mut staging, limit).await?;
                Bytes::copy_from_slice(&staging)
            }
        };

        let snapshot = Self { bytes };
        Ok((Request::from_parts(parts, snapshot.to_body()), Some(snapshot)))
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A fresh, independently readable body over the snapshot.
    pub fn to_body(&self) -> Body {
        Body::from(self.bytes.clone())
    }
}

async fn drain(body: &mut Body, into: &mut BytesMut, limit: usize) -> Result<(), ResidencyError> {
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ResidencyError::BodyRead)?;
        // Trailers are not replayed.
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if into.len() + data.len() > limit {
            return Err(ResidencyError::BodyTooLarge { limit });
        }
        into.extend_from_slice(&data);
    }
    Ok(())
}
