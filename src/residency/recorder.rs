//! Buffering response recorder.
//!
//! # State machine
//! ```text
//! Unstarted ──set_status / write──▶ Committed(Stream | Buffer) ──finalize──▶ Finalized
//! ```
//! The mode is decided exactly once, when the status is committed, from the
//! headers staged at that instant. Streamed bytes go to the sink as they are
//! written; buffered bytes stay in a pooled buffer until the orchestrator
//! decides between flushing and replaying.
//!
//! Using a finalized recorder is a contract violation: debug builds panic,
//! release builds return [`ResidencyError::DoubleWrite`] and leave the
//! recorder untouched.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::body::{Body, HttpBody};
use axum::http::{Extensions, HeaderMap, StatusCode, Version};
use axum::response::Response;
use bytes::Bytes;
use hyper::body::{Frame, SizeHint};

use crate::residency::policy::RedirectPolicy;
use crate::residency::pool::{BufferPool, PooledBuffer};
use crate::residency::ResidencyError;

/// Destination of a streamed response.
pub trait ResponseSink {
    /// Receives the committed head. Called at most once.
    fn start(&mut self, status: StatusCode, headers: &HeaderMap);

    /// Receives body bytes in write order.
    fn send(&mut self, chunk: Bytes);
}

/// In-memory sink drained by [`RecordedBody`].
#[derive(Debug, Default)]
pub struct Outbox {
    head: Option<(StatusCode, HeaderMap)>,
    chunks: VecDeque<Bytes>,
}

impl Outbox {
    pub fn take_head(&mut self) -> Option<(StatusCode, HeaderMap)> {
        self.head.take()
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.chunks.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl ResponseSink for Outbox {
    fn start(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.head = Some((status, headers.clone()));
    }

    fn send(&mut self, chunk: Bytes) {
        self.chunks.push_back(chunk);
    }
}

/// How a committed response is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stream,
    Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unstarted,
    Committed(Mode),
    Finalized,
}

/// Result of finalizing a recorder.
#[derive(Debug)]
pub enum Outcome {
    /// Everything already went to the sink.
    Streamed,
    /// The response is held back; the caller flushes or replaces it.
    Buffered(RecordedResponse),
}

/// A response held back in buffer mode.
#[derive(Debug)]
pub struct RecordedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub extensions: Extensions,
    body: PooledBuffer,
}

impl RecordedResponse {
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Emit the held response verbatim.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(Bytes::copy_from_slice(&self.body)));
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers;
        *response.extensions_mut() = self.extensions;
        response
    }
}

/// Records a handler's response, streaming or buffering it per the policy.
#[derive(Debug)]
pub struct ResponseRecorder<S> {
    sink: S,
    policy: Arc<RedirectPolicy>,
    pool: BufferPool,
    state: State,
    status: Option<StatusCode>,
    version: Version,
    headers: HeaderMap,
    extensions: Extensions,
    buffer: Option<PooledBuffer>,
}

impl<S: ResponseSink> ResponseRecorder<S> {
    pub fn new(sink: S, policy: Arc<RedirectPolicy>, pool: BufferPool) -> Self {
        Self {
            sink,
            policy,
            pool,
            state: State::Unstarted,
            status: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            extensions: Extensions::new(),
            buffer: None,
        }
    }

    /// Staged headers. Edits after a streamed commit do not reach the client.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Staged response extensions, carried into a buffered response.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// The committed status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The decided mode, once the status is committed.
    pub fn mode(&self) -> Option<Mode> {
        match self.state {
            State::Committed(mode) => Some(mode),
            State::Unstarted | State::Finalized => None,
        }
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Commit `status`. Only the first call has an effect.
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), ResidencyError> {
        match self.state {
            State::Finalized => return Err(used_after_finalize()),
            State::Committed(_) => return Ok(()),
            State::Unstarted => {}
        }

        let mode = if self.policy.should_buffer(status, &self.headers) {
            self.buffer = Some(self.pool.acquire());
            Mode::Buffer
        } else {
            self.sink.start(status, &self.headers);
            Mode::Stream
        };
        self.status = Some(status);
        self.state = State::Committed(mode);
        Ok(())
    }

    /// Write body bytes, committing 200 first if nothing was committed.
    pub fn write(&mut self, chunk: Bytes) -> Result<(), ResidencyError> {
        if self.state == State::Unstarted {
            self.set_status(StatusCode::OK)?;
        }
        match self.state {
            State::Committed(Mode::Stream) => self.sink.send(chunk),
            State::Committed(Mode::Buffer) => {
                if let Some(buffer) = self.buffer.as_mut() {
                    buffer.extend_from_slice(&chunk);
                }
            }
            State::Finalized => return Err(used_after_finalize()),
            State::Unstarted => unreachable!("status committed above"),
        }
        Ok(())
    }

    /// Close the recorder and hand back what, if anything, is still pending.
    pub fn finalize(&mut self) -> Result<Outcome, ResidencyError> {
        if self.state == State::Unstarted {
            self.set_status(StatusCode::OK)?;
        }
        let mode = match self.state {
            State::Committed(mode) => mode,
            State::Finalized => return Err(used_after_finalize()),
            State::Unstarted => unreachable!("status committed above"),
        };
        self.state = State::Finalized;

        match mode {
            Mode::Stream => Ok(Outcome::Streamed),
            Mode::Buffer => Ok(Outcome::Buffered(RecordedResponse {
                status: self.status.unwrap_or(StatusCode::OK),
                version: self.version,
                headers: std::mem::take(&mut self.headers),
                extensions: std::mem::take(&mut self.extensions),
                body: self.buffer.take().unwrap_or_else(|| self.pool.acquire()),
            })),
        }
    }
}

fn used_after_finalize() -> ResidencyError {
    debug_assert!(false, "response recorder used after finalize");
    ResidencyError::DoubleWrite
}

/// Client body of a streamed response.
///
/// Each frame of the handler body is written through the recorder into its
/// outbox and handed on immediately, so bytes flow at the pace the client
/// reads them. Trailers pass through untouched.
pub struct RecordedBody {
    inner: Body,
    recorder: ResponseRecorder<Outbox>,
    done: bool,
}

impl RecordedBody {
    pub fn new(inner: Body, recorder: ResponseRecorder<Outbox>) -> Self {
        Self {
            inner,
            recorder,
            done: false,
        }
    }
}

impl HttpBody for RecordedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        loop {
            if let Some(chunk) = this.recorder.sink_mut().pop() {
                return Poll::Ready(Some(Ok(Frame::data(chunk))));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        if let Err(e) = this.recorder.write(data) {
                            this.done = true;
                            return Poll::Ready(Some(Err(axum::Error::new(e))));
                        }
                    }
                    Err(frame) => return Poll::Ready(Some(Ok(frame))),
                },
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.done = true;
                    if let Err(e) = this.recorder.finalize() {
                        return Poll::Ready(Some(Err(axum::Error::new(e))));
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.recorder.sink.is_empty() && (self.done || self.inner.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
