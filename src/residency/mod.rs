//! Conditional internal-redirect routing.
//!
//! A handler that wants a request served elsewhere answers with a status in
//! the buffer range plus a redirect header naming the target. The middleware
//! holds such responses back, replays the original request (body included)
//! against the target, and returns that response instead. Everything else
//! streams straight through.
//!
//! # Modules
//! - `pool`: reusable byte buffers
//! - `policy`: buffer-or-stream decision, redirect signal parsing
//! - `snapshot`: one-shot capture of the inbound body
//! - `recorder`: response state machine and streaming body
//! - `dispatcher`: outbound transport and request replay
//! - `middleware`: the orchestrator and its axum adapter
//! - `region`: region selector helpers for handlers

pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod policy;
pub mod pool;
pub mod recorder;
pub mod region;
pub mod snapshot;

pub use dispatcher::{Dispatcher, HyperTransport, Transport, TransportError};
pub use error::ResidencyError;
pub use middleware::{residency_middleware, Residency};
pub use policy::{Origin, RedirectPolicy, RedirectSignal};
pub use pool::BufferPool;
pub use recorder::{Outcome, ResponseRecorder, ResponseSink};
pub use snapshot::BodySnapshot;
