//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (request id, trace span, concurrency limit, timeout)
//!     → residency middleware (snapshot, record, maybe replay)
//!     → forward_upstream (next handler: plain reverse proxy to the upstream)
//!     → Send to client
//! ```

pub mod server;

pub use server::{HttpServer, ServerError};
