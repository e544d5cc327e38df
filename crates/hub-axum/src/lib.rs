//! Axum transport binding for the integration hub (§6 "External
//! Interfaces"): an SSE-backed `Sink` plus the attach/subscribe/unsubscribe
//! routes built on top of it. This crate is the only place in the workspace
//! that knows about HTTP; `hub-core` never depends on it.

pub mod routes;
pub mod sse_sink;

pub use routes::router;
pub use sse_sink::SseSink;
