//! Shared data model, topic grammar, plugin contract and storage traits for
//! the integration hub. Transport- and component-specific logic lives in
//! `hub-core` and `hub-axum`; this crate only holds the seams between them.

pub mod clock;
pub mod error;
pub mod model;
pub mod plugin;
pub mod sink;
pub mod storage;
pub mod topic;

pub use error::Error;
pub use sink::Sink;
pub use topic::Topic;
