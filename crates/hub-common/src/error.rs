//! Error kinds shared across the hub core.

use tokio::sync::mpsc::error::TrySendError;

/// Error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No subscription found for the given id
    #[error("Subscription not found")]
    NoSubscription,

    /// A topic string did not match the topic grammar
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// No plugin is registered for an integration type
    #[error("No plugin registered for type {0}")]
    UnknownPluginType(String),

    /// The integration instance id no longer resolves in storage
    #[error("Instance missing: {0}")]
    InstanceMissing(String),

    /// Upstream poll/request failed transiently; eligible for retry/backoff
    #[error("{0}")]
    TransientUpstream(String),

    /// Upstream rejected the request due to missing/invalid configuration
    #[error("{0}")]
    ConfigError(String),

    /// Upstream rejected the request due to authentication/authorization failure
    #[error("{0}")]
    AuthError(String),

    /// A subscriber sink refused or failed to accept a write
    #[error("Sink write failed")]
    SinkWriteFailed,

    /// Internal error bubbled up from storage or another collaborator
    #[error("Internal error: {0}")]
    Internal(String),

    /// The channel delivering events to a subscriber is full
    #[error("Channel is full")]
    ChannelFull,

    /// The channel delivering events to a subscriber is closed
    #[error("Channel is closed")]
    ChannelClosed,
}

impl<T> From<TrySendError<T>> for Error {
    fn from(value: TrySendError<T>) -> Self {
        match value {
            TrySendError::Closed(_) => Error::ChannelClosed,
            TrySendError::Full(_) => Error::ChannelFull,
        }
    }
}

/// Config-error substring patterns (§4.5); matched against upstream error messages.
pub const CONFIG_ERROR_PATTERNS: &[&str] = &[
    "No URL configured",
    "URL and API key required",
    "URL and token required",
    "No instance found",
];

/// Auth-error substring patterns (§4.5); matched against upstream error messages.
pub const AUTH_ERROR_PATTERNS: &[&str] = &[
    "Authentication failed",
    "Request failed with status code 401",
    "Request failed with status code 403",
];

/// Classify a raw upstream error message into a `TransientUpstream`, `ConfigError`
/// or `AuthError` per the substring tables in §4.5/§7.
pub fn classify_upstream_error(message: impl Into<String>) -> Error {
    let message = message.into();
    if CONFIG_ERROR_PATTERNS.iter().any(|p| message.contains(p)) {
        return Error::ConfigError(message);
    }
    if AUTH_ERROR_PATTERNS.iter().any(|p| message.contains(p)) {
        return Error::AuthError(message);
    }
    Error::TransientUpstream(message)
}
