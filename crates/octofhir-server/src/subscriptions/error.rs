//! Subscription error types.

use octofhir_api::ApiError;
use octofhir_core::error::CoreError;
use thiserror::Error;

use super::criteria::CriteriaError;

/// Result type for registry and store operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Errors raised by the subscription registry and its store.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Malformed criteria, unsupported channel or payload, bad resource
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Subscription not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubscriptionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

impl From<CriteriaError> for SubscriptionError {
    fn from(e: CriteriaError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<CoreError> for SubscriptionError {
    fn from(e: CoreError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<std::io::Error> for SubscriptionError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        match e {
            SubscriptionError::Validation(msg) => ApiError::bad_request(msg),
            SubscriptionError::NotFound(id) => {
                ApiError::not_found(format!("Subscription/{id} not found"))
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

/// Errors raised when binding a transport to a subscription.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Subscription {id} is not active (status: {status})")]
    SubscriptionNotActive { id: String, status: String },

    #[error("Subscription {0} already has an attached channel")]
    AlreadyAttached(String),

    #[error("Transport type {transport} does not match channel type {expected}")]
    ChannelTypeMismatch { expected: String, transport: String },

    #[error("Channel handshake failed: {0}")]
    Handshake(String),
}

/// Errors raised when pushing a notification to a subscription.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("No channel attached to subscription {0}")]
    NotAttached(String),

    #[error("Channel for subscription {0} is not open")]
    ChannelNotOpen(String),

    #[error("Payload encoding failed: {0}")]
    Encoding(String),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
}

impl DeliveryError {
    /// Failures that count toward moving a subscription to `error`.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Encoding(_))
    }
}

/// Errors raised by a transport while opening, writing or closing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("outbound queue full")]
    Backpressure,

    #[error("write not acknowledged within {0} ms")]
    Timeout(u64),

    #[error("i/o error: {0}")]
    Io(String),
}
