//! Hook traits for resource events.
//!
//! Hooks react to writes after they are durable. They are isolated from
//! each other and from the write path: a failing hook is logged, never
//! propagated to the client that performed the write.

use async_trait::async_trait;

use super::types::{ResourceEvent, ResourceEventType};

/// Error type for hook operations.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook execution failed: {0}")]
    Execution(String),

    #[error("Channel send failed: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HookError {
    pub fn execution(msg: impl Into<String>) -> Self {
        HookError::Execution(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        HookError::Channel(msg.into())
    }
}

/// Trait for FHIR resource event hooks.
///
/// # Example
///
/// ```ignore
/// struct AuditHook;
///
/// #[async_trait]
/// impl ResourceHook for AuditHook {
///     fn name(&self) -> &str { "audit" }
///     fn resource_types(&self) -> &[&str] { &[] }
///
///     async fn handle(&self, event: &ResourceEvent) -> Result<(), HookError> {
///         tracing::info!(reference = %event.reference(), "resource written");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceHook: Send + Sync {
    /// Unique name for this hook (for logging).
    fn name(&self) -> &str;

    /// Resource types this hook is interested in. Empty matches all.
    fn resource_types(&self) -> &[&str];

    /// Event types this hook handles. Empty matches all.
    fn event_types(&self) -> &[ResourceEventType] {
        &[]
    }

    async fn handle(&self, event: &ResourceEvent) -> Result<(), HookError>;

    async fn on_start(&self) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Check if this hook should handle the given event.
    fn matches(&self, event: &ResourceEvent) -> bool {
        let types = self.resource_types();
        if !types.is_empty() && !types.contains(&event.resource_type.as_str()) {
            return false;
        }

        let event_types = self.event_types();
        event_types.is_empty() || event_types.contains(&event.event_type)
    }
}
