//! Resource events raised by the write path and the hooks that react to them.
//!
//! ```ignore
//! use octofhir_core::events::{HookRegistry, ResourceEvent};
//!
//! let registry = HookRegistry::new();
//! registry.register(my_hook).await;
//! registry.fire(&ResourceEvent::created("Patient", "123", json!({}))).await;
//! ```

pub mod hooks;
pub mod registry;
pub mod types;

pub use hooks::{HookError, ResourceHook};
pub use registry::{HookOutcome, HookRegistry};
pub use types::{ResourceEvent, ResourceEventType};
