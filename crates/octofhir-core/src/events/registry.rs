//! Hook registry for resource events.
//!
//! The write path calls [`HookRegistry::fire`] after a resource is stored.
//! Hooks run inline, one after another, each guarded by a timeout and a
//! panic boundary so that no hook can fail the write.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::hooks::{HookError, ResourceHook};
use super::types::ResourceEvent;

/// Default timeout for hook execution.
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of running one hook for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    TimedOut,
}

/// Registry for resource hooks.
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ResourceHook>>>,
    timeout: Duration,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub async fn register(&self, hook: Arc<dyn ResourceHook>) {
        let name = hook.name().to_string();
        self.hooks.write().await.push(hook);
        debug!(hook = %name, "Registered resource hook");
    }

    pub async fn hook_count(&self) -> usize {
        self.hooks.read().await.len()
    }

    /// Run every matching hook for `event` and report what happened.
    ///
    /// Errors, panics and timeouts are logged and returned, never raised.
    pub async fn fire(&self, event: &ResourceEvent) -> Vec<(String, HookOutcome)> {
        let hooks: Vec<_> = {
            let hooks = self.hooks.read().await;
            hooks.iter().filter(|h| h.matches(event)).cloned().collect()
        };

        let mut outcomes = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let name = hook.name().to_string();
            let outcome = self.run_hook(hook.as_ref(), event).await;
            match &outcome {
                HookOutcome::Completed => {
                    debug!(hook = %name, reference = %event.reference(), "Hook executed")
                }
                HookOutcome::Failed(e) => {
                    warn!(hook = %name, error = %e, "Hook execution failed")
                }
                HookOutcome::Panicked(msg) => {
                    error!(hook = %name, panic = %msg, "Hook panicked")
                }
                HookOutcome::TimedOut => {
                    error!(hook = %name, timeout_ms = self.timeout.as_millis() as u64, "Hook timed out")
                }
            }
            outcomes.push((name, outcome));
        }
        outcomes
    }

    async fn run_hook(&self, hook: &dyn ResourceHook, event: &ResourceEvent) -> HookOutcome {
        let guarded = AssertUnwindSafe(hook.handle(event)).catch_unwind();
        match tokio::time::timeout(self.timeout, guarded).await {
            Ok(Ok(Ok(()))) => HookOutcome::Completed,
            Ok(Ok(Err(e))) => HookOutcome::Failed(e.to_string()),
            Ok(Err(panic)) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                HookOutcome::Panicked(msg)
            }
            Err(_) => HookOutcome::TimedOut,
        }
    }

    /// Call on_start for all hooks.
    pub async fn on_start(&self) -> Result<(), HookError> {
        for hook in self.hooks.read().await.iter() {
            if let Err(e) = hook.on_start().await {
                warn!(hook = %hook.name(), error = %e, "Hook on_start failed");
            }
        }
        Ok(())
    }

    /// Call on_shutdown for all hooks.
    pub async fn on_shutdown(&self) -> Result<(), HookError> {
        for hook in self.hooks.read().await.iter() {
            if let Err(e) = hook.on_shutdown().await {
                warn!(hook = %hook.name(), error = %e, "Hook on_shutdown failed");
            }
        }
        Ok(())
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
