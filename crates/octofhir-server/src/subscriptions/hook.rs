//! Dispatch of written resources to matching subscriptions.
//!
//! For each write, every active subscription of the resource's type is
//! evaluated and a notification is queued on each matching channel, in
//! registry order, before anything waits on client I/O. Deliveries are then
//! settled independently: one failing channel never holds up or suppresses
//! another.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use octofhir_core::events::{HookError, ResourceEvent, ResourceEventType, ResourceHook};
use octofhir_core::{IndexedResource, SearchParamCatalog, SearchParameterSource};
use serde_json::Value;

use super::delivery::{ChannelManager, PendingDelivery};
use super::error::DeliveryError;
use super::event_matcher::EventMatcher;
use super::payload::Notification;
use super::subscription_manager::{SubscriptionManager, SubscriptionStatusListener};
use super::types::SubscriptionStatus;

/// What happened to one subscription for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Matched, but no client is listening
    Skipped,
    Failed(DeliveryError),
}

/// Result of fanning one write out to subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Active subscriptions evaluated
    pub evaluated: usize,
    /// Subscriptions whose criteria matched
    pub matched: Vec<String>,
    /// Subscriptions with a notification queued on an open channel
    pub queued: Vec<String>,
}

struct FanOut {
    summary: DispatchSummary,
    pending: Vec<PendingDelivery>,
    settled: Vec<(String, DeliveryOutcome)>,
}

pub struct DispatchCoordinator {
    registry: Arc<SubscriptionManager>,
    channels: Arc<ChannelManager>,
    matcher: EventMatcher,
    catalog: Arc<SearchParamCatalog>,
    base_url: Option<String>,
    max_failures: u32,
    failures: DashMap<String, u32>,
}

impl DispatchCoordinator {
    /// Create the coordinator and subscribe it to registry status changes,
    /// which clear failure counters.
    pub fn new(
        registry: Arc<SubscriptionManager>,
        channels: Arc<ChannelManager>,
        catalog: Arc<SearchParamCatalog>,
        base_url: Option<String>,
        max_failures: u32,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            registry: registry.clone(),
            channels,
            matcher: EventMatcher::new(),
            catalog,
            base_url,
            max_failures: max_failures.max(1),
            failures: DashMap::new(),
        });
        let listener: Weak<DispatchCoordinator> = Arc::downgrade(&coordinator);
        registry.add_listener(listener);
        coordinator
    }

    /// Queue notifications for `resource` and settle them in the background.
    pub fn on_resource_written(self: &Arc<Self>, resource: Arc<Value>) -> DispatchSummary {
        let FanOut {
            summary,
            pending,
            settled,
        } = self.fan_out(&resource);

        if !pending.is_empty() || !settled.is_empty() {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.settle(pending, settled).await;
            });
        }
        summary
    }

    /// Queue notifications for `resource` and wait for every delivery.
    pub async fn dispatch_and_wait(&self, resource: Arc<Value>) -> Vec<(String, DeliveryOutcome)> {
        let FanOut {
            pending, settled, ..
        } = self.fan_out(&resource);
        self.settle(pending, settled).await
    }

    fn fan_out(&self, resource: &Arc<Value>) -> FanOut {
        let mut out = FanOut {
            summary: DispatchSummary::default(),
            pending: Vec::new(),
            settled: Vec::new(),
        };

        let indexed = match IndexedResource::new(resource, &self.catalog) {
            Ok(indexed) => indexed.with_base_url(self.base_url.as_deref()),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping subscription dispatch for unreadable resource");
                return out;
            }
        };
        let focus = format!(
            "{}/{}",
            indexed.resource_type(),
            indexed.resource_id().unwrap_or_default()
        );

        for subscription in self.registry.active_subscriptions_for(indexed.resource_type()) {
            out.summary.evaluated += 1;
            let Some(criteria) = subscription.filter.as_ref() else {
                continue;
            };
            if !self.matcher.evaluate(&indexed, criteria) {
                continue;
            }
            out.summary.matched.push(subscription.id.clone());

            let notification = Notification::new(&subscription.id, &focus, resource.clone());
            match self.channels.enqueue(&subscription.id, &notification) {
                Ok(pending) => {
                    out.summary.queued.push(subscription.id.clone());
                    out.pending.push(pending);
                }
                Err(DeliveryError::NotAttached(_)) | Err(DeliveryError::ChannelNotOpen(_)) => {
                    tracing::debug!(subscription_id = %subscription.id, "Matched subscription has no open channel");
                    out.settled
                        .push((subscription.id.clone(), DeliveryOutcome::Skipped));
                }
                Err(e) => {
                    out.settled
                        .push((subscription.id.clone(), DeliveryOutcome::Failed(e)));
                }
            }
        }

        tracing::debug!(
            focus = %focus,
            evaluated = out.summary.evaluated,
            matched = out.summary.matched.len(),
            queued = out.summary.queued.len(),
            "Subscription dispatch fanned out"
        );
        out
    }

    async fn settle(
        &self,
        pending: Vec<PendingDelivery>,
        mut settled: Vec<(String, DeliveryOutcome)>,
    ) -> Vec<(String, DeliveryOutcome)> {
        let deliveries = pending.into_iter().map(|p| async move {
            let id = p.subscription_id().to_string();
            let outcome = match self.channels.await_delivery(p).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(e) => DeliveryOutcome::Failed(e),
            };
            (id, outcome)
        });
        settled.extend(join_all(deliveries).await);

        for (id, outcome) in &settled {
            self.record(id, outcome).await;
        }
        settled
    }

    async fn record(&self, subscription_id: &str, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => {
                self.failures.remove(subscription_id);
            }
            DeliveryOutcome::Skipped => {}
            DeliveryOutcome::Failed(e) => {
                if !e.is_transport_failure() {
                    return;
                }
                // Settled after the subscription was turned off or removed
                let active = self
                    .registry
                    .get(subscription_id)
                    .is_ok_and(|s| s.status == SubscriptionStatus::Active);
                if !active {
                    self.failures.remove(subscription_id);
                    return;
                }
                let count = {
                    let mut entry = self.failures.entry(subscription_id.to_string()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    consecutive_failures = count,
                    "Notification delivery failed"
                );
                if count >= self.max_failures {
                    self.failures.remove(subscription_id);
                    let reason = format!("{count} consecutive delivery failures, last: {e}");
                    if let Err(err) = self.registry.set_error(subscription_id, reason).await {
                        tracing::error!(subscription_id = %subscription_id, error = %err, "Failed to mark subscription as errored");
                    }
                }
            }
        }
    }

    /// Consecutive transport failures recorded for a subscription.
    pub fn failure_count(&self, subscription_id: &str) -> u32 {
        self.failures.get(subscription_id).map(|c| *c).unwrap_or(0)
    }
}

impl SubscriptionStatusListener for DispatchCoordinator {
    fn on_status_changed(&self, subscription_id: &str, status: SubscriptionStatus) {
        if status != SubscriptionStatus::Active {
            self.failures.remove(subscription_id);
        }
    }
}

/// Resource hook feeding created and updated resources to the dispatcher.
pub struct SubscriptionHook {
    coordinator: Arc<DispatchCoordinator>,
}

impl SubscriptionHook {
    pub fn new(coordinator: Arc<DispatchCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ResourceHook for SubscriptionHook {
    fn name(&self) -> &str {
        "subscriptions"
    }

    fn resource_types(&self) -> &[&str] {
        &[]
    }

    fn event_types(&self) -> &[ResourceEventType] {
        &[ResourceEventType::Created, ResourceEventType::Updated]
    }

    async fn handle(&self, event: &ResourceEvent) -> Result<(), HookError> {
        let Some(resource) = &event.resource else {
            return Ok(());
        };
        let summary = self.coordinator.on_resource_written(Arc::new(resource.clone()));
        if !summary.matched.is_empty() {
            tracing::info!(
                reference = %event.reference(),
                matched = summary.matched.len(),
                queued = summary.queued.len(),
                "Resource matched subscriptions"
            );
        }
        Ok(())
    }
}
