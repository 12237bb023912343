//! Subscription registry: lifecycle, status transitions and the lookup the
//! dispatcher uses to find candidates for a written resource.
//!
//! Entries are `Arc<Subscription>` replaced on every change, so readers get
//! cheap snapshots and never hold the lock while they work. No lock here is
//! held across an `.await`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};

use octofhir_core::IdGenerator;
use parking_lot::RwLock;
use time::OffsetDateTime;

use super::criteria::Criteria;
use super::error::{SubscriptionError, SubscriptionResult};
use super::payload::ResourceCodec;
use super::storage::SubscriptionStore;
use super::types::{ChannelType, Subscription, SubscriptionRequest, SubscriptionStatus};

/// Told about every status change after it is visible in the registry.
pub trait SubscriptionStatusListener: Send + Sync {
    fn on_status_changed(&self, subscription_id: &str, status: SubscriptionStatus);

    fn on_removed(&self, subscription_id: &str) {
        self.on_status_changed(subscription_id, SubscriptionStatus::Off);
    }
}

pub struct SubscriptionManager {
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    store: Arc<dyn SubscriptionStore>,
    ids: Arc<IdGenerator>,
    codec: Arc<dyn ResourceCodec>,
    supported_channels: Vec<ChannelType>,
    listeners: RwLock<Vec<Weak<dyn SubscriptionStatusListener>>>,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        ids: Arc<IdGenerator>,
        codec: Arc<dyn ResourceCodec>,
        supported_channels: Vec<ChannelType>,
    ) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            store,
            ids,
            codec,
            supported_channels,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn codec(&self) -> Arc<dyn ResourceCodec> {
        self.codec.clone()
    }

    pub fn supported_channels(&self) -> &[ChannelType] {
        &self.supported_channels
    }

    /// Listeners are held weakly; dropping the listener unregisters it.
    pub fn add_listener(&self, listener: Weak<dyn SubscriptionStatusListener>) {
        self.listeners.write().push(listener);
    }

    /// Validate, persist and activate a new subscription.
    pub async fn register(&self, request: SubscriptionRequest) -> SubscriptionResult<String> {
        let filter: Criteria = request.criteria.parse()?;

        if !self.supported_channels.contains(&request.channel_type) {
            return Err(SubscriptionError::validation(format!(
                "channel type '{}' is not supported",
                request.channel_type
            )));
        }
        if !self.codec.supports(request.payload) {
            return Err(SubscriptionError::validation(format!(
                "payload encoding '{}' is not supported",
                request.payload.mime_type().unwrap_or("none")
            )));
        }

        let now = OffsetDateTime::now_utc();
        // Criteria compiled and channel accepted: requested goes straight to active.
        let subscription = Subscription {
            id: self.unused_id()?,
            criteria: request.criteria,
            filter: Some(filter),
            channel_type: request.channel_type,
            payload: request.payload,
            status: SubscriptionStatus::Active,
            reason: request.reason,
            error: None,
            created_at: now,
            updated_at: now,
        };

        self.store.save(&subscription).await?;

        let id = subscription.id.clone();
        tracing::info!(
            subscription_id = %id,
            criteria = %subscription.criteria,
            channel = %subscription.channel_type,
            "Subscription registered"
        );
        match self.subscriptions.write().entry(id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(subscription));
            }
            Entry::Occupied(_) => {
                return Err(SubscriptionError::Internal(format!(
                    "subscription id {id} is already registered"
                )));
            }
        }
        Ok(id)
    }

    /// Next generated id not held by a live subscription.
    fn unused_id(&self) -> SubscriptionResult<String> {
        const ATTEMPTS: usize = 8;
        for _ in 0..ATTEMPTS {
            let id = self.ids.next_id();
            if !self.subscriptions.read().contains_key(&id) {
                return Ok(id);
            }
            tracing::warn!(subscription_id = %id, "Generated id already in use, retrying");
        }
        Err(SubscriptionError::Internal(
            "could not allocate an unused subscription id".into(),
        ))
    }

    pub fn get(&self, id: &str) -> SubscriptionResult<Arc<Subscription>> {
        self.subscriptions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SubscriptionError::not_found(id))
    }

    /// Turn a subscription off. Idempotent for subscriptions already off.
    pub async fn deactivate(&self, id: &str) -> SubscriptionResult<()> {
        self.transition(id, SubscriptionStatus::Off, None).await
    }

    /// Re-enable an `off` or `error` subscription after recompiling its criteria.
    pub async fn activate(&self, id: &str) -> SubscriptionResult<()> {
        let current = self.get(id)?;
        if let Err(e) = current.criteria.parse::<Criteria>() {
            let message = format!("criteria no longer valid: {e}");
            self.transition(id, SubscriptionStatus::Error, Some(message.clone()))
                .await?;
            return Err(SubscriptionError::validation(message));
        }
        self.transition(id, SubscriptionStatus::Active, None).await
    }

    /// Move a subscription to `error`, recording why.
    pub async fn set_error(&self, id: &str, reason: impl Into<String>) -> SubscriptionResult<()> {
        self.transition(id, SubscriptionStatus::Error, Some(reason.into()))
            .await
    }

    /// Drop a subscription from the registry and the store.
    pub async fn remove(&self, id: &str) -> SubscriptionResult<()> {
        let removed = self.subscriptions.write().remove(id);
        if removed.is_none() {
            return Err(SubscriptionError::not_found(id));
        }
        let deleted = self.store.delete(id).await;
        tracing::info!(subscription_id = %id, "Subscription removed");
        for listener in self.live_listeners() {
            listener.on_removed(id);
        }
        deleted.map(|_| ())
    }

    /// Active subscriptions targeting `resource_type`, as of this call.
    pub fn active_subscriptions_for(
        &self,
        resource_type: &str,
    ) -> std::vec::IntoIter<Arc<Subscription>> {
        let snapshot: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.is_matchable() && s.resource_type() == Some(resource_type))
            .cloned()
            .collect();
        snapshot.into_iter()
    }

    /// All subscriptions, oldest first.
    pub fn list(&self) -> Vec<Arc<Subscription>> {
        let mut all: Vec<_> = self.subscriptions.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restore persisted subscriptions. Returns how many were loaded.
    pub async fn reload(&self) -> SubscriptionResult<usize> {
        let stored = self.store.load_all().await?;
        let mut loaded = Vec::with_capacity(stored.len());

        for mut subscription in stored {
            self.ids.observe(&subscription.id);
            match subscription.criteria.parse::<Criteria>() {
                Ok(filter) => subscription.filter = Some(filter),
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        criteria = %subscription.criteria,
                        error = %e,
                        "Stored subscription has invalid criteria, loading in error state"
                    );
                    subscription.filter = None;
                    if subscription.status != SubscriptionStatus::Error {
                        subscription.status = SubscriptionStatus::Error;
                        subscription.error = Some(format!("invalid criteria: {e}"));
                        subscription.updated_at = OffsetDateTime::now_utc();
                        if let Err(e) = self.store.save(&subscription).await {
                            tracing::warn!(subscription_id = %subscription.id, error = %e, "Failed to persist error state");
                        }
                    }
                }
            }
            loaded.push(subscription);
        }

        let count = loaded.len();
        {
            let mut map = self.subscriptions.write();
            for subscription in loaded {
                map.insert(subscription.id.clone(), Arc::new(subscription));
            }
        }
        tracing::info!(count, "Subscriptions restored from store");
        Ok(count)
    }

    /// Apply a status change in memory, persist it, then tell listeners.
    async fn transition(
        &self,
        id: &str,
        status: SubscriptionStatus,
        error: Option<String>,
    ) -> SubscriptionResult<()> {
        let updated = {
            let mut map = self.subscriptions.write();
            let entry = map
                .get_mut(id)
                .ok_or_else(|| SubscriptionError::not_found(id))?;
            if entry.status == status && error.is_none() {
                return Ok(());
            }
            let sub = Arc::make_mut(entry);
            let previous = sub.status;
            sub.status = status;
            sub.updated_at = OffsetDateTime::now_utc();
            match status {
                SubscriptionStatus::Active => {
                    if sub.filter.is_none() {
                        sub.filter = sub.criteria.parse().ok();
                    }
                    sub.error = None;
                }
                SubscriptionStatus::Error => sub.error = error,
                _ => {}
            }
            tracing::info!(
                subscription_id = %id,
                from = %previous,
                to = %status,
                "Subscription status changed"
            );
            entry.clone()
        };

        let persisted = self.store.save(&updated).await;
        if let Err(e) = &persisted {
            tracing::error!(subscription_id = %id, error = %e, "Failed to persist status change");
        }

        for listener in self.live_listeners() {
            listener.on_status_changed(id, status);
        }
        persisted
    }

    fn live_listeners(&self) -> Vec<Arc<dyn SubscriptionStatusListener>> {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::payload::JsonResourceCodec;
    use crate::subscriptions::storage::InMemorySubscriptionStore;
    use crate::subscriptions::types::PayloadEncoding;
    use parking_lot::Mutex;

    fn manager_with(store: Arc<dyn SubscriptionStore>) -> SubscriptionManager {
        SubscriptionManager::new(
            store,
            Arc::new(IdGenerator::default()),
            Arc::new(JsonResourceCodec),
            vec![ChannelType::WebSocket],
        )
    }

    fn manager() -> SubscriptionManager {
        manager_with(Arc::new(InMemorySubscriptionStore::new()))
    }

    fn ws(criteria: &str) -> SubscriptionRequest {
        SubscriptionRequest::new(criteria, ChannelType::WebSocket)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, SubscriptionStatus)>>);

    impl SubscriptionStatusListener for Recorder {
        fn on_status_changed(&self, id: &str, status: SubscriptionStatus) {
            self.0.lock().push((id.to_string(), status));
        }
    }

    #[tokio::test]
    async fn register_activates_and_persists() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let manager = manager_with(store.clone());

        let id = manager.register(ws("Observation?subject=Patient/1")).await.unwrap();
        assert_eq!(id, "1");
        let sub = manager.get(&id).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.filter.is_some());
        assert_eq!(
            store.load(&id).await.unwrap().unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn register_rejects_invalid_requests() {
        let manager = manager();
        for criteria in ["", "Unicorn?x=1", "Observation?subject", "Observation?subject="] {
            let err = manager.register(ws(criteria)).await.unwrap_err();
            assert!(matches!(err, SubscriptionError::Validation(_)), "{criteria}");
        }

        let rest_hook = SubscriptionRequest::new("Patient", ChannelType::RestHook);
        assert!(matches!(
            manager.register(rest_hook).await,
            Err(SubscriptionError::Validation(_))
        ));

        let xml = ws("Patient").with_payload(PayloadEncoding::Xml);
        assert!(matches!(
            manager.register(xml).await,
            Err(SubscriptionError::Validation(_))
        ));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn ids_stay_unique_after_the_sequence_is_exhausted() {
        let ids = Arc::new(IdGenerator::default());
        let manager = SubscriptionManager::new(
            Arc::new(InMemorySubscriptionStore::new()),
            ids.clone(),
            Arc::new(JsonResourceCodec),
            vec![ChannelType::WebSocket],
        );
        let first = manager.register(ws("Observation?subject=Patient/1")).await.unwrap();
        assert_eq!(first, "1");

        // A client-chosen resource id at the top of the range
        ids.observe(&u64::MAX.to_string());

        let mut later = Vec::new();
        for _ in 0..3 {
            later.push(manager.register(ws("Patient")).await.unwrap());
        }
        assert!(!later.contains(&first));
        assert_eq!(manager.len(), 4);
        assert_eq!(
            manager.get(&first).unwrap().criteria,
            "Observation?subject=Patient/1"
        );
    }

    #[tokio::test]
    async fn register_skips_ids_already_in_use() {
        let donor = manager();
        let taken = donor.register(ws("Observation")).await.unwrap();
        assert_eq!(taken, "1");

        let manager = manager();
        manager
            .subscriptions
            .write()
            .insert(taken.clone(), donor.get(&taken).unwrap());

        let id = manager.register(ws("Patient")).await.unwrap();
        assert_eq!(id, "2");
        assert_eq!(manager.get(&taken).unwrap().criteria, "Observation");
        assert_eq!(manager.get(&id).unwrap().criteria, "Patient");
    }

    #[tokio::test]
    async fn active_lookup_filters_by_type_and_status() {
        let manager = manager();
        let a = manager.register(ws("Observation?subject=Patient/1")).await.unwrap();
        let b = manager.register(ws("Observation")).await.unwrap();
        manager.register(ws("Patient")).await.unwrap();

        let ids: Vec<String> = manager
            .active_subscriptions_for("Observation")
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));

        manager.deactivate(&a).await.unwrap();
        let ids: Vec<String> = manager
            .active_subscriptions_for("Observation")
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids, vec![b]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lifecycle_changes_keep_lookup_consistent() {
        let manager = Arc::new(manager());
        let stable = manager.register(ws("Observation")).await.unwrap();

        let writer = {
            let manager = manager.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let id = manager.register(ws("Observation?status=final")).await.unwrap();
                    manager.deactivate(&id).await.unwrap();
                    manager.activate(&id).await.unwrap();
                    manager.remove(&id).await.unwrap();
                }
            })
        };

        let reader = {
            let manager = manager.clone();
            let stable = stable.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let snapshot: Vec<_> = manager.active_subscriptions_for("Observation").collect();
                    assert!(snapshot.iter().any(|s| s.id == stable));
                    for sub in &snapshot {
                        assert_eq!(sub.status, SubscriptionStatus::Active);
                        assert_eq!(sub.resource_type(), Some("Observation"));
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();

        let ids: Vec<String> = manager
            .active_subscriptions_for("Observation")
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids, vec![stable]);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn deactivate_notifies_listeners_and_is_idempotent() {
        let manager = manager();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn SubscriptionStatusListener> =
            Arc::downgrade(&(recorder.clone() as Arc<dyn SubscriptionStatusListener>));
        manager.add_listener(weak);

        let id = manager.register(ws("Patient")).await.unwrap();
        manager.deactivate(&id).await.unwrap();
        manager.deactivate(&id).await.unwrap();

        assert_eq!(manager.get(&id).unwrap().status, SubscriptionStatus::Off);
        assert_eq!(
            recorder.0.lock().as_slice(),
            &[(id.clone(), SubscriptionStatus::Off)]
        );
        assert!(matches!(
            manager.deactivate("404").await,
            Err(SubscriptionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn error_and_reactivation() {
        let manager = manager();
        let id = manager.register(ws("Patient")).await.unwrap();

        manager.set_error(&id, "delivery failed").await.unwrap();
        let sub = manager.get(&id).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Error);
        assert_eq!(sub.error.as_deref(), Some("delivery failed"));
        assert_eq!(manager.active_subscriptions_for("Patient").count(), 0);

        manager.activate(&id).await.unwrap();
        let sub = manager.get(&id).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.error.is_none());
    }

    #[tokio::test]
    async fn remove_deletes_from_store() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let manager = manager_with(store.clone());
        let id = manager.register(ws("Patient")).await.unwrap();

        manager.remove(&id).await.unwrap();
        assert!(matches!(manager.get(&id), Err(SubscriptionError::NotFound(_))));
        assert!(store.load(&id).await.unwrap().is_none());
        assert!(manager.remove(&id).await.is_err());
    }

    #[tokio::test]
    async fn reload_restores_and_marks_bad_criteria_as_error() {
        let store: Arc<dyn SubscriptionStore> = Arc::new(InMemorySubscriptionStore::new());
        let first = manager_with(store.clone());
        let good = first.register(ws("Observation?subject=Patient/1")).await.unwrap();
        let bad = first.register(ws("Observation")).await.unwrap();

        // Corrupt one record behind the registry's back
        let mut record = store.load(&bad).await.unwrap().unwrap();
        record.criteria = "Nonexistent?x=1".into();
        store.save(&record).await.unwrap();

        let second = manager_with(store.clone());
        assert_eq!(second.reload().await.unwrap(), 2);
        assert_eq!(second.get(&good).unwrap().status, SubscriptionStatus::Active);

        let restored = second.get(&bad).unwrap();
        assert_eq!(restored.status, SubscriptionStatus::Error);
        assert!(restored.filter.is_none());
        assert_eq!(second.active_subscriptions_for("Observation").count(), 1);

        // ids continue after the restored ones
        let next = second.register(ws("Patient")).await.unwrap();
        assert_eq!(next, "3");

        // activating with broken criteria fails and stays in error
        assert!(matches!(
            second.activate(&bad).await,
            Err(SubscriptionError::Validation(_))
        ));
        assert_eq!(second.get(&bad).unwrap().status, SubscriptionStatus::Error);
    }
}
