//! Durable subscription storage.
//!
//! Stored records carry the raw criteria only; the registry recompiles them
//! on load, so a record whose criteria no longer parse comes back in
//! `error` state instead of failing the load.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;

use super::error::{SubscriptionError, SubscriptionResult};
use super::types::Subscription;

/// Persistence for registered subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn save(&self, subscription: &Subscription) -> SubscriptionResult<()>;

    async fn load(&self, id: &str) -> SubscriptionResult<Option<Subscription>>;

    async fn load_all(&self) -> SubscriptionResult<Vec<Subscription>>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> SubscriptionResult<bool>;
}

/// Process-local store, lost on restart.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    records: DashMap<String, Subscription>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn save(&self, subscription: &Subscription) -> SubscriptionResult<()> {
        self.records
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> SubscriptionResult<Option<Subscription>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn load_all(&self) -> SubscriptionResult<Vec<Subscription>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    async fn delete(&self, id: &str) -> SubscriptionResult<bool> {
        Ok(self.records.remove(id).is_some())
    }
}

/// One JSON document per subscription under a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// crash never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct FileSubscriptionStore {
    dir: PathBuf,
}

impl FileSubscriptionStore {
    /// Open (and create if needed) the store directory.
    pub async fn open(dir: impl Into<PathBuf>) -> SubscriptionResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            SubscriptionError::storage(format!("cannot create {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> SubscriptionResult<PathBuf> {
        octofhir_core::validate_id(id).map_err(|e| SubscriptionError::storage(e.to_string()))?;
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl SubscriptionStore for FileSubscriptionStore {
    async fn save(&self, subscription: &Subscription) -> SubscriptionResult<()> {
        let path = self.record_path(&subscription.id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(subscription)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        tracing::debug!(subscription_id = %subscription.id, path = %path.display(), "Subscription persisted");
        Ok(())
    }

    async fn load(&self, id: &str) -> SubscriptionResult<Option<Subscription>> {
        let path = self.record_path(id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> SubscriptionResult<Vec<Subscription>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<Subscription>(&bytes) {
                Ok(sub) => out.push(sub),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable subscription record");
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn delete(&self, id: &str) -> SubscriptionResult<bool> {
        let path = self.record_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
