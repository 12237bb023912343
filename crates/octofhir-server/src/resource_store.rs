//! In-memory resource store that fires resource hooks after each write.
//!
//! Hooks run after the resource is stored, so a hook only ever observes
//! writes that succeeded.

use std::sync::Arc;

use dashmap::DashMap;
use octofhir_core::events::{HookRegistry, ResourceEvent};
use octofhir_core::{CoreError, IdGenerator, Result, validate_id, validate_resource_type};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A stored resource version.
#[derive(Debug, Clone)]
pub struct StoredResource {
    pub id: String,
    pub version_id: u64,
    pub last_updated: OffsetDateTime,
    pub resource: Value,
}

pub struct ResourceStore {
    resources: DashMap<(String, String), StoredResource>,
    ids: Arc<IdGenerator>,
    hooks: Arc<HookRegistry>,
}

impl ResourceStore {
    pub fn new(ids: Arc<IdGenerator>, hooks: Arc<HookRegistry>) -> Self {
        Self {
            resources: DashMap::new(),
            ids,
            hooks,
        }
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Store `resource` under a server-assigned id.
    pub async fn create(&self, resource_type: &str, resource: Value) -> Result<StoredResource> {
        check_body_type(resource_type, &resource)?;
        let id = self.ids.next_id();
        let stored = self.put(resource_type, &id, resource, 1);
        tracing::debug!(resource_type = %resource_type, resource_id = %id, "Resource created");

        self.hooks
            .fire(&ResourceEvent::created(
                resource_type,
                &stored.id,
                stored.resource.clone(),
            ))
            .await;
        Ok(stored)
    }

    /// Store `resource` under a client-chosen id. Returns whether it was new.
    pub async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
    ) -> Result<(StoredResource, bool)> {
        check_body_type(resource_type, &resource)?;
        validate_id(id).map_err(|e| CoreError::invalid_id(e.to_string()))?;
        if let Some(body_id) = resource.get("id").and_then(Value::as_str)
            && body_id != id
        {
            return Err(CoreError::invalid_resource(format!(
                "resource id '{body_id}' does not match URL id '{id}'"
            )));
        }

        let version = self
            .resources
            .get(&(resource_type.to_string(), id.to_string()))
            .map(|r| r.version_id + 1)
            .unwrap_or(1);
        let created = version == 1;
        self.ids.observe(id);
        let stored = self.put(resource_type, id, resource, version);
        tracing::debug!(
            resource_type = %resource_type,
            resource_id = %id,
            version,
            "Resource stored"
        );

        let event = if created {
            ResourceEvent::created(resource_type, id, stored.resource.clone())
        } else {
            ResourceEvent::updated(resource_type, id, stored.resource.clone())
        };
        self.hooks.fire(&event).await;
        Ok((stored, created))
    }

    pub fn read(&self, resource_type: &str, id: &str) -> Option<StoredResource> {
        self.resources
            .get(&(resource_type.to_string(), id.to_string()))
            .map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn put(&self, resource_type: &str, id: &str, mut resource: Value, version: u64) -> StoredResource {
        let now = OffsetDateTime::now_utc();
        resource["id"] = json!(id);
        resource["meta"] = json!({
            "versionId": version.to_string(),
            "lastUpdated": now.format(&Rfc3339).unwrap_or_default(),
        });
        let stored = StoredResource {
            id: id.to_string(),
            version_id: version,
            last_updated: now,
            resource,
        };
        self.resources
            .insert((resource_type.to_string(), id.to_string()), stored.clone());
        stored
    }
}

fn check_body_type(resource_type: &str, resource: &Value) -> Result<()> {
    validate_resource_type(resource_type)?;
    match resource.get("resourceType").and_then(Value::as_str) {
        Some(t) if t == resource_type => Ok(()),
        Some(t) => Err(CoreError::invalid_resource(format!(
            "resourceType '{t}' does not match endpoint type '{resource_type}'"
        ))),
        None => Err(CoreError::invalid_resource("resourceType is required")),
    }
}
