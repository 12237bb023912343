//! Event types raised by the resource write path.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Type of resource change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceEventType {
    Created,
    Updated,
    Deleted,
}

impl ResourceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceEventType::Created => "created",
            ResourceEventType::Updated => "updated",
            ResourceEventType::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ResourceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event representing a durable change to a FHIR resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub event_type: ResourceEventType,
    pub resource_type: String,
    pub resource_id: String,
    /// The stored resource (None for deletions)
    pub resource: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ResourceEvent {
    pub fn new(
        event_type: ResourceEventType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            resource,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn created(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: serde_json::Value,
    ) -> Self {
        Self::new(ResourceEventType::Created, resource_type, resource_id, Some(resource))
    }

    pub fn updated(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource: serde_json::Value,
    ) -> Self {
        Self::new(ResourceEventType::Updated, resource_type, resource_id, Some(resource))
    }

    pub fn deleted(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self::new(ResourceEventType::Deleted, resource_type, resource_id, None)
    }

    /// `Type/id` of the affected resource.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_type_and_payload() {
        let created = ResourceEvent::created("Observation", "7", json!({"id": "7"}));
        assert_eq!(created.event_type, ResourceEventType::Created);
        assert_eq!(created.reference(), "Observation/7");
        assert!(created.resource.is_some());

        let deleted = ResourceEvent::deleted("Observation", "7");
        assert_eq!(deleted.event_type.to_string(), "deleted");
        assert!(deleted.resource.is_none());
    }

    #[test]
    fn serializes_with_rfc3339_timestamp() {
        let event = ResourceEvent::updated("Patient", "1", json!({}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "updated");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }
}
