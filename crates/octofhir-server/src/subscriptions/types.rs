//! Subscription data model and its FHIR JSON mapping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use super::criteria::Criteria;
use super::error::{SubscriptionError, SubscriptionResult};

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Requested,
    Active,
    Error,
    Off,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            "off" => Ok(Self::Off),
            other => Err(SubscriptionError::validation(format!(
                "unknown subscription status '{other}'"
            ))),
        }
    }
}

/// Delivery mechanism a subscription asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    #[serde(rename = "websocket")]
    WebSocket,
    #[serde(rename = "rest-hook")]
    RestHook,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "message")]
    Message,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::RestHook => "rest-hook",
            Self::Email => "email",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websocket" => Ok(Self::WebSocket),
            "rest-hook" => Ok(Self::RestHook),
            "email" => Ok(Self::Email),
            "message" => Ok(Self::Message),
            other => Err(SubscriptionError::validation(format!(
                "unknown channel type '{other}'"
            ))),
        }
    }
}

/// How the notification body is rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Json,
    Xml,
    /// Body is exactly the subscription id
    #[default]
    None,
}

impl PayloadEncoding {
    /// Parse a `channel.payload` mime type. Absent or blank means no payload.
    pub fn from_mime(mime: Option<&str>) -> SubscriptionResult<Self> {
        let Some(mime) = mime.map(str::trim).filter(|m| !m.is_empty()) else {
            return Ok(Self::None);
        };
        // Ignore parameters such as "; charset=utf-8"
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/fhir+json" | "application/json+fhir" | "application/json" | "json" => {
                Ok(Self::Json)
            }
            "application/fhir+xml" | "application/xml+fhir" | "application/xml" | "xml" => {
                Ok(Self::Xml)
            }
            _ => Err(SubscriptionError::validation(format!(
                "unsupported payload mime type '{mime}'"
            ))),
        }
    }

    pub fn mime_type(&self) -> Option<&'static str> {
        match self {
            Self::Json => Some("application/fhir+json"),
            Self::Xml => Some("application/fhir+xml"),
            Self::None => None,
        }
    }
}

/// A registered subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    /// Criteria as registered
    pub criteria: String,
    /// Compiled criteria; `None` when the stored criteria no longer parse
    #[serde(skip)]
    pub filter: Option<Criteria>,
    pub channel_type: ChannelType,
    pub payload: PayloadEncoding,
    pub status: SubscriptionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Last error recorded when the subscription moved to `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Only active subscriptions with compiled criteria take part in matching.
    pub fn is_matchable(&self) -> bool {
        self.status == SubscriptionStatus::Active && self.filter.is_some()
    }

    /// Resource type the criteria target, when they parse.
    pub fn resource_type(&self) -> Option<&str> {
        self.filter.as_ref().map(Criteria::resource_type)
    }

    /// Render as a FHIR R4 Subscription resource.
    pub fn to_fhir_json(&self) -> Value {
        let mut channel = json!({ "type": self.channel_type.as_str() });
        if let Some(mime) = self.payload.mime_type() {
            channel["payload"] = json!(mime);
        }
        let mut resource = json!({
            "resourceType": "Subscription",
            "id": self.id,
            "status": self.status.as_str(),
            "criteria": self.criteria,
            "channel": channel,
            "meta": {
                "lastUpdated": self
                    .updated_at
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            }
        });
        if let Some(reason) = &self.reason {
            resource["reason"] = json!(reason);
        }
        if let Some(error) = &self.error {
            resource["error"] = json!(error);
        }
        resource
    }
}

/// What a client supplies to register a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub criteria: String,
    pub channel_type: ChannelType,
    pub payload: PayloadEncoding,
    pub reason: Option<String>,
}

impl SubscriptionRequest {
    pub fn new(criteria: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            criteria: criteria.into(),
            channel_type,
            payload: PayloadEncoding::None,
            reason: None,
        }
    }

    pub fn with_payload(mut self, payload: PayloadEncoding) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Read a FHIR R4 Subscription resource.
    pub fn from_resource(resource: &Value) -> SubscriptionResult<Self> {
        let resource_type = resource.get("resourceType").and_then(Value::as_str);
        if resource_type != Some("Subscription") {
            return Err(SubscriptionError::validation(
                "resourceType must be 'Subscription'",
            ));
        }

        let criteria = resource
            .get("criteria")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| SubscriptionError::validation("Subscription.criteria is required"))?;

        let channel = resource
            .get("channel")
            .ok_or_else(|| SubscriptionError::validation("Subscription.channel is required"))?;
        let channel_type = channel
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SubscriptionError::validation("Subscription.channel.type is required")
            })?
            .parse()?;
        let payload = PayloadEncoding::from_mime(channel.get("payload").and_then(Value::as_str))?;

        Ok(Self {
            criteria: criteria.to_string(),
            channel_type,
            payload,
            reason: resource
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_from_mime() {
        assert_eq!(PayloadEncoding::from_mime(None).unwrap(), PayloadEncoding::None);
        assert_eq!(PayloadEncoding::from_mime(Some(" ")).unwrap(), PayloadEncoding::None);
        assert_eq!(
            PayloadEncoding::from_mime(Some("application/fhir+json; charset=utf-8")).unwrap(),
            PayloadEncoding::Json
        );
        assert_eq!(PayloadEncoding::from_mime(Some("xml")).unwrap(), PayloadEncoding::Xml);
        assert!(PayloadEncoding::from_mime(Some("text/csv")).is_err());
    }

    #[test]
    fn request_from_fhir_resource() {
        let resource = json!({
            "resourceType": "Subscription",
            "status": "requested",
            "reason": "Monitor new observations",
            "criteria": "Observation?subject=Patient/1",
            "channel": { "type": "websocket", "payload": "application/fhir+json" }
        });
        let req = SubscriptionRequest::from_resource(&resource).unwrap();
        assert_eq!(req.criteria, "Observation?subject=Patient/1");
        assert_eq!(req.channel_type, ChannelType::WebSocket);
        assert_eq!(req.payload, PayloadEncoding::Json);
        assert_eq!(req.reason.as_deref(), Some("Monitor new observations"));
    }

    #[test]
    fn request_rejects_incomplete_resources() {
        let no_criteria = json!({"resourceType": "Subscription", "channel": {"type": "websocket"}});
        assert!(SubscriptionRequest::from_resource(&no_criteria).is_err());

        let no_channel = json!({"resourceType": "Subscription", "criteria": "Patient"});
        assert!(SubscriptionRequest::from_resource(&no_channel).is_err());

        let bad_channel = json!({
            "resourceType": "Subscription",
            "criteria": "Patient",
            "channel": {"type": "carrier-pigeon"}
        });
        assert!(SubscriptionRequest::from_resource(&bad_channel).is_err());

        let wrong_type = json!({"resourceType": "Patient"});
        assert!(SubscriptionRequest::from_resource(&wrong_type).is_err());
    }

    #[test]
    fn status_and_channel_strings() {
        assert_eq!("off".parse::<SubscriptionStatus>().unwrap(), SubscriptionStatus::Off);
        assert!("paused".parse::<SubscriptionStatus>().is_err());
        assert_eq!(ChannelType::RestHook.to_string(), "rest-hook");
        assert_eq!(
            serde_json::to_value(ChannelType::WebSocket).unwrap(),
            json!("websocket")
        );
    }

    #[test]
    fn fhir_json_shape() {
        let now = OffsetDateTime::now_utc();
        let sub = Subscription {
            id: "5".into(),
            criteria: "Observation?subject=Patient/1".into(),
            filter: "Observation?subject=Patient/1".parse().ok(),
            channel_type: ChannelType::WebSocket,
            payload: PayloadEncoding::None,
            status: SubscriptionStatus::Active,
            reason: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(sub.is_matchable());
        assert_eq!(sub.resource_type(), Some("Observation"));
        let json = sub.to_fhir_json();
        assert_eq!(json["resourceType"], "Subscription");
        assert_eq!(json["id"], "5");
        assert_eq!(json["status"], "active");
        assert_eq!(json["channel"]["type"], "websocket");
        assert!(json["channel"].get("payload").is_none());
    }
}
