//! Notification payloads and the codecs that render them.

use std::sync::Arc;

use serde_json::Value;

use super::types::PayloadEncoding;

/// Renders a resource in a payload encoding.
pub trait ResourceCodec: Send + Sync {
    fn supports(&self, encoding: PayloadEncoding) -> bool;

    fn encode(&self, resource: &Value, encoding: PayloadEncoding) -> Result<String, String>;
}

/// JSON-only codec. `NONE` needs no rendering and is always supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResourceCodec;

impl ResourceCodec for JsonResourceCodec {
    fn supports(&self, encoding: PayloadEncoding) -> bool {
        matches!(encoding, PayloadEncoding::Json | PayloadEncoding::None)
    }

    fn encode(&self, resource: &Value, encoding: PayloadEncoding) -> Result<String, String> {
        match encoding {
            PayloadEncoding::Json => serde_json::to_string(resource).map_err(|e| e.to_string()),
            PayloadEncoding::None => Ok(String::new()),
            PayloadEncoding::Xml => Err("XML encoding is not available".into()),
        }
    }
}

/// A match to deliver: the subscription and the resource that triggered it.
#[derive(Debug, Clone)]
pub struct Notification {
    pub subscription_id: String,
    /// `Type/id` of the triggering resource
    pub focus: String,
    pub resource: Arc<Value>,
}

impl Notification {
    pub fn new(subscription_id: impl Into<String>, focus: impl Into<String>, resource: Arc<Value>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            focus: focus.into(),
            resource,
        }
    }
}

/// One complete message handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationFrame {
    pub subscription_id: String,
    pub content_type: Option<&'static str>,
    pub body: String,
}

impl NotificationFrame {
    /// Render `notification` for a channel using `encoding`.
    ///
    /// With no payload the body is exactly the subscription id.
    pub fn render(
        notification: &Notification,
        encoding: PayloadEncoding,
        codec: &dyn ResourceCodec,
    ) -> Result<Self, String> {
        let body = match encoding {
            PayloadEncoding::None => notification.subscription_id.clone(),
            other => codec.encode(&notification.resource, other)?,
        };
        Ok(Self {
            subscription_id: notification.subscription_id.clone(),
            content_type: encoding.mime_type(),
            body,
        })
    }
}
