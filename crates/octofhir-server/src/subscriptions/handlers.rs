//! HTTP handlers for subscription endpoints.
//!
//! - `POST /fhir/Subscription`, `GET /fhir/Subscription`
//! - `GET|PUT|DELETE /fhir/Subscription/{id}`
//! - `GET /fhir/Subscription/{id}/$status`
//! - `GET /fhir/Subscription/{id}/$events` - WebSocket bound to one subscription
//! - `GET /websocket`, `GET /websocket/{version}` - WebSocket with `bind <id>`

use axum::{
    Json,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use octofhir_api::{ApiError, fhir_created, fhir_json};
use serde_json::{Value, json};

use super::SubscriptionState;
use super::delivery::{handle_bind_websocket, handle_subscription_websocket};
use super::types::{ChannelType, Subscription, SubscriptionRequest, SubscriptionStatus};

/// `POST /fhir/Subscription`
pub async fn create_subscription(
    State(state): State<SubscriptionState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let request = SubscriptionRequest::from_resource(&body)?;
    let id = state.registry.register(request).await?;
    let subscription = state.registry.get(&id)?;
    Ok(fhir_created(
        &format!("Subscription/{id}"),
        &subscription.to_fhir_json(),
    ))
}

/// `GET /fhir/Subscription` as a searchset bundle.
pub async fn list_subscriptions(State(state): State<SubscriptionState>) -> Response {
    let entries: Vec<Value> = state
        .registry
        .list()
        .iter()
        .map(|s| json!({ "fullUrl": format!("Subscription/{}", s.id), "resource": s.to_fhir_json() }))
        .collect();
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": entries.len(),
        "entry": entries,
    });
    fhir_json(StatusCode::OK, &bundle)
}

/// `GET /fhir/Subscription/{id}`
pub async fn read_subscription(
    State(state): State<SubscriptionState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let subscription = state.registry.get(&id)?;
    Ok(fhir_json(StatusCode::OK, &subscription.to_fhir_json()))
}

/// `PUT /fhir/Subscription/{id}`
///
/// Only `status` may change: `off` deactivates, `active` reactivates.
pub async fn update_subscription(
    State(state): State<SubscriptionState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let current = state.registry.get(&id)?;
    check_immutable_fields(&current, &id, &body)?;

    let status: SubscriptionStatus = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("Subscription.status is required"))?
        .parse()?;

    match status {
        SubscriptionStatus::Off => state.registry.deactivate(&id).await?,
        SubscriptionStatus::Active => state.registry.activate(&id).await?,
        other => {
            return Err(ApiError::bad_request(format!(
                "status cannot be set to '{other}' by a client"
            )));
        }
    }

    let updated = state.registry.get(&id)?;
    Ok(fhir_json(StatusCode::OK, &updated.to_fhir_json()))
}

fn check_immutable_fields(current: &Subscription, id: &str, body: &Value) -> Result<(), ApiError> {
    if body.get("resourceType").and_then(Value::as_str) != Some("Subscription") {
        return Err(ApiError::bad_request("resourceType must be 'Subscription'"));
    }
    if let Some(body_id) = body.get("id").and_then(Value::as_str)
        && body_id != id
    {
        return Err(ApiError::bad_request(format!(
            "resource id '{body_id}' does not match URL id '{id}'"
        )));
    }
    if let Some(criteria) = body.get("criteria").and_then(Value::as_str)
        && criteria != current.criteria
    {
        return Err(ApiError::bad_request(
            "Subscription.criteria cannot be changed; register a new subscription",
        ));
    }
    if let Some(channel_type) = body.pointer("/channel/type").and_then(Value::as_str)
        && channel_type != current.channel_type.as_str()
    {
        return Err(ApiError::bad_request(
            "Subscription.channel.type cannot be changed",
        ));
    }
    Ok(())
}

/// `DELETE /fhir/Subscription/{id}`
pub async fn delete_subscription(
    State(state): State<SubscriptionState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /fhir/Subscription/{id}/$status`
pub async fn subscription_status(
    State(state): State<SubscriptionState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let subscription = state.registry.get(&id)?;
    let mut body = json!({
        "resourceType": "SubscriptionStatus",
        "status": subscription.status.as_str(),
        "type": "query-status",
        "subscription": { "reference": format!("Subscription/{id}") },
        "channelType": subscription.channel_type.as_str(),
        "channelState": state.channels.channel_state(&id).as_str(),
        "consecutiveFailures": state.coordinator.failure_count(&id),
    });
    if let Some(error) = &subscription.error {
        body["error"] = json!([{ "text": error }]);
    }
    Ok(fhir_json(StatusCode::OK, &body))
}

/// `GET /fhir/Subscription/{id}/$events`
pub async fn subscription_events_handler(
    State(state): State<SubscriptionState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let subscription = state.registry.get(&id)?;
    if subscription.channel_type != ChannelType::WebSocket {
        return Err(ApiError::bad_request(
            "Subscription does not use the websocket channel",
        ));
    }

    let channels = state.channels.clone();
    let config = state.websocket.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        handle_subscription_websocket(socket, id, channels, config).await;
    }))
}

/// `GET /websocket`
pub async fn websocket_bind_handler(
    State(state): State<SubscriptionState>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade_bind(state, ws)
}

/// `GET /websocket/{version}`; the version segment is accepted for client compatibility.
pub async fn websocket_bind_versioned_handler(
    State(state): State<SubscriptionState>,
    Path(version): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!(version = %version, "Versioned WebSocket bind endpoint");
    upgrade_bind(state, ws)
}

fn upgrade_bind(state: SubscriptionState, ws: WebSocketUpgrade) -> Response {
    let channels = state.channels.clone();
    let config = state.websocket.clone();
    ws.on_upgrade(move |socket| async move {
        handle_bind_websocket(socket, channels, config).await;
    })
    .into_response()
}
