use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use octofhir_api::{ApiError, fhir_created, fhir_json};
use serde::Serialize;
use serde_json::{Value, json};

use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "OctoFHIR Subscriptions",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("GIT_COMMIT"),
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

// ---- Resource write path ----

pub async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let stored = state.resources.create(&resource_type, payload).await?;
    Ok(fhir_created(
        &format!("{resource_type}/{}", stored.id),
        &stored.resource,
    ))
}

pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let (stored, created) = state.resources.update(&resource_type, &id, payload).await?;
    if created {
        Ok(fhir_created(&format!("{resource_type}/{id}"), &stored.resource))
    } else {
        Ok(fhir_json(StatusCode::OK, &stored.resource))
    }
}

pub async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    state
        .resources
        .read(&resource_type, &id)
        .map(|stored| fhir_json(StatusCode::OK, &stored.resource))
        .ok_or_else(|| ApiError::not_found(format!("{resource_type}/{id} not found")))
}
