//! API Handlers
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use waypoint_core::{ContextAttrs, WaypointError, WAYPOINT_VERSION};
use waypoint_subsystems::{ingest_input, Document, INGEST_OPERATION};

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    pub document: Document,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: String,
}

pub async fn health() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "version": WAYPOINT_VERSION })),
    )
}

pub async fn get_records(
    State(state): State<SharedState>,
    Path(correlation_id): Path<String>,
) -> Json<Value> {
    let records = state.recorder().records_for(&correlation_id);
    Json(json!({ "correlation_id": correlation_id, "records": records }))
}

pub async fn get_journey(
    State(state): State<SharedState>,
    Path(journey_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .tracker()
        .get_journey(&journey_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("journey {} not found", journey_id)))
}

pub async fn get_correlation_journey(
    State(state): State<SharedState>,
    Path(correlation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .tracker()
        .journey_for_correlation(&correlation_id)
        .map(Json)
        .ok_or_else(|| {
            ApiError::NotFound(format!("no journey for correlation {}", correlation_id))
        })
}

pub async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("session_id is empty".to_string()));
    }
    state
        .subsystems
        .identity
        .grant(req.session_id.clone(), req.tenant_id, req.user_id);
    Ok((StatusCode::CREATED, Json(json!({ "session_id": req.session_id }))))
}

/// Runs the reference ingest pipeline. Runtime failures still return the
/// full result, with 422 instead of 200.
pub async fn ingest(
    State(state): State<SharedState>,
    Json(req): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut attrs = ContextAttrs::new();
    attrs.tenant_id = req.tenant_id;
    attrs.user_id = req.user_id;
    attrs.session_id = req.session_id;
    attrs.attributes = req.attributes;

    let ctx = state
        .factory
        .create(None, attrs)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let phases = state.subsystems.ingest_phases(state.documents.clone());

    let result = state
        .executor
        .execute_with_input(
            INGEST_OPERATION,
            &phases,
            &ctx,
            &state.policy,
            ingest_input(&req.document),
        )
        .await
        .map_err(|e| match e {
            WaypointError::Configuration(_) => ApiError::Internal(e.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        })?;

    state.metrics.observe_pipeline(&result);
    state
        .metrics
        .record_write_failures
        .set(state.recorder().write_failures() as i64);

    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(result)))
}

pub async fn metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
