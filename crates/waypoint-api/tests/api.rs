use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use waypoint_api::{create_app, AppState};
use waypoint_core::WaypointConfig;

fn app() -> Router {
    let state = AppState::from_config(&WaypointConfig::default()).unwrap();
    create_app(Arc::new(state))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn ingest_body(session: &str) -> Value {
    json!({
        "tenant_id": "acme",
        "user_id": "u1",
        "session_id": session,
        "document": { "id": "q3-report", "body": "revenue up 12%" }
    })
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(&app(), "GET", "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_ingest_then_read_back() {
    let app = app();
    let (status, _) = send(
        &app,
        "POST",
        "/v1/sessions",
        Some(json!({ "session_id": "s1", "tenant_id": "acme", "user_id": "u1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, result) = send(&app, "POST", "/v1/pipelines/ingest", Some(ingest_body("s1"))).await;
    assert_eq!(status, StatusCode::OK, "{}", result);
    assert_eq!(result["success"], true);
    assert_eq!(result["accumulated_output"]["stored_id"], "acme/q3-report");

    let correlation_id = result["operation"]["correlation_id"].as_str().unwrap().to_string();
    let journey_id = result["journey_snapshot"]["journey_id"].as_str().unwrap().to_string();

    let (status, records) = send(&app, "GET", &format!("/v1/records/{}", correlation_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(records["records"].as_array().unwrap().len(), 27);

    let (status, journey) = send(&app, "GET", &format!("/v1/journeys/{}", journey_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(journey["status"], "completed");

    let (status, by_correlation) = send(
        &app,
        "GET",
        &format!("/v1/correlations/{}/journey", correlation_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_correlation["journey_id"], journey_id.as_str());
}

#[tokio::test]
async fn test_unknown_session_is_unprocessable() {
    let app = app();
    let (status, result) = send(&app, "POST", "/v1/pipelines/ingest", Some(ingest_body("nope"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(result["success"], false);
    assert_eq!(result["error_code"], "SubsystemFailure:identity");
}

#[tokio::test]
async fn test_missing_journey_is_404() {
    let app = app();
    let (status, body) = send(&app, "GET", "/v1/journeys/jrn_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("jrn_missing"));

    let (status, _) = send(&app, "GET", "/v1/correlations/corr_missing/journey", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_after_ingest() {
    let app = app();
    send(&app, "POST", "/v1/pipelines/ingest", Some(ingest_body("nope"))).await;

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("waypoint_pipelines_total{operation=\"ingest\",outcome=\"failure\"} 1"));
    assert!(text.contains("waypoint_http_requests_total"));
}
