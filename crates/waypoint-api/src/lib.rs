//! Waypoint API /v1: read access to records and journeys, the ingest
//! pipeline, and Prometheus metrics.
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod state;

pub use state::{AppState, SharedState};

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/v1/health", get(handlers::health))
        .route("/v1/records/{correlation_id}", get(handlers::get_records))
        .route("/v1/journeys/{journey_id}", get(handlers::get_journey))
        .route(
            "/v1/correlations/{correlation_id}/journey",
            get(handlers::get_correlation_journey),
        )
        .route("/v1/sessions", post(handlers::create_session))
        .route("/v1/pipelines/ingest", post(handlers::ingest))
        .route("/metrics", get(handlers::metrics))
        .layer(from_fn_with_state(state.clone(), middleware::count_requests))
        .layer(middleware::cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(addr: &str, state: SharedState) -> std::io::Result<()> {
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Waypoint API listening on {}", addr);
    axum::serve(listener, app).await
}
