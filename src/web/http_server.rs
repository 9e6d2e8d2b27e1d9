//! HTTP introspection server: health, metrics, and connection listing.

use crate::web::shared::SharedState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

pub async fn run_http_server(addr: &str, state: Arc<SharedState>) -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/rtmpconns/list", get(list_handler))
        .route("/v1/rtmpconns/get", get(get_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("HTTP introspection server listening on http://{addr}");

    axum::serve(listener, app).await.map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptimeSeconds": state.uptime().as_secs_f64(),
        "connections": state.connection_count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(state): State<Arc<SharedState>>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}

async fn list_handler(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({ "items": state.list() }))
}

#[derive(Deserialize)]
struct GetQuery {
    id: String,
}

async fn get_handler(State(state): State<Arc<SharedState>>, Query(query): Query<GetQuery>) -> Response {
    match state.get(&query.id) {
        Some(value) => Json(value).into_response(),
        None => (StatusCode::NOT_FOUND, format!("connection {} not found", query.id)).into_response(),
    }
}
