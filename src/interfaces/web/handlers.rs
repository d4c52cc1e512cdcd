use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

use super::AppState;

type ApiResponse = (StatusCode, Json<Value>);

fn ok<T: Serialize>(report: &T) -> ApiResponse {
    match serde_json::to_value(report) {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(e) => failure(e),
    }
}

fn failure(e: impl std::fmt::Display) -> ApiResponse {
    error!("Request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": e.to_string() })),
    )
}

pub async fn get_pipeline_check(State(state): State<AppState>) -> ApiResponse {
    ok(&state.diagnostics.pipeline_check(Utc::now()).await)
}

pub async fn get_flow_graph(State(state): State<AppState>) -> ApiResponse {
    ok(&state.diagnostics.flow_graph(Utc::now()).await)
}

pub async fn get_e2e(State(state): State<AppState>) -> ApiResponse {
    ok(&state.diagnostics.e2e(Utc::now()).await)
}

#[derive(serde::Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse {
    let limit = query.limit.map(|l| l.clamp(1, 500));
    match state.diagnostics.history(limit).await {
        Ok(report) => ok(&report),
        Err(e) => failure(e),
    }
}

pub async fn post_run(State(state): State<AppState>) -> ApiResponse {
    ok(&state.diagnostics.run(Utc::now()).await)
}

pub async fn get_topology(State(state): State<AppState>) -> ApiResponse {
    ok(state.diagnostics.topology())
}
