use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers;

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/pipeline/check", get(handlers::get_pipeline_check))
        .route("/api/pipeline/flow", get(handlers::get_flow_graph))
        .route("/api/pipeline/e2e", get(handlers::get_e2e))
        .route("/api/pipeline/history", get(handlers::get_history))
        .route("/api/pipeline/run", post(handlers::post_run))
        .route("/api/pipeline/topology", get(handlers::get_topology))
        .layer(middleware::from_fn(response_headers))
        .layer(build_cors())
        .with_state(state)
}

/// Reports are always computed live.
async fn response_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}
