use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::models::{AppState, HealthResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Research Agent API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "research": "/research",
            "status": "/research/{task_id}/status",
            "results": "/research/{task_id}",
            "updates": "/ws/{task_id}",
            "health": "/health"
        }
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        broker_connected: state.broker_connected(),
        agent_available: state.runner.is_available(),
    })
}
