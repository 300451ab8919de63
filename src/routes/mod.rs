//! API Routes
//!
//! - `POST /research`, `GET /research` - submit and list research tasks
//! - `GET /research/{task_id}` - task result, shaped by status
//! - `GET /research/{task_id}/status` - status and coarse progress
//! - `DELETE /research/{task_id}` - cancel a queued task
//! - `GET /ws/{task_id}` - live status snapshots over WebSocket
//! - `GET /health`, `GET /` - health check and service info

pub mod health;
pub mod research;
pub mod ws;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");
    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(research::router(state.clone()))
        .merge(ws::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
