use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use tracing::info;
use uuid::Uuid;

use crate::models::{AppState, CancelResponse, ResearchRequest, ResearchResponse, TaskListResponse, TaskSummary};
use crate::tasks::{TaskResult, TaskStatusView};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/research", post(submit_research).get(list_research_tasks))
        .route("/research/{task_id}", get(get_research_results).delete(cancel_research_task))
        .route("/research/{task_id}/status", get(get_task_status))
        .with_state(state)
}

/// Ids that do not parse can never name a task
pub(crate) fn parse_task_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound("Task not found".to_string()))
}

async fn submit_research(
    State(state): State<AppState>,
    Json(request): Json<ResearchRequest>,
) -> AppResult<Json<ResearchResponse>> {
    let submitted = state.dispatcher.submit(request).await?;
    Ok(Json(submitted.into()))
}

async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<TaskStatusView>> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(state.manager.get_status(&task_id).await?))
}

async fn get_research_results(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<TaskResult>> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(state.manager.get_result(&task_id).await?))
}

async fn list_research_tasks(State(state): State<AppState>) -> Json<TaskListResponse> {
    let tasks: Vec<TaskSummary> = state.manager.list_tasks().await.iter().map(TaskSummary::from).collect();
    Json(TaskListResponse {
        total_tasks: tasks.len(),
        tasks,
    })
}

async fn cancel_research_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<CancelResponse>> {
    let task_id = parse_task_id(&task_id)?;
    state.manager.cancel(&task_id).await?;
    info!(task_id = %task_id, "Research task cancelled");
    Ok(Json(CancelResponse {
        message: "Task cancelled successfully".to_string(),
    }))
}
