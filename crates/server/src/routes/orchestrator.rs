use axum::{
    Extension, Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::task::Task;
use deployment::Deployment;
use services::services::{execution::ExecutionSummary, gatekeeper::RunAccepted};
use utils::response::ApiResponse;

use crate::{
    DeploymentImpl,
    error::ApiError,
    middleware::{AuthUser, parse_id},
};

/// Accept a run and return before it starts. Failures after this point reach
/// the client only as realtime events and the task's final status.
pub async fn run_task(
    Extension(user): Extension<AuthUser>,
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, ResponseJson<RunAccepted>), ApiError> {
    let task_id = parse_id(&task_id, "task")?;
    let accepted = deployment
        .orchestrator()
        .request_run(task_id, user.user_id)
        .await?;
    Ok((StatusCode::CREATED, ResponseJson(accepted)))
}

pub async fn reset_task(
    Extension(user): Extension<AuthUser>,
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task_id = parse_id(&task_id, "task")?;
    let task = deployment
        .orchestrator()
        .reset_task(task_id, user.user_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn get_executions(
    Extension(user): Extension<AuthUser>,
    State(deployment): State<DeploymentImpl>,
) -> ResponseJson<ApiResponse<Vec<ExecutionSummary>>> {
    let executions = deployment
        .orchestrator()
        .active_executions(user.user_id)
        .await;
    ResponseJson(ApiResponse::success(executions))
}

pub fn router() -> Router<DeploymentImpl> {
    let orchestrator_router = Router::new()
        .route("/tasks/{task_id}/run", post(run_task))
        .route("/tasks/{task_id}/reset", post(reset_task))
        .route("/executions", get(get_executions));

    Router::new().nest("/orchestrator", orchestrator_router)
}
