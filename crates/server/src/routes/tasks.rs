use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, put},
};
use db::models::{
    agent::Agent,
    project::Project,
    task::{CreateTask, Task, TaskWithAssignees, UpdateTask},
};
use deployment::Deployment;
use serde::Deserialize;
use services::services::hooks::TaskCreated;
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{
    DeploymentImpl,
    error::ApiError,
    middleware::{AuthUser, load_task_middleware},
};

pub async fn get_project_tasks(
    Extension(project): Extension<Project>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<TaskWithAssignees>>>, ApiError> {
    let pool = &deployment.db().pool;
    let mut tasks = Vec::new();
    for task in Task::find_by_project_id(pool, project.id).await? {
        tasks.push(task.with_assignees(pool).await?);
    }
    Ok(ResponseJson(ApiResponse::success(tasks)))
}

pub async fn create_task(
    Extension(user): Extension<AuthUser>,
    Extension(project): Extension<Project>,
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<CreateTask>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<TaskWithAssignees>>), ApiError> {
    if payload.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Task title is required".to_string()));
    }
    let orchestrator = deployment.orchestrator();
    orchestrator
        .check_agents_owned(&payload.assignee_ids, user.user_id)
        .await?;

    let pool = &deployment.db().pool;
    let task = Task::create(pool, project.id, &payload).await?;
    tracing::info!(
        task_id = %task.id,
        project_id = %project.id,
        assignees = payload.assignee_ids.len(),
        "Created task '{}'",
        task.title
    );
    orchestrator.hooks().publish_task_created(TaskCreated {
        task_id: task.id,
        project_id: project.id,
        owner_id: user.user_id,
    });

    let task = task.with_assignees(pool).await?;
    Ok((StatusCode::CREATED, ResponseJson(ApiResponse::success(task))))
}

pub async fn get_task(
    Extension(task): Extension<Task>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<TaskWithAssignees>>, ApiError> {
    let task = task.with_assignees(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn update_task(
    Extension(user): Extension<AuthUser>,
    Extension(task): Extension<Task>,
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<UpdateTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    if payload
        .title
        .as_deref()
        .is_some_and(|title| title.trim().is_empty())
    {
        return Err(ApiError::BadRequest("Task title cannot be empty".to_string()));
    }
    let task = deployment
        .orchestrator()
        .update_task(task.id, user.user_id, payload)
        .await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

#[derive(Debug, Deserialize, TS)]
pub struct SetAssignees {
    pub assignee_ids: Vec<Uuid>,
}

pub async fn set_task_assignees(
    Extension(user): Extension<AuthUser>,
    Extension(task): Extension<Task>,
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<SetAssignees>,
) -> Result<ResponseJson<ApiResponse<Vec<Agent>>>, ApiError> {
    let assignees = deployment
        .orchestrator()
        .set_assignees(task.id, user.user_id, &payload.assignee_ids)
        .await?;
    Ok(ResponseJson(ApiResponse::success(assignees)))
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    let task_id_router = Router::new()
        .route("/", get(get_task).put(update_task))
        .route("/assignees", put(set_task_assignees))
        .layer(from_fn_with_state(deployment.clone(), load_task_middleware));

    Router::new().nest("/tasks/{task_id}", task_id_router)
}
