use axum::{
    Extension,
    extract::{Path, Request, State},
    middleware::Next,
    response::Response,
};
use db::models::{agent::Agent, project::Project, task::Task};
use deployment::Deployment;
use uuid::Uuid;

use super::AuthUser;
use crate::{DeploymentImpl, error::ApiError};

/// Parse a path id, answering 400 instead of axum's plain-text rejection.
pub fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::BadRequest(format!("Invalid {what} id")))
}

pub async fn load_project_middleware(
    State(deployment): State<DeploymentImpl>,
    Extension(user): Extension<AuthUser>,
    Path(project_id): Path<String>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let project_id = parse_id(&project_id, "project")?;
    let project = Project::find_owned(&deployment.db().pool, project_id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Project not found".to_string()))?;
    request.extensions_mut().insert(project);
    Ok(next.run(request).await)
}

pub async fn load_task_middleware(
    State(deployment): State<DeploymentImpl>,
    Extension(user): Extension<AuthUser>,
    Path(task_id): Path<String>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let task_id = parse_id(&task_id, "task")?;
    let task = Task::find_owned(&deployment.db().pool, task_id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;
    request.extensions_mut().insert(task);
    Ok(next.run(request).await)
}

pub async fn load_agent_middleware(
    State(deployment): State<DeploymentImpl>,
    Extension(user): Extension<AuthUser>,
    Path(agent_id): Path<String>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let agent_id = parse_id(&agent_id, "agent")?;
    let agent = Agent::find_owned(&deployment.db().pool, agent_id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Agent not found".to_string()))?;
    request.extensions_mut().insert(agent);
    Ok(next.run(request).await)
}
