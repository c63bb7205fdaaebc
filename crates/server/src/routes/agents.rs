use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::get,
};
use db::models::agent::{Agent, CreateAgent};
use deployment::Deployment;
use utils::response::ApiResponse;

use crate::{
    DeploymentImpl,
    error::ApiError,
    middleware::{AuthUser, load_agent_middleware},
};

pub async fn get_agents(
    Extension(user): Extension<AuthUser>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<Agent>>>, ApiError> {
    let agents = Agent::find_by_owner(&deployment.db().pool, user.user_id).await?;
    Ok(ResponseJson(ApiResponse::success(agents)))
}

pub async fn get_agent(
    Extension(agent): Extension<Agent>,
) -> Result<ResponseJson<ApiResponse<Agent>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(agent)))
}

pub async fn create_agent(
    Extension(user): Extension<AuthUser>,
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<CreateAgent>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<Agent>>), ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Agent name is required".to_string()));
    }
    let agent = Agent::create(&deployment.db().pool, &payload, user.user_id).await?;
    Ok((StatusCode::CREATED, ResponseJson(ApiResponse::success(agent))))
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    let agent_id_router = Router::new()
        .route("/", get(get_agent))
        .layer(from_fn_with_state(deployment.clone(), load_agent_middleware));

    let agents_router = Router::new()
        .route("/", get(get_agents).post(create_agent))
        .nest("/{agent_id}", agent_id_router);

    Router::new().nest("/agents", agents_router)
}
