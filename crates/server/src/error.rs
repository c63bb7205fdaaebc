use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use deployment::DeploymentError;
use executors::ExecutorError;
use services::services::{
    auth::AuthError, config::ConfigError, execution::StateMachineError,
    gatekeeper::RunRequestError, memory::MemoryError, sandbox::SandboxError,
};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error, ts_rs::TS)]
#[ts(type = "string")]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl From<RunRequestError> for ApiError {
    fn from(err: RunRequestError) -> Self {
        match err {
            RunRequestError::NotFound => ApiError::NotFound(err.to_string()),
            RunRequestError::AlreadyRunning => ApiError::Conflict(err.to_string()),
            RunRequestError::NoAssignees
            | RunRequestError::AlreadyCompleted
            | RunRequestError::ResetRequired
            | RunRequestError::AlreadyPending
            | RunRequestError::StatusNotEditable(_)
            | RunRequestError::UnknownAgent(_) => ApiError::BadRequest(err.to_string()),
            RunRequestError::Database(e) => ApiError::Database(e),
            RunRequestError::StateMachine(e) => ApiError::StateMachine(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::Auth(AuthError::MissingToken | AuthError::InvalidToken(_)) => {
                (StatusCode::UNAUTHORIZED, "AuthError")
            }
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Sandbox(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SandboxError"),
            ApiError::Executor(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ExecutorError"),
            ApiError::Memory(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MemoryError"),
            ApiError::StateMachine(StateMachineError::Stale { .. }) => {
                (StatusCode::CONFLICT, "StateMachineError")
            }
            ApiError::StateMachine(_) => (StatusCode::INTERNAL_SERVER_ERROR, "StateMachineError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IoError"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "ConflictError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        if status_code.is_server_error() {
            tracing::error!("{}: {}", error_type, self);
        }

        let error_message = match &self {
            ApiError::Conflict(msg)
            | ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::InternalError(msg) => msg.clone(),
            ApiError::Auth(e) => e.to_string(),
            ApiError::StateMachine(e @ StateMachineError::Stale { .. }) => e.to_string(),
            _ => format!("{}: {}", error_type, self),
        };
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
