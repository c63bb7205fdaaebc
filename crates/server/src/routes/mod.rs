use axum::{
    Router, middleware,
    routing::{IntoMakeService, get},
};
use tower_http::cors::CorsLayer;

use crate::{DeploymentImpl, middleware as app_middleware};

pub mod agents;
pub mod health;
pub mod orchestrator;
pub mod projects;
pub mod realtime;
pub mod tasks;

pub fn app(deployment: DeploymentImpl) -> Router {
    // Everything except health and the socket requires a bearer token
    let protected_routes = Router::new()
        .merge(projects::router(&deployment))
        .merge(agents::router(&deployment))
        .merge(tasks::router(&deployment))
        .merge(orchestrator::router())
        .layer(middleware::from_fn_with_state(
            deployment.clone(),
            app_middleware::require_auth,
        ));

    let base_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(protected_routes)
        .with_state(deployment.clone());

    Router::new()
        .nest("/api", base_routes)
        .route("/ws", get(realtime::realtime_ws))
        .with_state(deployment)
        .layer(middleware::from_fn(app_middleware::request_id_middleware))
        .layer(CorsLayer::permissive())
}

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    app(deployment).into_make_service()
}
