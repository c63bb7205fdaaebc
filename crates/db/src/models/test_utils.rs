use sqlx::SqlitePool;
use uuid::Uuid;

use super::{
    agent::{Agent, CreateAgent},
    project::{CreateProject, Project},
};
use crate::DBService;

pub(crate) async fn setup_test_pool() -> SqlitePool {
    DBService::new_in_memory()
        .await
        .expect("failed to open sqlite memory db")
        .pool
}

pub(crate) async fn create_project(pool: &SqlitePool, owner_id: Uuid) -> Project {
    Project::create(
        pool,
        &CreateProject {
            name: "test project".into(),
            description: None,
        },
        owner_id,
    )
    .await
    .expect("failed to create project")
}

pub(crate) async fn create_agent(pool: &SqlitePool, owner_id: Uuid, name: &str) -> Agent {
    Agent::create(
        pool,
        &CreateAgent {
            name: name.to_string(),
            role: Some("engineer".into()),
            description: None,
        },
        owner_id,
    )
    .await
    .expect("failed to create agent")
}
