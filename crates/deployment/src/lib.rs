use std::sync::Arc;

use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::DBService;
use executors::ExecutorError;
use services::services::{
    auth::{AuthError, AuthService},
    broadcast::BroadcastGateway,
    config::{Config, ConfigError},
    execution::StateMachineError,
    orchestrator::Orchestrator,
    sandbox::SandboxError,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn config(&self) -> &Arc<Config>;

    fn db(&self) -> &DBService;

    fn auth(&self) -> &AuthService;

    fn orchestrator(&self) -> &Orchestrator;

    fn gateway(&self) -> &BroadcastGateway {
        self.orchestrator().gateway()
    }

    /// Fail runs orphaned by a previous process, call at startup
    async fn cleanup_orphan_executions(&self) -> Result<(), DeploymentError> {
        let recovered = self.orchestrator().recover_orphans().await?;
        if recovered > 0 {
            tracing::info!("Marked {} orphaned task run(s) as failed", recovered);
        }
        Ok(())
    }

    fn spawn_listeners(&self) -> Vec<JoinHandle<()>> {
        self.orchestrator().start_listeners()
    }

    async fn shutdown(&self) {
        self.orchestrator().shutdown().await;
    }
}
