use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use executors::{
    Reasoner,
    llm::{LlmReasoner, LlmReasonerConfig},
    planning::PlanningReasoner,
};
use services::services::{
    auth::AuthService,
    broadcast::BroadcastGateway,
    config::{Config, ReasonerKind, SandboxKind, load_config_from_file, save_config_to_file},
    orchestrator::Orchestrator,
    sandbox::SandboxProvider,
};
use utils::assets::{config_path, sandbox_root};

use crate::container::{DockerSandboxProvider, WorkspaceSandboxProvider};

mod command;
pub mod container;

#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<Config>,
    db: DBService,
    auth: AuthService,
    orchestrator: Orchestrator,
}

impl LocalDeployment {
    /// Assemble a deployment from prepared parts. Used by `new` and by tests
    /// that bring their own database, sandbox provider and reasoner.
    pub fn from_parts(
        db: DBService,
        config: Config,
        auth: AuthService,
        provider: Arc<dyn SandboxProvider>,
        reasoner: Arc<dyn Reasoner>,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            db.clone(),
            BroadcastGateway::new(),
            provider,
            reasoner,
            &config,
        );
        Self {
            config: Arc::new(config),
            db,
            auth,
            orchestrator,
        }
    }
}

pub fn sandbox_provider(config: &Config) -> Arc<dyn SandboxProvider> {
    match config.sandbox.provider {
        SandboxKind::Workspace => {
            let root = config
                .sandbox
                .workspace_root
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(sandbox_root);
            tracing::info!("Using workspace sandboxes under {}", root.display());
            Arc::new(WorkspaceSandboxProvider::new(root))
        }
        SandboxKind::Docker => {
            tracing::info!("Using docker sandboxes ({})", config.sandbox.docker_image);
            Arc::new(DockerSandboxProvider::from_config(&config.sandbox))
        }
    }
}

pub fn reasoner(config: &Config) -> Arc<dyn Reasoner> {
    match config.reasoner.kind {
        ReasonerKind::Planning => Arc::new(PlanningReasoner::new()),
        ReasonerKind::Llm => {
            let reasoner = &config.reasoner;
            let api_key = std::env::var(&reasoner.api_key_env)
                .ok()
                .filter(|key| !key.trim().is_empty());
            tracing::info!("Using LLM reasoner with model {}", reasoner.model);
            Arc::new(LlmReasoner::new(
                LlmReasonerConfig {
                    endpoint: reasoner.endpoint.clone(),
                    model: reasoner.model.clone(),
                    temperature: reasoner.temperature,
                    max_tokens: reasoner.max_tokens,
                },
                api_key,
            ))
        }
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let config = load_config_from_file(&config_path()).await;

        // Always save config so new fields appear with their defaults
        save_config_to_file(&config, &config_path()).await?;

        let db = DBService::new().await?;
        let auth = AuthService::from_config(&config.auth);
        let provider = sandbox_provider(&config);
        let reasoner = reasoner(&config);
        tracing::info!(
            sandbox = provider.kind(),
            reasoner = reasoner.name(),
            "Execution core configured"
        );

        Ok(Self::from_parts(db, config, auth, provider, reasoner))
    }

    fn config(&self) -> &Arc<Config> {
        &self.config
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn auth(&self) -> &AuthService {
        &self.auth
    }

    fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}
