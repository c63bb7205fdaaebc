#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use db::{
    DBService,
    models::{
        agent::{Agent, CreateAgent},
        project::{CreateProject, Project},
        task::{CreateTask, Task, TaskStatus},
    },
};
use deployment::Deployment;
use executors::{
    AgentEnvironment, CommandOutput, ExecutorError, Reasoner, StepContext, StepOutcome,
};
use serde_json::Value;
use server::{DeploymentImpl, routes};
use services::services::{
    auth::AuthService,
    config::Config,
    sandbox::{Sandbox, SandboxError, SandboxProvider},
};
use tokio::sync::Semaphore;
use tower::ServiceExt;
use uuid::Uuid;

#[derive(Default)]
pub struct CountingProvider {
    pub fail: bool,
    pub provisioned: AtomicUsize,
    pub destroyed: Arc<AtomicUsize>,
}

impl CountingProvider {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

pub struct CountingSandbox {
    execution_id: String,
    destroyed: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentEnvironment for CountingSandbox {
    fn id(&self) -> &str {
        &self.execution_id
    }

    async fn run_command(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, ExecutorError> {
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: format!("ran {command}"),
            stderr: String::new(),
        })
    }
}

#[async_trait]
impl Sandbox for CountingSandbox {
    fn execution_id(&self) -> &str {
        &self.execution_id
    }

    fn describe(&self) -> String {
        format!("counting sandbox {}", self.execution_id)
    }

    fn as_environment(&self) -> &dyn AgentEnvironment {
        self
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for CountingProvider {
    fn kind(&self) -> &'static str {
        "counting"
    }

    async fn provision(&self, execution_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SandboxError::Unavailable(
                "container runtime unreachable".to_string(),
            ));
        }
        Ok(Arc::new(CountingSandbox {
            execution_id: execution_id.to_string(),
            destroyed: self.destroyed.clone(),
        }))
    }
}

/// Finishes each agent turn in one step, once the gate lets it through.
pub struct GatedReasoner {
    pub gate: Semaphore,
}

impl GatedReasoner {
    pub fn open() -> Self {
        Self {
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
        }
    }

    pub fn closed() -> Self {
        Self {
            gate: Semaphore::new(0),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1_000);
    }
}

#[async_trait]
impl Reasoner for GatedReasoner {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn next_step(
        &self,
        ctx: &StepContext<'_>,
        env: &dyn AgentEnvironment,
    ) -> Result<StepOutcome, ExecutorError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;
        let output = env.run_command("ls", ctx.command_timeout).await?;
        Ok(StepOutcome::finished("ls", output.combined()))
    }
}

pub struct TestApp {
    pub deployment: DeploymentImpl,
    pub router: Router,
    pub provider: Arc<CountingProvider>,
    pub reasoner: Arc<GatedReasoner>,
}

impl TestApp {
    pub async fn new(provider: CountingProvider, reasoner: GatedReasoner) -> Self {
        Self::with_config(provider, reasoner, Config::default()).await
    }

    pub async fn with_config(
        provider: CountingProvider,
        reasoner: GatedReasoner,
        config: Config,
    ) -> Self {
        let db = DBService::new_in_memory().await.unwrap();
        let provider = Arc::new(provider);
        let reasoner = Arc::new(reasoner);
        let deployment = DeploymentImpl::from_parts(
            db,
            config,
            AuthService::new("integration-secret", 3600),
            provider.clone(),
            reasoner.clone(),
        );
        let router = routes::app(deployment.clone());
        Self {
            deployment,
            router,
            provider,
            reasoner,
        }
    }

    pub fn token(&self, user_id: Uuid) -> String {
        self.deployment.auth().issue(user_id).unwrap()
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user_id: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user_id {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.token(user_id)),
            );
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn run(&self, task_id: impl std::fmt::Display, user_id: Uuid) -> (StatusCode, Value) {
        self.request(
            Method::POST,
            &format!("/api/orchestrator/tasks/{task_id}/run"),
            Some(user_id),
            None,
        )
        .await
    }

    /// A project owned by `owner` with one task assigned to `agents` fresh agents.
    pub async fn seed(&self, owner: Uuid, agents: usize) -> (Project, Task) {
        let pool = &self.deployment.db().pool;
        let project = Project::create(
            pool,
            &CreateProject {
                name: "Launch".into(),
                description: None,
            },
            owner,
        )
        .await
        .unwrap();
        let mut assignee_ids = Vec::new();
        for i in 0..agents {
            let agent = Agent::create(
                pool,
                &CreateAgent {
                    name: format!("agent-{i}"),
                    role: Some("engineer".into()),
                    description: None,
                },
                owner,
            )
            .await
            .unwrap();
            assignee_ids.push(agent.id);
        }
        let task = Task::create(
            pool,
            project.id,
            &CreateTask {
                title: "Write release notes".into(),
                description: Some("Summarize the changes".into()),
                assignee_ids,
            },
        )
        .await
        .unwrap();
        (project, task)
    }

    /// Waits for `status` and for the run holding the task, if any, to unregister.
    pub async fn wait_for_status(&self, task_id: Uuid, status: TaskStatus) {
        let registry = self.deployment.orchestrator().registry();
        for _ in 0..300 {
            let task = Task::find_by_id(&self.deployment.db().pool, task_id)
                .await
                .unwrap()
                .unwrap();
            if task.status == status && !registry.is_task_active(task_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status}");
    }
}
