use std::sync::Arc;

use db::{
    DBService,
    models::{
        agent::Agent,
        task::{Task, TaskStatus, UpdateTask},
    },
};
use executors::Reasoner;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    broadcast::BroadcastGateway,
    config::Config,
    execution::{ExecutionRegistry, ExecutionSummary, StateMachineError, TaskStateMachine},
    gatekeeper::{RunAccepted, RunGatekeeper, RunRequestError},
    hooks::{self, HookBus},
    memory::{CompressionPolicy, MemoryManager},
    runner::{ExecutionRunner, RunLimits},
    sandbox::{SandboxManager, SandboxProvider},
};

/// Wires the execution core together and exposes the operations the HTTP
/// layer needs.
#[derive(Clone)]
pub struct Orchestrator {
    db: DBService,
    gateway: BroadcastGateway,
    registry: ExecutionRegistry,
    state_machine: TaskStateMachine,
    sandboxes: SandboxManager,
    gatekeeper: RunGatekeeper,
    hooks: HookBus,
    auto_run_on_create: bool,
}

impl Orchestrator {
    pub fn new(
        db: DBService,
        gateway: BroadcastGateway,
        provider: Arc<dyn SandboxProvider>,
        reasoner: Arc<dyn Reasoner>,
        config: &Config,
    ) -> Self {
        let registry = ExecutionRegistry::new();
        let state_machine = TaskStateMachine::new(db.clone(), gateway.clone());
        let sandboxes = SandboxManager::new(provider);
        let hooks = HookBus::new();
        let runner = ExecutionRunner::new(
            gateway.clone(),
            registry.clone(),
            state_machine.clone(),
            sandboxes.clone(),
            MemoryManager::new(db.clone(), CompressionPolicy::from(&config.memory)),
            reasoner,
            hooks.clone(),
            RunLimits::from(&config.orchestrator),
        );
        let gatekeeper = RunGatekeeper::new(
            db.clone(),
            registry.clone(),
            state_machine.clone(),
            runner,
        );
        Self {
            db,
            gateway,
            registry,
            state_machine,
            sandboxes,
            gatekeeper,
            hooks,
            auto_run_on_create: config.orchestrator.auto_run_on_create,
        }
    }

    pub fn gateway(&self) -> &BroadcastGateway {
        &self.gateway
    }

    pub fn hooks(&self) -> &HookBus {
        &self.hooks
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    pub async fn request_run(
        &self,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<RunAccepted, RunRequestError> {
        self.gatekeeper.request_run(task_id, user_id).await
    }

    /// COMPLETED | FAILED -> PENDING so the task can be run again.
    pub async fn reset_task(&self, task_id: Uuid, user_id: Uuid) -> Result<Task, RunRequestError> {
        let executions = self.registry.lock().await;
        let mut task = Task::find_owned(&self.db.pool, task_id, user_id)
            .await?
            .ok_or(RunRequestError::NotFound)?;
        if task.status == TaskStatus::InProgress
            || executions.values().any(|execution| execution.task_id == task.id)
        {
            return Err(RunRequestError::AlreadyRunning);
        }
        if task.status == TaskStatus::Pending {
            return Err(RunRequestError::AlreadyPending);
        }
        self.state_machine.reset(&task).await?;
        drop(executions);

        task.status = TaskStatus::Pending;
        Ok(task)
    }

    /// Edit title, description or status of a task that is not running.
    pub async fn update_task(
        &self,
        task_id: Uuid,
        user_id: Uuid,
        update: UpdateTask,
    ) -> Result<Task, RunRequestError> {
        let executions = self.registry.lock().await;
        let existing = Task::find_owned(&self.db.pool, task_id, user_id)
            .await?
            .ok_or(RunRequestError::NotFound)?;
        if existing.status == TaskStatus::InProgress
            || executions.values().any(|execution| execution.task_id == existing.id)
        {
            return Err(RunRequestError::AlreadyRunning);
        }
        let status = update.status.unwrap_or(existing.status);
        if status == TaskStatus::InProgress {
            return Err(RunRequestError::StatusNotEditable(status));
        }

        let title = update.title.unwrap_or_else(|| existing.title.clone());
        let description = update.description.or_else(|| existing.description.clone());
        let task = Task::update(
            &self.db.pool,
            existing.id,
            &title,
            description.as_deref(),
            status,
        )
        .await?;
        drop(executions);

        if task.status != existing.status {
            tracing::info!(task_id = %task.id, from = %existing.status, to = %task.status, "Task status edited");
            self.state_machine.announce(&task, task.status, None);
        }
        Ok(task)
    }

    /// Fail with `UnknownAgent` unless every id names an agent of `owner_id`.
    pub async fn check_agents_owned(
        &self,
        agent_ids: &[Uuid],
        owner_id: Uuid,
    ) -> Result<Vec<Agent>, RunRequestError> {
        let mut agents = Vec::with_capacity(agent_ids.len());
        for agent_id in agent_ids {
            let agent = Agent::find_owned(&self.db.pool, *agent_id, owner_id)
                .await?
                .ok_or(RunRequestError::UnknownAgent(*agent_id))?;
            agents.push(agent);
        }
        Ok(agents)
    }

    /// Replace the ordered assignee set. Refused while the task runs.
    pub async fn set_assignees(
        &self,
        task_id: Uuid,
        user_id: Uuid,
        agent_ids: &[Uuid],
    ) -> Result<Vec<Agent>, RunRequestError> {
        self.check_agents_owned(agent_ids, user_id).await?;
        let executions = self.registry.lock().await;
        let task = Task::find_owned(&self.db.pool, task_id, user_id)
            .await?
            .ok_or(RunRequestError::NotFound)?;
        if task.status == TaskStatus::InProgress
            || executions.values().any(|execution| execution.task_id == task.id)
        {
            return Err(RunRequestError::AlreadyRunning);
        }
        Task::set_assignees(&self.db.pool, task.id, agent_ids).await?;
        drop(executions);
        Ok(Task::assignees(&self.db.pool, task.id).await?)
    }

    pub async fn active_executions(&self, owner_id: Uuid) -> Vec<ExecutionSummary> {
        self.registry.for_owner(owner_id).await
    }

    /// Fail tasks left IN_PROGRESS by a previous process. Returns how many.
    pub async fn recover_orphans(&self) -> Result<usize, StateMachineError> {
        let executions = self.registry.lock().await;
        let stuck = Task::find_by_status(&self.db.pool, TaskStatus::InProgress).await?;
        let mut recovered = 0;
        for task in stuck {
            if executions.values().any(|execution| execution.task_id == task.id) {
                continue;
            }
            match self.state_machine.finish(&task, TaskStatus::Failed, None).await {
                Ok(()) => {
                    tracing::warn!(task_id = %task.id, "Failed task orphaned by a previous run");
                    recovered += 1;
                }
                Err(StateMachineError::Stale { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    pub fn start_listeners(&self) -> Vec<JoinHandle<()>> {
        let mut listeners = vec![hooks::spawn_reputation_listener(self.db.clone(), &self.hooks)];
        if self.auto_run_on_create {
            tracing::info!("Auto-run on task creation enabled");
            listeners.push(hooks::spawn_auto_run_listener(
                self.gatekeeper.clone(),
                &self.hooks,
            ));
        }
        listeners
    }

    /// Tear down every live sandbox and fail the runs that were interrupted.
    pub async fn shutdown(&self) {
        let destroyed = self.sandboxes.destroy_all().await;
        let interrupted = self.registry.snapshot().await;
        tracing::info!(
            sandboxes = destroyed,
            executions = interrupted.len(),
            "Shutting down orchestrator"
        );
        for execution in interrupted {
            let task = match Task::find_by_id(&self.db.pool, execution.task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(task_id = %execution.task_id, "Failed to load interrupted task: {}", e);
                    continue;
                }
            };
            match self.state_machine.finish(&task, TaskStatus::Failed, None).await {
                Ok(()) | Err(StateMachineError::Stale { .. }) => {}
                Err(e) => {
                    tracing::error!(task_id = %task.id, "Failed to fail interrupted task: {}", e)
                }
            }
            self.registry.remove(&execution.id).await;
        }
    }
}
