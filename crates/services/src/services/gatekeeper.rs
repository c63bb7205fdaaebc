use chrono::Utc;
use db::{
    DBService,
    models::task::{Task, TaskStatus},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use super::{
    execution::{Execution, ExecutionPhase, ExecutionRegistry, StateMachineError, TaskStateMachine},
    runner::{ExecutionJob, ExecutionRunner},
};

#[derive(Debug, Error)]
pub enum RunRequestError {
    #[error("Task not found")]
    NotFound,
    #[error("Task has no assignees")]
    NoAssignees,
    #[error("Task is already completed")]
    AlreadyCompleted,
    #[error("Task is already running")]
    AlreadyRunning,
    #[error("Task has failed; reset it to PENDING before running it again")]
    ResetRequired,
    #[error("Task is already pending")]
    AlreadyPending,
    #[error("Status {0} cannot be set directly")]
    StatusNotEditable(TaskStatus),
    #[error("Agent {0} not found")]
    UnknownAgent(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

/// Body of an accepted run request.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub message: String,
    pub task_id: Uuid,
    pub execution_id: String,
    pub status: String,
}

/// Admits run requests. Returns as soon as the task is IN_PROGRESS; the run
/// itself continues on its own tokio task.
#[derive(Clone)]
pub struct RunGatekeeper {
    db: DBService,
    registry: ExecutionRegistry,
    state_machine: TaskStateMachine,
    runner: ExecutionRunner,
}

impl RunGatekeeper {
    pub fn new(
        db: DBService,
        registry: ExecutionRegistry,
        state_machine: TaskStateMachine,
        runner: ExecutionRunner,
    ) -> Self {
        Self {
            db,
            registry,
            state_machine,
            runner,
        }
    }

    pub async fn request_run(
        &self,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<RunAccepted, RunRequestError> {
        let pool = &self.db.pool;
        let task = Task::find_owned(pool, task_id, user_id)
            .await?
            .ok_or(RunRequestError::NotFound)?;
        let assignees = Task::assignees(pool, task.id).await?;
        if assignees.is_empty() {
            return Err(RunRequestError::NoAssignees);
        }

        let mut executions = self.registry.lock().await;

        // Status may have moved while we waited for the lock
        let mut task = Task::find_by_id(pool, task.id)
            .await?
            .ok_or(RunRequestError::NotFound)?;
        match task.status {
            TaskStatus::Completed => return Err(RunRequestError::AlreadyCompleted),
            TaskStatus::InProgress => return Err(RunRequestError::AlreadyRunning),
            TaskStatus::Failed => return Err(RunRequestError::ResetRequired),
            TaskStatus::Pending => {}
        }
        if executions.values().any(|execution| execution.task_id == task.id) {
            return Err(RunRequestError::AlreadyRunning);
        }

        match self.state_machine.begin(&task, assignees.first()).await {
            Ok(()) => {}
            Err(StateMachineError::Stale { .. }) => return Err(RunRequestError::AlreadyRunning),
            Err(e) => return Err(e.into()),
        }
        task.status = TaskStatus::InProgress;

        let execution_id = ExecutionRegistry::mint_id(&executions);
        executions.insert(
            execution_id.clone(),
            Execution {
                id: execution_id.clone(),
                task_id: task.id,
                project_id: task.project_id,
                owner_id: user_id,
                started_at: Utc::now(),
                phase: ExecutionPhase::Accepted,
            },
        );
        drop(executions);

        tracing::info!(%execution_id, task_id = %task.id, "Run accepted");

        let task_id = task.id;
        self.runner.spawn(ExecutionJob {
            execution_id: execution_id.clone(),
            task,
            assignees,
        });

        Ok(RunAccepted {
            message: "Task execution initiated".to_string(),
            task_id,
            execution_id,
            status: "initiated".to_string(),
        })
    }
}
