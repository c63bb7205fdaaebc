//! Lifecycle messages between the resource layer and the orchestrator.

use db::{
    DBService,
    models::{agent::Agent, task::TaskStatus},
};
use serde::Serialize;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use uuid::Uuid;

use super::gatekeeper::{RunGatekeeper, RunRequestError};

const HOOK_CAPACITY: usize = 128;

pub const XP_PER_COMPLETED_RUN: i64 = 10;
pub const XP_PER_FAILED_RUN: i64 = 1;

/// Published by the task endpoint after a task is stored.
#[derive(Debug, Clone)]
pub struct TaskCreated {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub owner_id: Uuid,
}

/// Published once per finished execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub execution_id: String,
    pub status: TaskStatus,
    pub agent_ids: Vec<Uuid>,
    pub steps: u32,
}

#[derive(Clone)]
pub struct HookBus {
    task_created: broadcast::Sender<TaskCreated>,
    outcomes: broadcast::Sender<ExecutionOutcome>,
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HookBus {
    pub fn new() -> Self {
        let (task_created, _) = broadcast::channel(HOOK_CAPACITY);
        let (outcomes, _) = broadcast::channel(HOOK_CAPACITY);
        Self {
            task_created,
            outcomes,
        }
    }

    pub fn publish_task_created(&self, message: TaskCreated) {
        if self.task_created.send(message).is_err() {
            tracing::debug!("No task-created listeners");
        }
    }

    pub fn subscribe_task_created(&self) -> broadcast::Receiver<TaskCreated> {
        self.task_created.subscribe()
    }

    pub fn publish_outcome(&self, outcome: ExecutionOutcome) {
        if self.outcomes.send(outcome).is_err() {
            tracing::debug!("No execution-outcome listeners");
        }
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<ExecutionOutcome> {
        self.outcomes.subscribe()
    }
}

/// Credit assignees of every finished run.
pub fn spawn_reputation_listener(db: DBService, hooks: &HookBus) -> JoinHandle<()> {
    let mut rx = hooks.subscribe_outcomes();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(outcome) => record_reputation(&db, &outcome).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Reputation listener lagged, outcomes lost");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn record_reputation(db: &DBService, outcome: &ExecutionOutcome) {
    let completed = outcome.status == TaskStatus::Completed;
    let experience = if completed {
        XP_PER_COMPLETED_RUN
    } else {
        XP_PER_FAILED_RUN
    };
    for agent_id in &outcome.agent_ids {
        if let Err(e) = Agent::record_outcome(&db.pool, *agent_id, completed, experience).await {
            tracing::error!(%agent_id, "Failed to record agent outcome: {}", e);
        }
    }
}

/// Start a run for every created task. Only spawned when auto-run is enabled.
pub fn spawn_auto_run_listener(gatekeeper: RunGatekeeper, hooks: &HookBus) -> JoinHandle<()> {
    let mut rx = hooks.subscribe_task_created();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(created) => match gatekeeper.request_run(created.task_id, created.owner_id).await {
                    Ok(accepted) => tracing::info!(
                        task_id = %created.task_id,
                        execution_id = %accepted.execution_id,
                        "Auto-started run for new task"
                    ),
                    Err(RunRequestError::NoAssignees) => {
                        tracing::debug!(task_id = %created.task_id, "New task has no assignees, not auto-running");
                    }
                    Err(e) => tracing::warn!(task_id = %created.task_id, "Auto-run refused: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Auto-run listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use db::models::agent::CreateAgent;

    use super::*;

    #[tokio::test]
    async fn reputation_listener_awards_experience() {
        let db = DBService::new_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let agent = Agent::create(
            &db.pool,
            &CreateAgent {
                name: "a".into(),
                role: None,
                description: None,
            },
            owner,
        )
        .await
        .unwrap();

        let hooks = HookBus::new();
        let listener = spawn_reputation_listener(db.clone(), &hooks);
        for status in [TaskStatus::Completed, TaskStatus::Failed] {
            hooks.publish_outcome(ExecutionOutcome {
                task_id: Uuid::new_v4(),
                project_id: Uuid::new_v4(),
                execution_id: "exec_1_x".into(),
                status,
                agent_ids: vec![agent.id],
                steps: 3,
            });
        }

        let mut stored = Agent::find_by_id(&db.pool, agent.id).await.unwrap().unwrap();
        for _ in 0..50 {
            if stored.tasks_completed + stored.tasks_failed == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            stored = Agent::find_by_id(&db.pool, agent.id).await.unwrap().unwrap();
        }
        assert_eq!(stored.tasks_completed, 1);
        assert_eq!(stored.tasks_failed, 1);
        assert_eq!(stored.experience_points, XP_PER_COMPLETED_RUN + XP_PER_FAILED_RUN);
        listener.abort();
    }
}
