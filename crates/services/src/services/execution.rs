use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{
        agent::Agent,
        task::{Task, TaskStatus},
    },
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use ts_rs::TS;
use utils::text::random_suffix;
use uuid::Uuid;

use super::broadcast::{BroadcastGateway, TaskStatusUpdate};

const EXECUTION_SUFFIX_LEN: usize = 9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Accepted,
    Provisioning,
    Running,
    Finalizing,
}

/// A run in flight. Lives only in the registry, never in the database.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: String,
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub owner_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub phase: ExecutionPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub phase: ExecutionPhase,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            task_id: execution.task_id,
            project_id: execution.project_id,
            started_at: execution.started_at,
            phase: execution.phase,
        }
    }
}

/// `exec_<unix-ms>_<lowercase alphanumeric>`.
pub fn new_execution_id() -> String {
    format!(
        "exec_{}_{}",
        Utc::now().timestamp_millis(),
        random_suffix(EXECUTION_SUFFIX_LEN)
    )
}

pub type ExecutionMap = HashMap<String, Execution>;

/// Active executions keyed by execution id.
///
/// The mutex doubles as the admission lock: run requests, resets and edits
/// hold it across their status check and compare-and-set.
#[derive(Clone, Default)]
pub struct ExecutionRegistry {
    inner: Arc<Mutex<ExecutionMap>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, ExecutionMap> {
        self.inner.lock().await
    }

    /// Mint an id not used by any active execution.
    pub fn mint_id(executions: &ExecutionMap) -> String {
        loop {
            let id = new_execution_id();
            if !executions.contains_key(&id) {
                return id;
            }
        }
    }

    pub async fn set_phase(&self, execution_id: &str, phase: ExecutionPhase) {
        if let Some(execution) = self.inner.lock().await.get_mut(execution_id) {
            execution.phase = phase;
        }
    }

    pub async fn remove(&self, execution_id: &str) -> Option<Execution> {
        self.inner.lock().await.remove(execution_id)
    }

    pub async fn for_owner(&self, owner_id: Uuid) -> Vec<ExecutionSummary> {
        let mut summaries: Vec<ExecutionSummary> = self
            .inner
            .lock()
            .await
            .values()
            .filter(|execution| execution.owner_id == owner_id)
            .map(ExecutionSummary::from)
            .collect();
        summaries.sort_by_key(|summary| summary.started_at);
        summaries
    }

    pub async fn snapshot(&self) -> Vec<Execution> {
        self.inner.lock().await.values().cloned().collect()
    }

    pub async fn is_task_active(&self, task_id: Uuid) -> bool {
        self.inner
            .lock()
            .await
            .values()
            .any(|execution| execution.task_id == task_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Transition {from} -> {to} is not allowed")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("Task {task_id} is no longer {expected}")]
    Stale { task_id: Uuid, expected: TaskStatus },
}

/// Owns task run status. Each successful transition emits exactly one
/// `taskStatusUpdate` to the task's project room.
#[derive(Clone)]
pub struct TaskStateMachine {
    db: DBService,
    gateway: BroadcastGateway,
}

impl TaskStateMachine {
    pub fn new(db: DBService, gateway: BroadcastGateway) -> Self {
        Self { db, gateway }
    }

    pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Completed, Pending)
                | (Failed, Pending)
        )
    }

    async fn transition(
        &self,
        task: &Task,
        from: TaskStatus,
        to: TaskStatus,
        actor: Option<&Agent>,
    ) -> Result<(), StateMachineError> {
        if !Self::is_allowed(from, to) {
            return Err(StateMachineError::InvalidTransition { from, to });
        }
        let won = Task::compare_and_set_status(&self.db.pool, task.id, from, to).await?;
        if !won {
            return Err(StateMachineError::Stale {
                task_id: task.id,
                expected: from,
            });
        }
        tracing::info!(task_id = %task.id, %from, %to, "Task status changed");
        self.announce(task, to, actor);
        Ok(())
    }

    pub fn announce(&self, task: &Task, status: TaskStatus, actor: Option<&Agent>) {
        self.gateway.emit_status(
            task.project_id,
            TaskStatusUpdate {
                task_id: task.id,
                new_status: status,
                agent_id: actor.map(|agent| agent.id),
                agent_name: actor.map(|agent| agent.name.clone()),
            },
        );
    }

    /// PENDING -> IN_PROGRESS. The single point that admits a run.
    pub async fn begin(&self, task: &Task, actor: Option<&Agent>) -> Result<(), StateMachineError> {
        self.transition(task, TaskStatus::Pending, TaskStatus::InProgress, actor)
            .await
    }

    /// IN_PROGRESS -> COMPLETED | FAILED.
    pub async fn finish(
        &self,
        task: &Task,
        outcome: TaskStatus,
        actor: Option<&Agent>,
    ) -> Result<(), StateMachineError> {
        self.transition(task, TaskStatus::InProgress, outcome, actor)
            .await
    }

    /// COMPLETED | FAILED -> PENDING, the explicit reset before a re-run.
    pub async fn reset(&self, task: &Task) -> Result<(), StateMachineError> {
        self.transition(task, task.status, TaskStatus::Pending, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use db::models::{
        project::{CreateProject, Project},
        task::CreateTask,
    };
    use regex::Regex;

    use super::*;
    use crate::services::broadcast::ServerEvent;

    async fn seeded_task(db: &DBService) -> Task {
        let project = Project::create(
            &db.pool,
            &CreateProject {
                name: "p".into(),
                description: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        Task::create(
            &db.pool,
            project.id,
            &CreateTask {
                title: "t".into(),
                description: None,
                assignee_ids: vec![],
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn execution_ids_have_expected_shape() {
        let pattern = Regex::new(r"^exec_\d+_[a-z0-9]+$").unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let id = new_execution_id();
            assert!(pattern.is_match(&id), "{id}");
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn terminal_states_only_leave_through_reset() {
        use TaskStatus::*;
        assert!(TaskStateMachine::is_allowed(Pending, InProgress));
        assert!(!TaskStateMachine::is_allowed(Pending, Completed));
        assert!(!TaskStateMachine::is_allowed(Completed, InProgress));
        assert!(!TaskStateMachine::is_allowed(Failed, InProgress));
        assert!(!TaskStateMachine::is_allowed(Failed, Completed));
        assert!(TaskStateMachine::is_allowed(Failed, Pending));
    }

    #[tokio::test]
    async fn each_transition_emits_one_status_event() {
        let db = DBService::new_in_memory().await.unwrap();
        let gateway = BroadcastGateway::new();
        let machine = TaskStateMachine::new(db.clone(), gateway.clone());
        let task = seeded_task(&db).await;

        let (handle, mut rx) = gateway.connect(None);
        gateway.join(&handle, &task.project_id.to_string());
        rx.recv().await.unwrap();

        machine.begin(&task, None).await.unwrap();
        assert!(matches!(
            machine.begin(&task, None).await,
            Err(StateMachineError::Stale { .. })
        ));
        machine.finish(&task, TaskStatus::Failed, None).await.unwrap();
        assert!(matches!(
            machine.finish(&task, TaskStatus::Completed, None).await,
            Err(StateMachineError::Stale { .. })
        ));

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::TaskStatusUpdate(update) = event {
                statuses.push(update.new_status);
            }
        }
        assert_eq!(statuses, vec![TaskStatus::InProgress, TaskStatus::Failed]);
    }

    #[tokio::test]
    async fn registry_filters_by_owner() {
        let registry = ExecutionRegistry::new();
        let owner = Uuid::new_v4();
        {
            let mut executions = registry.lock().await;
            for owner_id in [owner, Uuid::new_v4()] {
                let id = ExecutionRegistry::mint_id(&executions);
                executions.insert(
                    id.clone(),
                    Execution {
                        id,
                        task_id: Uuid::new_v4(),
                        project_id: Uuid::new_v4(),
                        owner_id,
                        started_at: Utc::now(),
                        phase: ExecutionPhase::Accepted,
                    },
                );
            }
        }
        let mine = registry.for_owner(owner).await;
        assert_eq!(mine.len(), 1);
        registry
            .set_phase(&mine[0].execution_id, ExecutionPhase::Running)
            .await;
        assert_eq!(registry.for_owner(owner).await[0].phase, ExecutionPhase::Running);
        assert!(registry.remove(&mine[0].execution_id).await.is_some());
        assert_eq!(registry.len().await, 1);
    }
}
