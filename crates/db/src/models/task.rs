use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool, Type};
use ts_rs::TS;
use uuid::Uuid;

use super::{agent::Agent, project::Project};

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[sqlx(type_name = "task_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid, // Foreign key to Project
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct TaskWithAssignees {
    #[serde(flatten)]
    #[ts(flatten)]
    pub task: Task,
    pub assignees: Vec<Agent>,
}

impl std::ops::Deref for TaskWithAssignees {
    type Target = Task;
    fn deref(&self) -> &Self::Target {
        &self.task
    }
}

#[derive(Debug, Deserialize, TS)]
pub struct CreateTask {
    pub title: String,
    pub description: Option<String>,
    /// Ordered; the first assignee is the primary acting agent.
    #[serde(default)]
    pub assignee_ids: Vec<Uuid>,
}

#[derive(Debug, Default, Deserialize, TS)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
}

impl Task {
    pub fn to_prompt(&self) -> String {
        if let Some(description) = &self.description {
            format!("Title: {}\n\nDescription:\n{}", &self.title, description)
        } else {
            self.title.clone()
        }
    }

    pub async fn parent_project(&self, pool: &SqlitePool) -> Result<Option<Project>, sqlx::Error> {
        Project::find_by_id(pool, self.project_id).await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(r#"SELECT * FROM tasks WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Task lookup restricted to projects owned by `owner_id`.
    pub async fn find_owned(
        pool: &SqlitePool,
        id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT t.*
            FROM tasks t
            JOIN projects p ON p.id = t.project_id
            WHERE t.id = ?1 AND p.owner_id = ?2
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_project_id(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"SELECT * FROM tasks WHERE project_id = ?1 ORDER BY created_at ASC"#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_status(
        pool: &SqlitePool,
        status: TaskStatus,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(r#"SELECT * FROM tasks WHERE status = ?1"#)
            .bind(status)
            .fetch_all(pool)
            .await
    }

    pub async fn create(
        pool: &SqlitePool,
        project_id: Uuid,
        data: &CreateTask,
    ) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let now = Utc::now();
        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (id, project_id, title, description, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(TaskStatus::Pending)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        insert_assignees(&mut *tx, task.id, &data.assignee_ids).await?;
        tx.commit().await?;
        Ok(task)
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        title: &str,
        description: Option<&str>,
        status: TaskStatus,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET title = ?2, description = ?3, status = ?4, updated_at = ?5
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(description)
        .bind(status)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(r#"UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1"#)
            .bind(id)
            .bind(status)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Move the task from `from` to `to` only if it is still in `from`.
    /// Returns whether this call performed the transition.
    pub async fn compare_and_set_status(
        pool: &SqlitePool,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE tasks SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2"#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Assigned agents in assignment order.
    pub async fn assignees(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Agent>, sqlx::Error> {
        sqlx::query_as::<_, Agent>(
            r#"
            SELECT a.*
            FROM agents a
            JOIN task_assignees ta ON ta.agent_id = a.id
            WHERE ta.task_id = ?1
            ORDER BY ta.position ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    pub async fn set_assignees(
        pool: &SqlitePool,
        task_id: Uuid,
        agent_ids: &[Uuid],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query(r#"DELETE FROM task_assignees WHERE task_id = ?1"#)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        insert_assignees(&mut *tx, task_id, agent_ids).await?;
        tx.commit().await
    }

    pub async fn with_assignees(self, pool: &SqlitePool) -> Result<TaskWithAssignees, sqlx::Error> {
        let assignees = Task::assignees(pool, self.id).await?;
        Ok(TaskWithAssignees {
            task: self,
            assignees,
        })
    }
}

async fn insert_assignees(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    agent_ids: &[Uuid],
) -> Result<(), sqlx::Error> {
    let mut seen = Vec::with_capacity(agent_ids.len());
    for agent_id in agent_ids {
        // Duplicates keep their first position
        if seen.contains(agent_id) {
            continue;
        }
        sqlx::query(r#"INSERT INTO task_assignees (task_id, agent_id, position) VALUES (?1, ?2, ?3)"#)
            .bind(task_id)
            .bind(agent_id)
            .bind(seen.len() as i64)
            .execute(&mut *conn)
            .await?;
        seen.push(*agent_id);
    }
    Ok(())
}
