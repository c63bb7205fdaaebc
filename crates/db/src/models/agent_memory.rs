use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, types::Json};
use ts_rs::TS;
use uuid::Uuid;

/// One recorded action of an agent and what came back from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
pub struct MemoryStep {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub result: String,
    pub token_estimate: i64,
}

/// Working memory of one agent for one task.
///
/// `total_tokens` covers the steps currently retained, `cumulative_tokens`
/// everything ever recorded. `original_step_count` counts every step ever
/// appended, so after compression it is the denominator of
/// `compression_ratio`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AgentMemory {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub task_id: Uuid,
    pub global_goal: String,
    pub steps: Json<Vec<MemoryStep>>,
    pub total_tokens: i64,
    pub cumulative_tokens: i64,
    pub is_compressed: bool,
    pub compression_ratio: Option<f64>,
    pub original_step_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentMemory {
    pub async fn find(
        pool: &SqlitePool,
        agent_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, AgentMemory>(
            r#"SELECT * FROM agent_memories WHERE agent_id = ?1 AND task_id = ?2"#,
        )
        .bind(agent_id)
        .bind(task_id)
        .fetch_optional(pool)
        .await
    }

    /// Insert an empty memory unless one exists, then return the stored row.
    pub async fn create_if_missing(
        pool: &SqlitePool,
        agent_id: Uuid,
        task_id: Uuid,
        global_goal: &str,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO agent_memories (id, agent_id, task_id, global_goal, steps, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, '[]', ?5, ?5)
            ON CONFLICT (agent_id, task_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(agent_id)
        .bind(task_id)
        .bind(global_goal)
        .bind(now)
        .execute(pool)
        .await?;

        sqlx::query_as::<_, AgentMemory>(
            r#"SELECT * FROM agent_memories WHERE agent_id = ?1 AND task_id = ?2"#,
        )
        .bind(agent_id)
        .bind(task_id)
        .fetch_one(pool)
        .await
    }

    pub async fn save(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE agent_memories
            SET global_goal = ?2,
                steps = ?3,
                total_tokens = ?4,
                cumulative_tokens = ?5,
                is_compressed = ?6,
                compression_ratio = ?7,
                original_step_count = ?8,
                updated_at = ?9
            WHERE id = ?1
            "#,
        )
        .bind(self.id)
        .bind(&self.global_goal)
        .bind(&self.steps)
        .bind(self.total_tokens)
        .bind(self.cumulative_tokens)
        .bind(self.is_compressed)
        .bind(self.compression_ratio)
        .bind(self.original_step_count)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }
}
