use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// An AI agent that can be assigned to tasks.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Agent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub role: Option<String>,
    pub description: Option<String>,

    // Reputation, maintained by the completion listener
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub experience_points: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, TS)]
pub struct CreateAgent {
    pub name: String,
    pub role: Option<String>,
    pub description: Option<String>,
}

impl Agent {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Agent>(r#"SELECT * FROM agents WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_owned(
        pool: &SqlitePool,
        id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Agent>(r#"SELECT * FROM agents WHERE id = ?1 AND owner_id = ?2"#)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_owner(pool: &SqlitePool, owner_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Agent>(
            r#"SELECT * FROM agents WHERE owner_id = ?1 ORDER BY created_at ASC"#,
        )
        .bind(owner_id)
        .fetch_all(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateAgent,
        owner_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Agent>(
            r#"
            INSERT INTO agents (id, owner_id, name, role, description, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(&data.name)
        .bind(&data.role)
        .bind(&data.description)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    /// Count a finished run against the agent and award experience.
    pub async fn record_outcome(
        pool: &SqlitePool,
        id: Uuid,
        completed: bool,
        experience: i64,
    ) -> Result<(), sqlx::Error> {
        let (done, failed): (i64, i64) = if completed { (1, 0) } else { (0, 1) };
        sqlx::query(
            r#"
            UPDATE agents
            SET tasks_completed = tasks_completed + ?2,
                tasks_failed = tasks_failed + ?3,
                experience_points = experience_points + ?4,
                updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(done)
        .bind(failed)
        .bind(experience)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{create_agent, setup_test_pool};

    #[tokio::test]
    async fn record_outcome_accumulates() {
        let pool = setup_test_pool().await;
        let agent = create_agent(&pool, Uuid::new_v4(), "builder").await;

        Agent::record_outcome(&pool, agent.id, true, 10).await.unwrap();
        Agent::record_outcome(&pool, agent.id, false, 1).await.unwrap();
        Agent::record_outcome(&pool, agent.id, true, 10).await.unwrap();

        let agent = Agent::find_by_id(&pool, agent.id).await.unwrap().unwrap();
        assert_eq!(agent.tasks_completed, 2);
        assert_eq!(agent.tasks_failed, 1);
        assert_eq!(agent.experience_points, 21);
    }
}
