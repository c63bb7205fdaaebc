use std::fmt;

use chrono::Utc;
use db::{
    DBService,
    models::agent_memory::{AgentMemory, MemoryStep},
};
use executors::PastStep;
use thiserror::Error;
use utils::text::estimate_tokens;
use uuid::Uuid;

use super::config::MemoryConfig;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("No memory for agent {agent_id} on task {task_id}")]
    Missing { agent_id: Uuid, task_id: Uuid },
}

/// When and how working memory is compressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionPolicy {
    pub token_budget: u32,
    pub keep_first: usize,
    pub keep_last: usize,
}

impl From<&MemoryConfig> for CompressionPolicy {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            token_budget: config.token_budget,
            keep_first: config.keep_first,
            keep_last: config.keep_last,
        }
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

impl CompressionPolicy {
    /// Drop middle steps when the retained tokens exceed the budget.
    ///
    /// Keeps the first `keep_first` and last `keep_last` steps and records
    /// `kept / original_step_count` as the ratio. Returns whether anything
    /// was dropped. A memory compressed earlier has its ratio refreshed even
    /// when nothing is dropped now.
    pub fn apply(&self, memory: &mut AgentMemory) -> bool {
        let retained = self.keep_first + self.keep_last;
        let steps = &mut memory.steps.0;
        let dropped =
            memory.total_tokens > i64::from(self.token_budget) && steps.len() > retained;
        if dropped {
            let tail = steps.split_off(steps.len() - self.keep_last);
            steps.truncate(self.keep_first);
            steps.extend(tail);
            memory.total_tokens = steps.iter().map(|step| step.token_estimate).sum();
            memory.is_compressed = true;
        }
        if memory.is_compressed {
            memory.compression_ratio =
                Some(steps.len() as f64 / memory.original_step_count.max(1) as f64);
        }
        dropped
    }
}

/// How an agent's memory looked when a run picked it up.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryState {
    Fresh,
    Resumed { steps: usize },
    Compressed { ratio: f64, original_steps: i64 },
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryState::Fresh => write!(f, "fresh"),
            MemoryState::Resumed { steps } => write!(f, "resumed ({steps} steps)"),
            MemoryState::Compressed {
                ratio,
                original_steps,
            } => write!(f, "compressed ({ratio:.2}, {original_steps} original steps)"),
        }
    }
}

/// The view of memory handed to a reasoner.
#[derive(Debug, Clone)]
pub struct MemoryContext {
    pub global_goal: String,
    pub steps: Vec<MemoryStep>,
    pub compressed: bool,
    pub compression_ratio: Option<f64>,
    pub original_step_count: i64,
    pub total_tokens: i64,
    pub cumulative_tokens: i64,
}

impl From<AgentMemory> for MemoryContext {
    fn from(memory: AgentMemory) -> Self {
        Self {
            global_goal: memory.global_goal,
            steps: memory.steps.0,
            compressed: memory.is_compressed,
            compression_ratio: memory.compression_ratio,
            original_step_count: memory.original_step_count,
            total_tokens: memory.total_tokens,
            cumulative_tokens: memory.cumulative_tokens,
        }
    }
}

impl MemoryContext {
    pub fn state(&self) -> MemoryState {
        if self.compressed {
            MemoryState::Compressed {
                ratio: self.compression_ratio.unwrap_or(1.0),
                original_steps: self.original_step_count,
            }
        } else if self.steps.is_empty() {
            MemoryState::Fresh
        } else {
            MemoryState::Resumed {
                steps: self.steps.len(),
            }
        }
    }

    pub fn past_steps(&self) -> Vec<PastStep> {
        self.steps
            .iter()
            .map(|step| PastStep {
                action: step.action.clone(),
                result: step.result.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub context: MemoryContext,
    /// This append triggered a compression.
    pub compressed_now: bool,
}

#[derive(Clone)]
pub struct MemoryManager {
    db: DBService,
    policy: CompressionPolicy,
}

impl MemoryManager {
    pub fn new(db: DBService, policy: CompressionPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> CompressionPolicy {
        self.policy
    }

    /// Load the memory for (agent, task), creating it on first use. The goal
    /// is refreshed if the task has been edited since.
    pub async fn load(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        goal: &str,
    ) -> Result<MemoryContext, MemoryError> {
        let mut memory =
            AgentMemory::create_if_missing(&self.db.pool, agent_id, task_id, goal).await?;
        if memory.global_goal != goal {
            memory.global_goal = goal.to_string();
            memory.save(&self.db.pool).await?;
        }
        Ok(memory.into())
    }

    pub async fn get_context(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<MemoryContext>, MemoryError> {
        Ok(AgentMemory::find(&self.db.pool, agent_id, task_id)
            .await?
            .map(MemoryContext::from))
    }

    pub async fn append(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        action: &str,
        result: &str,
    ) -> Result<AppendOutcome, MemoryError> {
        let mut memory = AgentMemory::find(&self.db.pool, agent_id, task_id)
            .await?
            .ok_or(MemoryError::Missing { agent_id, task_id })?;

        let token_estimate = i64::from(estimate_tokens(action) + estimate_tokens(result));
        memory.steps.0.push(MemoryStep {
            timestamp: Utc::now(),
            action: action.to_string(),
            result: result.to_string(),
            token_estimate,
        });
        memory.total_tokens += token_estimate;
        memory.cumulative_tokens += token_estimate;
        memory.original_step_count += 1;

        let compressed_now = self.policy.apply(&mut memory);
        if compressed_now {
            tracing::debug!(
                %agent_id,
                %task_id,
                retained = memory.steps.0.len(),
                original = memory.original_step_count,
                "Compressed working memory"
            );
        }
        memory.save(&self.db.pool).await?;

        Ok(AppendOutcome {
            context: memory.into(),
            compressed_now,
        })
    }
}
