use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{AgentEnvironment, ExecutorError};

/// A step the agent already took, as retained in its working memory.
#[derive(Debug, Clone, PartialEq)]
pub struct PastStep {
    pub action: String,
    pub result: String,
}

/// Everything a reasoner sees when deciding the next step.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub agent_id: Uuid,
    pub agent_name: &'a str,
    pub agent_role: Option<&'a str>,
    pub goal: &'a str,
    /// Retained memory, which may be a compressed view.
    pub history: &'a [PastStep],
    pub compressed: bool,
    /// Zero-based index of this step within the agent's turn in the current run.
    pub turn_step: u32,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub action: String,
    pub result: String,
    /// The agent considers its part of the goal satisfied.
    pub finished: bool,
}

impl StepOutcome {
    pub fn progress(action: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            result: result.into(),
            finished: false,
        }
    }

    pub fn finished(action: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            result: result.into(),
            finished: true,
        }
    }
}

/// Decides and performs one step of an agent's loop.
#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn next_step(
        &self,
        ctx: &StepContext<'_>,
        env: &dyn AgentEnvironment,
    ) -> Result<StepOutcome, ExecutorError>;
}
