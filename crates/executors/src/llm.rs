//! OpenAI-compatible chat-completions reasoner.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use workspace_utils::text::truncate_chars;

use crate::{AgentEnvironment, ExecutorError, Reasoner, StepContext, StepOutcome};

/// A reply containing this marker ends the agent's turn.
pub const COMPLETION_PROMISE: &str = "<promise>TASK_COMPLETE</promise>";

const MAX_HISTORY_CHARS: usize = 1_500;
const MAX_RESULT_CHARS: usize = 4_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReasonerConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmReasonerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_tokens: 800,
        }
    }
}

/// The JSON decision the model is asked to reply with.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub done: bool,
}

pub struct LlmReasoner {
    client: Client,
    api_key: Option<String>,
    config: LlmReasonerConfig,
}

impl LlmReasoner {
    pub fn new(config: LlmReasonerConfig, api_key: Option<String>) -> Self {
        if api_key.is_none() {
            tracing::warn!("LLM reasoner created without an API key");
        }
        Self {
            client: Client::new(),
            api_key,
            config,
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are an autonomous agent working inside a disposable Linux sandbox. \
             Reply with a single JSON object: {{\"thought\": string, \"command\": string or null, \"done\": boolean}}. \
             `command` is run with `sh -c` in the sandbox and its output is shown to you next turn. \
             Set `done` to true once the goal is satisfied, or include {COMPLETION_PROMISE} in your reply."
        )
    }

    fn user_prompt(&self, ctx: &StepContext<'_>) -> String {
        let mut prompt = format!("Agent: {}", ctx.agent_name);
        if let Some(role) = ctx.agent_role {
            prompt.push_str(&format!(" ({role})"));
        }
        prompt.push_str(&format!("\n\nGoal:\n{}\n", ctx.goal));
        if ctx.history.is_empty() {
            prompt.push_str("\nNo previous steps.");
        } else {
            if ctx.compressed {
                prompt.push_str("\nEarlier middle steps were dropped to save space.");
            }
            prompt.push_str("\nPrevious steps:\n");
            for (i, step) in ctx.history.iter().enumerate() {
                prompt.push_str(&format!(
                    "{}. {}\n   -> {}\n",
                    i + 1,
                    step.action,
                    truncate_chars(&step.result, MAX_HISTORY_CHARS)
                ));
            }
        }
        prompt
    }

    async fn chat(&self, ctx: &StepContext<'_>) -> Result<String, ExecutorError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ExecutorError::NotConfigured("no API key configured".to_string()))?;

        let payload = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "messages": [
                { "role": "system", "content": self.system_prompt() },
                { "role": "user", "content": self.user_prompt(ctx) },
            ]
        });

        tracing::debug!(model = %self.config.model, history = ctx.history.len(), "Sending chat request");

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .timeout(ctx.command_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Provider {
                status: status.as_u16(),
                message: truncate_chars(&body, 500),
            });
        }

        let json: serde_json::Value = response.json().await?;
        Ok(json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

pub fn promises_completion(reply: &str) -> bool {
    reply.contains(COMPLETION_PROMISE)
}

/// Pull the decision object out of a reply, tolerating prose or code fences around it.
pub fn parse_decision(reply: &str) -> Option<Decision> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

#[async_trait]
impl Reasoner for LlmReasoner {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn next_step(
        &self,
        ctx: &StepContext<'_>,
        env: &dyn AgentEnvironment,
    ) -> Result<StepOutcome, ExecutorError> {
        let reply = self.chat(ctx).await?;
        let promised = promises_completion(&reply);

        let Some(decision) = parse_decision(&reply) else {
            if promised {
                return Ok(StepOutcome::finished("report completion", reply));
            }
            return Err(ExecutorError::Parse(truncate_chars(&reply, 200)));
        };

        let finished = decision.done || promised;
        match decision.command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => {
                let output = env.run_command(command, ctx.command_timeout).await?;
                let result = format!(
                    "exit {}\n{}",
                    output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    truncate_chars(&output.combined(), MAX_RESULT_CHARS)
                );
                Ok(StepOutcome {
                    action: format!("$ {command}"),
                    result,
                    finished,
                })
            }
            _ => Ok(StepOutcome {
                action: "think".to_string(),
                result: decision.thought,
                finished,
            }),
        }
    }
}
