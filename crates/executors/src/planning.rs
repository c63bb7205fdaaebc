use async_trait::async_trait;
use workspace_utils::text::truncate_chars;

use crate::{
    AgentEnvironment, CommandOutput, ExecutorError, Reasoner, StepContext, StepOutcome,
    environment::shell_quote,
};

const NOTES_FILE: &str = "NOTES.md";
const MAX_PLAN_ITEMS: usize = 6;
const MAX_RESULT_CHARS: usize = 2_000;

/// Offline reasoner that works through a fixed routine: inspect the sandbox,
/// draft a plan from the goal, write it to `NOTES.md`, then verify the notes.
#[derive(Debug, Clone, Default)]
pub struct PlanningReasoner;

impl PlanningReasoner {
    pub fn new() -> Self {
        Self
    }
}

/// Break a goal into a numbered plan.
pub fn draft_plan(goal: &str) -> Vec<String> {
    let mut items: Vec<String> = goal
        .lines()
        .flat_map(|line| line.split(". "))
        .map(|fragment| {
            fragment
                .trim()
                .trim_start_matches("Title:")
                .trim_start_matches("Description:")
                .trim()
                .trim_end_matches('.')
                .to_string()
        })
        .filter(|fragment| !fragment.is_empty())
        .take(MAX_PLAN_ITEMS - 1)
        .collect();
    if items.is_empty() {
        items.push("Clarify the goal".to_string());
    }
    items.push("Verify the result".to_string());
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect()
}

fn notes_heading(ctx: &StepContext<'_>) -> String {
    match ctx.agent_role {
        Some(role) => format!("## {} ({})", ctx.agent_name, role),
        None => format!("## {}", ctx.agent_name),
    }
}

async fn run_checked(
    ctx: &StepContext<'_>,
    env: &dyn AgentEnvironment,
    command: &str,
) -> Result<CommandOutput, ExecutorError> {
    let output = env.run_command(command, ctx.command_timeout).await?;
    if !output.success() {
        return Err(ExecutorError::CommandFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: truncate_chars(output.stderr.trim(), MAX_RESULT_CHARS),
        });
    }
    Ok(output)
}

#[async_trait]
impl Reasoner for PlanningReasoner {
    fn name(&self) -> &'static str {
        "planning"
    }

    async fn next_step(
        &self,
        ctx: &StepContext<'_>,
        env: &dyn AgentEnvironment,
    ) -> Result<StepOutcome, ExecutorError> {
        match ctx.turn_step {
            0 => {
                let output = run_checked(ctx, env, "pwd && ls -la").await?;
                Ok(StepOutcome::progress(
                    "inspect workspace",
                    truncate_chars(&output.combined(), MAX_RESULT_CHARS),
                ))
            }
            1 => {
                let plan = draft_plan(ctx.goal);
                let resumed = if ctx.history.is_empty() {
                    String::new()
                } else {
                    format!(" (resuming after {} remembered steps)", ctx.history.len())
                };
                Ok(StepOutcome::progress(
                    format!("draft plan{resumed}"),
                    plan.join("\n"),
                ))
            }
            2 => {
                let section = format!("{}\n\n{}\n", notes_heading(ctx), draft_plan(ctx.goal).join("\n"));
                let command = format!(
                    "printf '%s\\n' {} >> {}",
                    shell_quote(&section),
                    NOTES_FILE
                );
                run_checked(ctx, env, &command).await?;
                Ok(StepOutcome::progress(
                    "record notes",
                    format!("wrote plan to {NOTES_FILE}"),
                ))
            }
            3 => {
                let output = run_checked(ctx, env, &format!("cat {NOTES_FILE}")).await?;
                let heading = notes_heading(ctx);
                if !output.stdout.contains(&heading) {
                    return Err(ExecutorError::Verification(format!(
                        "{NOTES_FILE} is missing section `{heading}`"
                    )));
                }
                Ok(StepOutcome::finished(
                    "verify notes",
                    format!("{NOTES_FILE} contains the plan for {}", ctx.agent_name),
                ))
            }
            _ => Ok(StepOutcome::finished("wrap up", "nothing left to do")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::{PastStep, test_env::TempDirEnvironment};

    fn ctx<'a>(goal: &'a str, history: &'a [PastStep], turn_step: u32) -> StepContext<'a> {
        StepContext {
            agent_id: Uuid::new_v4(),
            agent_name: "scribe",
            agent_role: Some("writer"),
            goal,
            history,
            compressed: false,
            turn_step,
            command_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn plan_is_numbered_and_ends_with_verification() {
        let plan = draft_plan("Title: Ship docs\n\nDescription:\nWrite the guide. Add examples.");
        assert_eq!(
            plan,
            vec![
                "1. Ship docs",
                "2. Write the guide",
                "3. Add examples",
                "4. Verify the result"
            ]
        );
        assert_eq!(draft_plan("   "), vec!["1. Clarify the goal", "2. Verify the result"]);
    }

    #[tokio::test]
    async fn routine_finishes_after_verifying_notes() {
        let env = TempDirEnvironment::new();
        let reasoner = PlanningReasoner::new();
        let goal = "Document the API's endpoints";

        let mut outcomes = Vec::new();
        for step in 0..4 {
            let outcome = reasoner.next_step(&ctx(goal, &[], step), &env).await.unwrap();
            outcomes.push(outcome);
        }

        assert!(outcomes[..3].iter().all(|o| !o.finished));
        assert!(outcomes[3].finished);
        assert_eq!(outcomes[2].action, "record notes");
        assert_eq!(env.commands.lock().unwrap().len(), 3);

        let notes = env.run_command("cat NOTES.md", Duration::from_secs(5)).await.unwrap();
        assert!(notes.stdout.contains("## scribe (writer)"));
        assert!(notes.stdout.contains("Document the API's endpoints"));
    }

    #[tokio::test]
    async fn resumed_plan_mentions_history() {
        let env = TempDirEnvironment::new();
        let history = vec![PastStep {
            action: "inspect workspace".into(),
            result: "/tmp".into(),
        }];
        let outcome = PlanningReasoner::new()
            .next_step(&ctx("goal", &history, 1), &env)
            .await
            .unwrap();
        assert!(outcome.action.contains("resuming after 1"));
    }
}
