use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use db::models::{
    agent::Agent,
    task::{Task, TaskStatus},
};
use executors::{AgentEnvironment, ExecutorError, Reasoner, StepContext};
use futures::FutureExt;
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{Instant, timeout},
};
use tracing::Instrument;
use utils::text::truncate_chars;
use uuid::Uuid;

use super::{
    broadcast::{AgentLog, BroadcastGateway, LogLevel},
    config::OrchestratorConfig,
    execution::{ExecutionPhase, ExecutionRegistry, StateMachineError, TaskStateMachine},
    hooks::{ExecutionOutcome, HookBus},
    memory::{MemoryError, MemoryManager},
    sandbox::SandboxManager,
};

const LOG_RESULT_CHARS: usize = 240;
const FINALIZE_BACKOFF_STEP: Duration = Duration::from_millis(100);
const FINALIZE_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunLimits {
    pub max_steps: u32,
    pub max_duration: Duration,
    pub step_timeout: Duration,
    pub command_timeout: Duration,
}

impl From<&OrchestratorConfig> for RunLimits {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_duration: Duration::from_secs(config.max_duration_secs),
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("{agent} failed at step {step}: {source}")]
    Step {
        agent: String,
        step: u32,
        #[source]
        source: ExecutorError,
    },
}

/// Why the agent loop stopped without an error.
#[derive(Debug, Clone, PartialEq)]
enum LoopEnd {
    Completed,
    StepBudget(u32),
    TimeBudget(Duration),
    StepTimeout { agent: String, step: u32, after: Duration },
}

pub struct ExecutionJob {
    pub execution_id: String,
    pub task: Task,
    /// In assignment order; the first one is the primary actor.
    pub assignees: Vec<Agent>,
}

/// Sends execution-phase log lines to the task's project room.
struct ExecutionLog<'a> {
    gateway: &'a BroadcastGateway,
    project_id: Uuid,
    task_id: Uuid,
    execution_id: &'a str,
}

impl ExecutionLog<'_> {
    fn emit(&self, level: LogLevel, agent: Option<&Agent>, message: String) {
        match level {
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        self.gateway.emit_log(
            self.project_id,
            AgentLog {
                message,
                agent_id: agent.map(|agent| agent.id),
                agent_name: agent.map(|agent| agent.name.clone()),
                timestamp: Utc::now(),
                level,
                task_id: self.task_id,
                execution_id: self.execution_id.to_string(),
            },
        );
    }

    fn info(&self, agent: Option<&Agent>, message: impl Into<String>) {
        self.emit(LogLevel::Info, agent, message.into());
    }

    fn error(&self, agent: Option<&Agent>, message: impl Into<String>) {
        self.emit(LogLevel::Error, agent, message.into());
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drives accepted executions from sandbox provisioning to final status.
#[derive(Clone)]
pub struct ExecutionRunner {
    gateway: BroadcastGateway,
    registry: ExecutionRegistry,
    state_machine: TaskStateMachine,
    sandboxes: SandboxManager,
    memory: MemoryManager,
    reasoner: Arc<dyn Reasoner>,
    hooks: HookBus,
    limits: RunLimits,
}

impl ExecutionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: BroadcastGateway,
        registry: ExecutionRegistry,
        state_machine: TaskStateMachine,
        sandboxes: SandboxManager,
        memory: MemoryManager,
        reasoner: Arc<dyn Reasoner>,
        hooks: HookBus,
        limits: RunLimits,
    ) -> Self {
        Self {
            gateway,
            registry,
            state_machine,
            sandboxes,
            memory,
            reasoner,
            hooks,
            limits,
        }
    }

    pub fn spawn(&self, job: ExecutionJob) -> JoinHandle<()> {
        let span = tracing::info_span!(
            "execution",
            execution_id = %job.execution_id,
            task_id = %job.task.id
        );
        let runner = self.clone();
        tokio::spawn(async move { runner.run(job).await }.instrument(span))
    }

    async fn run(&self, job: ExecutionJob) {
        let ExecutionJob {
            execution_id,
            task,
            assignees,
        } = job;
        let log = ExecutionLog {
            gateway: &self.gateway,
            project_id: task.project_id,
            task_id: task.id,
            execution_id: &execution_id,
        };
        let primary = assignees.first();
        let names: Vec<&str> = assignees.iter().map(|agent| agent.name.as_str()).collect();
        log.info(
            primary,
            format!(
                "Run {} accepted for \"{}\", acting agent(s): {}",
                execution_id,
                task.title,
                names.join(", ")
            ),
        );

        self.registry
            .set_phase(&execution_id, ExecutionPhase::Provisioning)
            .await;
        log.info(
            primary,
            format!("Creating {} sandbox", self.sandboxes.provider_kind()),
        );

        let mut steps = 0u32;
        let status = match self.sandboxes.provision(&execution_id).await {
            Err(e) => {
                log.error(primary, format!("Sandbox provisioning failed: {e}"));
                TaskStatus::Failed
            }
            Ok(lease) => {
                log.info(primary, format!("Sandbox ready: {}", lease.sandbox().describe()));
                self.registry
                    .set_phase(&execution_id, ExecutionPhase::Running)
                    .await;

                let driven = AssertUnwindSafe(self.drive(
                    &task,
                    &assignees,
                    lease.environment(),
                    &log,
                    &mut steps,
                ))
                .catch_unwind()
                .await;

                let status = match driven {
                    Ok(Ok(end)) => self.settle(end, steps, primary, &log),
                    Ok(Err(e)) => {
                        log.error(primary, format!("Run failed: {e}"));
                        TaskStatus::Failed
                    }
                    Err(panic) => {
                        log.error(
                            primary,
                            format!("Runner fault: {}", panic_message(panic.as_ref())),
                        );
                        TaskStatus::Failed
                    }
                };

                self.registry
                    .set_phase(&execution_id, ExecutionPhase::Finalizing)
                    .await;
                if lease.release().await {
                    log.info(primary, "Sandbox torn down");
                } else {
                    // Swept by shutdown, which also finalizes the task
                    tracing::warn!("Sandbox was already torn down");
                }
                status
            }
        };

        let recorded = self.finalize(&task, status, primary).await;
        self.registry.remove(&execution_id).await;

        // Whoever moved the task out of IN_PROGRESS owns its outcome
        let Some(status) = recorded else {
            return;
        };
        self.hooks.publish_outcome(ExecutionOutcome {
            task_id: task.id,
            project_id: task.project_id,
            execution_id,
            status,
            agent_ids: assignees.iter().map(|agent| agent.id).collect(),
            steps,
        });
    }

    fn settle(&self, end: LoopEnd, steps: u32, primary: Option<&Agent>, log: &ExecutionLog<'_>) -> TaskStatus {
        match end {
            LoopEnd::Completed => {
                log.info(primary, format!("All agents finished after {steps} step(s)"));
                TaskStatus::Completed
            }
            LoopEnd::StepBudget(max) => {
                log.error(primary, format!("Step budget of {max} exhausted before the goal was met"));
                TaskStatus::Failed
            }
            LoopEnd::TimeBudget(limit) => {
                log.error(primary, format!("Time budget of {}s exceeded", limit.as_secs()));
                TaskStatus::Failed
            }
            LoopEnd::StepTimeout { agent, step, after } => {
                log.error(
                    primary,
                    format!("{agent} timed out on step {step} after {}s", after.as_secs()),
                );
                TaskStatus::Failed
            }
        }
    }

    async fn drive(
        &self,
        task: &Task,
        assignees: &[Agent],
        env: &dyn AgentEnvironment,
        log: &ExecutionLog<'_>,
        steps: &mut u32,
    ) -> Result<LoopEnd, RunnerError> {
        let started = Instant::now();
        let goal = task.to_prompt();
        let limits = self.limits;

        for agent in assignees {
            let mut context = self.memory.load(agent.id, task.id, &goal).await?;
            log.info(Some(agent), format!("Memory {}", context.state()));

            let mut turn_step = 0u32;
            loop {
                if *steps >= limits.max_steps {
                    return Ok(LoopEnd::StepBudget(limits.max_steps));
                }
                let elapsed = started.elapsed();
                if elapsed >= limits.max_duration {
                    return Ok(LoopEnd::TimeBudget(limits.max_duration));
                }
                let budget = limits.step_timeout.min(limits.max_duration - elapsed);

                let history = context.past_steps();
                let ctx = StepContext {
                    agent_id: agent.id,
                    agent_name: &agent.name,
                    agent_role: agent.role.as_deref(),
                    goal: &context.global_goal,
                    history: &history,
                    compressed: context.compressed,
                    turn_step,
                    command_timeout: limits.command_timeout.min(budget),
                };

                let outcome = match timeout(budget, self.reasoner.next_step(&ctx, env)).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(source)) => {
                        return Err(RunnerError::Step {
                            agent: agent.name.clone(),
                            step: *steps + 1,
                            source,
                        });
                    }
                    Err(_) if budget < limits.step_timeout => {
                        return Ok(LoopEnd::TimeBudget(limits.max_duration));
                    }
                    Err(_) => {
                        return Ok(LoopEnd::StepTimeout {
                            agent: agent.name.clone(),
                            step: *steps + 1,
                            after: budget,
                        });
                    }
                };
                *steps += 1;
                turn_step += 1;

                let appended = self
                    .memory
                    .append(agent.id, task.id, &outcome.action, &outcome.result)
                    .await?;
                log.info(
                    Some(agent),
                    format!(
                        "Step {}: {} -> {}",
                        *steps,
                        outcome.action,
                        truncate_chars(outcome.result.trim(), LOG_RESULT_CHARS)
                    ),
                );
                if appended.compressed_now {
                    log.info(Some(agent), format!("Memory {}", appended.context.state()));
                }
                context = appended.context;

                if outcome.finished {
                    log.info(Some(agent), format!("{} finished", agent.name));
                    break;
                }
            }
        }
        Ok(LoopEnd::Completed)
    }

    /// Record the terminal status, retrying until the compare-and-set
    /// resolves. Returns `None` when the task already left IN_PROGRESS
    /// through another path (shutdown, recovery).
    ///
    /// The execution stays registered while this retries, so orphan recovery
    /// skips the task and a shutdown sweep can still fail it.
    async fn finalize(
        &self,
        task: &Task,
        status: TaskStatus,
        actor: Option<&Agent>,
    ) -> Option<TaskStatus> {
        let mut attempt = 0u32;
        loop {
            match self.state_machine.finish(task, status, actor).await {
                Ok(()) => return Some(status),
                Err(StateMachineError::Stale { .. }) => {
                    tracing::warn!(task_id = %task.id, "Task left IN_PROGRESS before the run finished");
                    return None;
                }
                Err(e @ StateMachineError::InvalidTransition { .. }) => {
                    tracing::error!(task_id = %task.id, "Cannot record final status: {}", e);
                    return None;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    tracing::error!(task_id = %task.id, attempt, "Failed to record final status: {}", e);
                    let backoff = FINALIZE_BACKOFF_STEP
                        .saturating_mul(attempt)
                        .min(FINALIZE_BACKOFF_MAX);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
