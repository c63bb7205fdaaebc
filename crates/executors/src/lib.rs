//! Agent-side execution: the environment an agent acts in and the reasoners
//! that decide what it does next.

pub mod environment;
pub mod llm;
pub mod planning;
pub mod reasoner;

use std::time::Duration;

use thiserror::Error;

pub use environment::{AgentEnvironment, CommandOutput};
pub use reasoner::{PastStep, Reasoner, StepContext, StepOutcome};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Command `{command}` failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("Environment unavailable: {0}")]
    Unavailable(String),
    #[error("Model API error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Could not interpret model reply: {0}")]
    Parse(String),
    #[error("Reasoner not configured: {0}")]
    NotConfigured(String),
    #[error("Verification failed: {0}")]
    Verification(String),
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::process::Command;

    use crate::{AgentEnvironment, CommandOutput, ExecutorError};

    /// Runs commands with `sh -c` inside a private temp directory.
    pub struct TempDirEnvironment {
        dir: TempDir,
        pub commands: std::sync::Mutex<Vec<String>>,
    }

    impl TempDirEnvironment {
        pub fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                commands: Default::default(),
            }
        }
    }

    #[async_trait]
    impl AgentEnvironment for TempDirEnvironment {
        fn id(&self) -> &str {
            "test-env"
        }

        async fn run_command(
            &self,
            command: &str,
            timeout: Duration,
        ) -> Result<CommandOutput, ExecutorError> {
            self.commands.lock().unwrap().push(command.to_string());
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .current_dir(self.dir.path())
                .kill_on_drop(true);
            let output = tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| ExecutorError::Timeout(timeout))??;
            Ok(CommandOutput::from_process(&output))
        }
    }
}
