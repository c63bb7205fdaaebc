use std::{process::Stdio, time::Duration};

use executors::{CommandOutput, ExecutorError};
use tokio::process::Command;

/// Run `command` to completion, killing it if `timeout` expires first.
pub(crate) async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> Result<CommandOutput, ExecutorError> {
    command
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| ExecutorError::Timeout(timeout))??;
    Ok(CommandOutput::from_process(&output))
}

/// `sh -c <script>`.
pub(crate) fn shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}
