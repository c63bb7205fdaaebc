use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use executors::{AgentEnvironment, CommandOutput, ExecutorError};
use services::services::{
    config::SandboxConfig,
    sandbox::{Sandbox, SandboxError, SandboxProvider},
};
use tokio::process::Command;

use crate::command::{run_with_timeout, shell};

const CONTAINER_LABEL: &str = "agent-orchestrator.execution";
const CONTAINER_WORKDIR: &str = "/workspace";
const DOCKER_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

/// Private directories under a local root, one per execution.
pub struct WorkspaceSandboxProvider {
    root: PathBuf,
}

impl WorkspaceSandboxProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SandboxProvider for WorkspaceSandboxProvider {
    fn kind(&self) -> &'static str {
        "workspace"
    }

    async fn provision(&self, execution_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            SandboxError::Unavailable(format!(
                "cannot create sandbox root {}: {e}",
                self.root.display()
            ))
        })?;
        let dir = self.root.join(execution_id);
        tokio::fs::create_dir(&dir).await.map_err(|e| {
            SandboxError::Provision(format!("cannot create {}: {e}", dir.display()))
        })?;
        Ok(Arc::new(WorkspaceSandbox {
            execution_id: execution_id.to_string(),
            dir,
        }))
    }
}

pub struct WorkspaceSandbox {
    execution_id: String,
    dir: PathBuf,
}

impl WorkspaceSandbox {
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl AgentEnvironment for WorkspaceSandbox {
    fn id(&self) -> &str {
        &self.execution_id
    }

    async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutorError> {
        let mut cmd = shell(command);
        cmd.current_dir(&self.dir);
        run_with_timeout(cmd, timeout).await
    }
}

#[async_trait]
impl Sandbox for WorkspaceSandbox {
    fn execution_id(&self) -> &str {
        &self.execution_id
    }

    fn describe(&self) -> String {
        format!("workspace {}", self.dir.display())
    }

    fn as_environment(&self) -> &dyn AgentEnvironment {
        self
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Teardown(format!(
                "cannot remove {}: {e}",
                self.dir.display()
            ))),
        }
    }
}

/// One labelled container per execution, driven through the docker CLI.
pub struct DockerSandboxProvider {
    binary: String,
    image: String,
    control_timeout: Duration,
}

impl DockerSandboxProvider {
    pub fn new(binary: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            image: image.into(),
            control_timeout: DOCKER_CONTROL_TIMEOUT,
        }
    }

    /// Bound on every docker control call (`version`, `run`, `exec`, `rm`).
    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(&config.docker_binary, &config.docker_image)
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    async fn control(&self, args: &[&str]) -> Result<CommandOutput, SandboxError> {
        let mut cmd = self.command();
        cmd.args(args);
        match run_with_timeout(cmd, self.control_timeout).await {
            Ok(output) => Ok(output),
            Err(ExecutorError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Err(
                SandboxError::Unavailable(format!("{} not found on PATH", self.binary)),
            ),
            Err(ExecutorError::Io(e)) => Err(SandboxError::Io(e)),
            Err(e) => Err(SandboxError::Unavailable(e.to_string())),
        }
    }

    /// Remove whatever a failed provision left behind, then report it.
    async fn abandon(&self, container: &str, reason: String) -> SandboxError {
        if let Err(e) = self.remove(container).await {
            tracing::warn!(container, "Cleanup after failed provision: {}", e);
        }
        SandboxError::Provision(reason)
    }

    async fn remove(&self, container: &str) -> Result<(), SandboxError> {
        let output = self.control(&["rm", "-f", container]).await?;
        if output.success() || output.stderr.contains("No such container") {
            Ok(())
        } else {
            Err(SandboxError::Teardown(output.combined()))
        }
    }
}

pub fn container_name(execution_id: &str) -> String {
    format!("orchestrator-{execution_id}")
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, execution_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let daemon = self
            .control(&["version", "--format", "{{.Server.Version}}"])
            .await?;
        if !daemon.success() {
            return Err(SandboxError::Unavailable(daemon.combined()));
        }

        let name = container_name(execution_id);
        let label = format!("{CONTAINER_LABEL}={execution_id}");
        // `run` may create the container before it fails or times out
        let created = self
            .control(&[
                "run",
                "-d",
                "--name",
                &name,
                "--label",
                &label,
                "-w",
                CONTAINER_WORKDIR,
                &self.image,
                "sleep",
                "infinity",
            ])
            .await;
        match created {
            Ok(output) if output.success() => {}
            Ok(output) => return Err(self.abandon(&name, output.combined()).await),
            Err(e) => return Err(self.abandon(&name, format!("docker run failed: {e}")).await),
        }

        match self.control(&["exec", &name, "true"]).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                let reason = format!("container {name} not ready: {}", output.combined());
                return Err(self.abandon(&name, reason).await);
            }
            Err(e) => {
                let reason = format!("container {name} not ready: {e}");
                return Err(self.abandon(&name, reason).await);
            }
        }

        Ok(Arc::new(DockerSandbox {
            execution_id: execution_id.to_string(),
            container: name,
            provider: DockerSandboxProvider {
                binary: self.binary.clone(),
                image: self.image.clone(),
                control_timeout: self.control_timeout,
            },
        }))
    }
}

pub struct DockerSandbox {
    execution_id: String,
    container: String,
    provider: DockerSandboxProvider,
}

#[async_trait]
impl AgentEnvironment for DockerSandbox {
    fn id(&self) -> &str {
        &self.container
    }

    async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutorError> {
        let mut cmd = self.provider.command();
        cmd.args(["exec", "-w", CONTAINER_WORKDIR, &self.container, "sh", "-c", command]);
        run_with_timeout(cmd, timeout).await
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn execution_id(&self) -> &str {
        &self.execution_id
    }

    fn describe(&self) -> String {
        format!("container {} ({})", self.container, self.provider.image)
    }

    fn as_environment(&self) -> &dyn AgentEnvironment {
        self
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        self.provider.remove(&self.container).await
    }
}
