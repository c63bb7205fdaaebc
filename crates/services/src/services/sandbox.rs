use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use executors::AgentEnvironment;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Sandbox provisioning failed: {0}")]
    Provision(String),
    #[error("Sandbox teardown failed: {0}")]
    Teardown(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An isolated environment bound to exactly one execution.
#[async_trait]
pub trait Sandbox: AgentEnvironment {
    fn execution_id(&self) -> &str;

    /// Human-readable location, used in execution logs.
    fn describe(&self) -> String;

    fn as_environment(&self) -> &dyn AgentEnvironment;

    /// Release every resource held by the sandbox.
    async fn destroy(&self) -> Result<(), SandboxError>;
}

/// Creates sandboxes. A failed `provision` must not leave anything behind.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn provision(&self, execution_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

/// Tracks live sandboxes so each one is destroyed exactly once, whether by
/// its lease or by a shutdown sweep.
#[derive(Clone)]
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    live: Arc<DashMap<String, Arc<dyn Sandbox>>>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            live: Arc::new(DashMap::new()),
        }
    }

    pub fn provider_kind(&self) -> &'static str {
        self.provider.kind()
    }

    pub async fn provision(&self, execution_id: &str) -> Result<SandboxLease, SandboxError> {
        let sandbox = self.provider.provision(execution_id).await?;
        self.live.insert(execution_id.to_string(), sandbox.clone());
        tracing::info!(
            sandbox_id = %sandbox.id(),
            provider = self.provider.kind(),
            "Provisioned sandbox"
        );
        Ok(SandboxLease {
            manager: self.clone(),
            sandbox,
            released: false,
        })
    }

    /// Tear down the sandbox of `execution_id`. Returns whether this call did
    /// the teardown; later calls are no-ops. Failures are logged.
    pub async fn destroy(&self, execution_id: &str) -> bool {
        let Some((_, sandbox)) = self.live.remove(execution_id) else {
            return false;
        };
        match sandbox.destroy().await {
            Ok(()) => tracing::info!(sandbox_id = %sandbox.id(), "Destroyed sandbox"),
            Err(e) => tracing::error!(sandbox_id = %sandbox.id(), "Sandbox teardown failed: {}", e),
        }
        true
    }

    pub async fn destroy_all(&self) -> usize {
        let ids: Vec<String> = self.live.iter().map(|entry| entry.key().clone()).collect();
        let mut destroyed = 0;
        for id in ids {
            if self.destroy(&id).await {
                destroyed += 1;
            }
        }
        destroyed
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, execution_id: &str) -> bool {
        self.live.contains_key(execution_id)
    }
}

/// Scoped ownership of a sandbox. Call [`SandboxLease::release`] on normal
/// paths; if the lease is dropped without it (panic, cancelled task) the
/// teardown is scheduled on the runtime instead.
pub struct SandboxLease {
    manager: SandboxManager,
    sandbox: Arc<dyn Sandbox>,
    released: bool,
}

impl SandboxLease {
    pub fn sandbox(&self) -> &dyn Sandbox {
        self.sandbox.as_ref()
    }

    pub fn environment(&self) -> &dyn AgentEnvironment {
        self.sandbox.as_environment()
    }

    pub async fn release(mut self) -> bool {
        self.released = true;
        self.manager.destroy(self.sandbox.execution_id()).await
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let execution_id = self.sandbox.execution_id().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(%execution_id, "Sandbox lease dropped without release, scheduling teardown");
                handle.spawn(async move {
                    manager.destroy(&execution_id).await;
                });
            }
            Err(_) => {
                tracing::error!(%execution_id, "No runtime to tear down sandbox");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use executors::{AgentEnvironment, CommandOutput, ExecutorError};

    use super::*;

    /// In-process sandboxes that count provisioning and teardown.
    #[derive(Default)]
    pub struct FakeProvider {
        pub fail: bool,
        pub provisioned: AtomicUsize,
        pub destroyed: Arc<AtomicUsize>,
        pub destroyed_ids: Arc<Mutex<Vec<String>>>,
    }

    impl FakeProvider {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }
    }

    pub struct FakeSandbox {
        execution_id: String,
        destroyed: Arc<AtomicUsize>,
        destroyed_ids: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AgentEnvironment for FakeSandbox {
        fn id(&self) -> &str {
            &self.execution_id
        }

        async fn run_command(
            &self,
            command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, ExecutorError> {
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: command.to_string(),
                stderr: String::new(),
            })
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn execution_id(&self) -> &str {
            &self.execution_id
        }

        fn describe(&self) -> String {
            format!("fake sandbox {}", self.execution_id)
        }

        fn as_environment(&self) -> &dyn AgentEnvironment {
            self
        }

        async fn destroy(&self) -> Result<(), SandboxError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut ids) = self.destroyed_ids.lock() {
                ids.push(self.execution_id.clone());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SandboxProvider for FakeProvider {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn provision(&self, execution_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SandboxError::Unavailable(
                    "container runtime unreachable".to_string(),
                ));
            }
            Ok(Arc::new(FakeSandbox {
                execution_id: execution_id.to_string(),
                destroyed: self.destroyed.clone(),
                destroyed_ids: self.destroyed_ids.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{test_support::FakeProvider, *};

    #[tokio::test]
    async fn release_destroys_exactly_once() {
        let provider = Arc::new(FakeProvider::default());
        let manager = SandboxManager::new(provider.clone());

        let lease = manager.provision("exec_1_a").await.unwrap();
        assert!(manager.is_live("exec_1_a"));
        assert!(lease.release().await);
        assert!(!manager.destroy("exec_1_a").await);
        assert_eq!(manager.destroy_all().await, 0);
        assert_eq!(provider.destroyed(), 1);
    }

    #[tokio::test]
    async fn dropped_lease_schedules_teardown() {
        let provider = Arc::new(FakeProvider::default());
        let manager = SandboxManager::new(provider.clone());

        {
            let _lease = manager.provision("exec_2_b").await.unwrap();
        }
        for _ in 0..50 {
            if provider.destroyed() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(provider.destroyed(), 1);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn destroy_all_sweeps_live_sandboxes() {
        let provider = Arc::new(FakeProvider::default());
        let manager = SandboxManager::new(provider.clone());
        let a = manager.provision("exec_3_a").await.unwrap();
        let b = manager.provision("exec_3_b").await.unwrap();

        assert_eq!(manager.destroy_all().await, 2);
        assert!(!a.release().await);
        assert!(!b.release().await);
        assert_eq!(provider.destroyed(), 2);
    }

    #[tokio::test]
    async fn failed_provision_tracks_nothing() {
        let provider = Arc::new(FakeProvider::failing());
        let manager = SandboxManager::new(provider.clone());
        let err = manager.provision("exec_4").await.err().unwrap();
        assert!(matches!(err, SandboxError::Unavailable(_)));
        assert_eq!(manager.live_count(), 0);
    }
}
