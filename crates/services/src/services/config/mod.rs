use std::path::Path;

use thiserror::Error;

pub mod versions;

pub use versions::v1::{
    AuthConfig, MemoryConfig, OrchestratorConfig, RealtimeConfig, ReasonerConfig, ReasonerKind,
    SandboxConfig, SandboxKind,
};

pub type Config = versions::v1::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl Config {
    /// Apply `ORCHESTRATOR_SANDBOX` and `ORCHESTRATOR_MAX_STEPS`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("ORCHESTRATOR_SANDBOX") {
            match raw.parse::<SandboxKind>() {
                Ok(kind) => self.sandbox.provider = kind,
                Err(e) => tracing::warn!("Ignoring ORCHESTRATOR_SANDBOX: {}", e),
            }
        }
        if let Some(raw) = lookup("ORCHESTRATOR_MAX_STEPS") {
            match raw.trim().parse::<u32>() {
                Ok(steps) => self.orchestrator.max_steps = steps,
                Err(e) => tracing::warn!("Ignoring ORCHESTRATOR_MAX_STEPS={}: {}", raw, e),
            }
        }
    }

    /// Validate the file config, then layer the overrides on top. Overrides
    /// that would make the result invalid are dropped.
    fn resolve(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Err(e) = self.validate() {
            tracing::warn!("{}, using default config", e);
            self = Config::default();
        }

        let mut overridden = self.clone();
        overridden.apply_overrides(lookup);
        match overridden.validate() {
            Ok(()) => overridden,
            Err(e) => {
                tracing::warn!("Ignoring environment overrides: {}", e);
                self
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.token_budget == 0 {
            return Err(ConfigError::ValidationError(
                "memory.token_budget must be positive".to_string(),
            ));
        }
        if self.memory.keep_first + self.memory.keep_last == 0 {
            return Err(ConfigError::ValidationError(
                "memory.keep_first + memory.keep_last must retain at least one step".to_string(),
            ));
        }
        if self.orchestrator.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_steps must be positive".to_string(),
            ));
        }
        if self.orchestrator.max_duration_secs == 0 || self.orchestrator.step_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load the config file, falling back to defaults when it is missing,
/// unreadable or invalid. Environment overrides are applied last.
pub async fn load_config_from_file(config_path: &Path) -> Config {
    let config = match tokio::fs::read_to_string(config_path).await {
        Ok(raw) => Config::from(raw),
        Err(_) => {
            tracing::info!("No config file found at {}, using defaults", config_path.display());
            Config::default()
        }
    };

    config.resolve(|key| std::env::var(key).ok())
}

pub async fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    let raw_config = serde_json::to_string_pretty(config)?;
    tokio::fs::write(config_path, raw_config).await?;
    Ok(())
}
