use serde::{Deserialize, Serialize};
use ts_rs::TS;

pub const CONFIG_VERSION: &str = "v1";

#[derive(Clone, Debug, Serialize, Deserialize, TS, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Retained steps may total at most this many estimated tokens before compression.
    pub token_budget: u32,
    /// Steps kept from the start of the history when compressing.
    pub keep_first: usize,
    /// Steps kept from the end of the history when compressing.
    pub keep_last: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            token_budget: 4_000,
            keep_first: 3,
            keep_last: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_steps: u32,
    pub max_duration_secs: u64,
    pub step_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub auto_run_on_create: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            max_duration_secs: 600,
            step_timeout_secs: 120,
            command_timeout_secs: 60,
            auto_run_on_create: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, TS, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Workspace,
    Docker,
}

impl std::str::FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "workspace" => Ok(SandboxKind::Workspace),
            "docker" => Ok(SandboxKind::Docker),
            other => Err(format!("Unknown sandbox provider: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub provider: SandboxKind,
    pub docker_image: String,
    pub docker_binary: String,
    /// Overrides `<asset_dir>/sandboxes` for the workspace provider.
    pub workspace_root: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: SandboxKind::Workspace,
            docker_image: "alpine:3.20".to_string(),
            docker_binary: "docker".to_string(),
            workspace_root: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, TS, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasonerKind {
    #[default]
    Planning,
    Llm,
}

#[derive(Clone, Debug, Serialize, Deserialize, TS, PartialEq)]
#[serde(default)]
pub struct ReasonerConfig {
    pub kind: ReasonerKind,
    pub model: String,
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            kind: ReasonerKind::Planning,
            model: "gpt-4o-mini".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 800,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS, PartialEq)]
#[serde(default)]
pub struct RealtimeConfig {
    pub require_auth: bool,
    pub max_message_bytes: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            require_auth: false,
            max_message_bytes: 64 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Name of the environment variable holding the HS256 secret.
    pub jwt_secret_env: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret_env: "JWT_SECRET".to_string(),
            token_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS, PartialEq)]
pub struct Config {
    pub config_version: String,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub reasoner: ReasonerConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl From<String> for Config {
    fn from(raw_config: String) -> Self {
        match serde_json::from_str::<Config>(&raw_config) {
            Ok(config) if config.config_version == CONFIG_VERSION => config,
            Ok(config) => {
                tracing::warn!(
                    "Unsupported config version {}, using default",
                    config.config_version
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Config parse failed: {}, using default", e);
                Self::default()
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION.to_string(),
            memory: MemoryConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            sandbox: SandboxConfig::default(),
            reasoner: ReasonerConfig::default(),
            realtime: RealtimeConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}
