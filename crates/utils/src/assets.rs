use std::{env, path::PathBuf};

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");
const ASSET_DIR_ENV: &str = "ORCHESTRATOR_ASSET_DIR";

/// Directory holding the database, config file and sandbox workspaces.
///
/// Resolution order: `ORCHESTRATOR_ASSET_DIR`, then `dev_assets/` at the
/// workspace root for debug builds, then the platform data directory.
pub fn asset_dir() -> PathBuf {
    let path = if let Ok(custom_dir) = env::var(ASSET_DIR_ENV) {
        PathBuf::from(custom_dir)
    } else if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("ai", "agent-orchestrator", "agent-orchestrator")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| env::temp_dir().join("agent-orchestrator"))
    };

    if !path.exists()
        && let Err(e) = std::fs::create_dir_all(&path)
    {
        tracing::warn!("Failed to create asset directory {}: {}", path.display(), e);
    }

    path
    // ✔ macOS → ~/Library/Application Support/agent-orchestrator
    // ✔ Linux → ~/.local/share/agent-orchestrator   (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\agent-orchestrator
}

pub fn config_path() -> PathBuf {
    asset_dir().join("config.json")
}

pub fn database_path() -> PathBuf {
    asset_dir().join("db.sqlite")
}

/// Root under which the workspace sandbox provider creates per-execution directories.
pub fn sandbox_root() -> PathBuf {
    asset_dir().join("sandboxes")
}
