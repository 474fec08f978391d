//! Application configuration for memforge.
//!
//! User config lives at `~/.memforge/memforge.toml`.
//! CLI flags (and their env vars) override config file values, which
//! override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemforgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "memforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".memforge";

// ---------------------------------------------------------------------------
// Config structs (matching memforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scratch directory settings.
    #[serde(default)]
    pub scratch: ScratchConfig,

    /// Stage processor settings.
    #[serde(default)]
    pub stages: StagesConfig,

    /// Upload intake settings.
    #[serde(default)]
    pub intake: IntakeConfig,
}

/// `[scratch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchConfig {
    /// Root of the scratch store. Created at startup if absent.
    #[serde(default = "default_scratch_root")]
    pub root: String,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root: default_scratch_root(),
        }
    }
}

fn default_scratch_root() -> String {
    "uploads".into()
}

/// `[stages]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Interpreter used to run both stage scripts.
    #[serde(default = "default_python")]
    pub python: String,

    /// Working directory the stage processes run in.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Stage 1 script (raw text → smart dataset).
    #[serde(default = "default_smart_script")]
    pub smart_script: String,

    /// Stage 2 script (smart dataset → fine-tune dataset).
    #[serde(default = "default_finetune_script")]
    pub finetune_script: String,

    /// Wall-clock budget per stage in seconds. 0 disables the timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            working_dir: default_working_dir(),
            smart_script: default_smart_script(),
            finetune_script: default_finetune_script(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl StagesConfig {
    /// Per-stage timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn default_python() -> String {
    "python3".into()
}
fn default_working_dir() -> String {
    ".".into()
}
fn default_smart_script() -> String {
    "scripts/generate_jsonl_smart.py".into()
}
fn default_finetune_script() -> String {
    "scripts/prepare_finetune_dataset.py".into()
}
fn default_timeout_secs() -> u64 {
    600
}

/// `[intake]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// What to do with uploads that are not valid UTF-8.
    #[serde(default)]
    pub decode: DecodePolicy,
}

/// Handling of uploads that are not valid UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Fail the whole batch before the combined document is written.
    #[default]
    Reject,
    /// Replace invalid sequences with U+FFFD and continue.
    Lossy,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.memforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| MemforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.memforge/memforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| MemforgeError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        MemforgeError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| MemforgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| MemforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| MemforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
