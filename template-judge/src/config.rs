//! Engine configuration
//!
//! Loaded from an optional TOML file and overridden by environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data roots in priority order (first root wins template name collisions)
    pub roots: Vec<PathBuf>,
    /// Shell used to run compiled scripts
    pub shell: String,
    /// Seconds to wait for the script's PID line (default: 3)
    pub shell_timeout_secs: u64,
    /// Wall-clock limit for a whole run in seconds, 0 disables (default: 600)
    pub run_timeout_secs: u64,
    /// Name of the working directory inside a problem directory
    pub work_dir_name: String,
    /// Interval between startup polls in milliseconds (default: 10)
    pub startup_poll_ms: u64,
    /// Step of the bounded completion wait in milliseconds (default: 100)
    pub completion_step_ms: u64,
    /// Interval between status record retries in milliseconds (default: 10)
    pub status_retry_ms: u64,
    /// Total status record retry window in milliseconds (default: 2000)
    pub status_retry_window_ms: u64,
    /// Largest file a SUCCESS check accepts, in bytes (default: 1MB)
    pub max_success_file_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            shell: "/bin/sh".to_string(),
            shell_timeout_secs: 3,
            run_timeout_secs: 600,
            work_dir_name: "+work+".to_string(),
            startup_poll_ms: 10,
            completion_step_ms: 100,
            status_retry_ms: 10,
            status_retry_window_ms: 2000,
            max_success_file_bytes: 1 << 20,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ENGINE_CONFIG` (if set) and environment overrides
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ENGINE_CONFIG") {
            Ok(path) => Self::from_toml_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_toml_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid engine config {}", path))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if let Ok(roots) = std::env::var("TEMPLATE_ROOTS") {
            self.roots = roots
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(shell) = std::env::var("ENGINE_SHELL") {
            self.shell = shell;
        }
        if let Some(secs) = env_u64("ENGINE_SHELL_TIMEOUT_SECS") {
            self.shell_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("ENGINE_RUN_TIMEOUT_SECS") {
            self.run_timeout_secs = secs;
        }
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms)
    }

    pub fn completion_step(&self) -> Duration {
        Duration::from_millis(self.completion_step_ms)
    }

    pub fn status_retry(&self) -> Duration {
        Duration::from_millis(self.status_retry_ms)
    }

    pub fn status_retry_window(&self) -> Duration {
        Duration::from_millis(self.status_retry_window_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not an unsigned integer", key, raw);
            None
        }
    }
}
