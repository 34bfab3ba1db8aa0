use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::schedule::ScheduleSpec;

/// Agent configuration: daemon settings plus the per-user policies
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSettings,

    /// Users under enforcement
    pub users: Vec<UserPolicy>,
}

/// Daemon-level settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSettings {
    /// Enforcement loop interval in seconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Override for the state file location
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Override for the command drop-in directory
    #[serde(default)]
    pub command_dir: Option<PathBuf>,
}

impl AgentSettings {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            state_file: None,
            command_dir: None,
        }
    }
}

fn default_tick_interval() -> u64 {
    10
}

/// Policy for a single user
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserPolicy {
    /// OS account name
    pub username: String,

    /// Daily budget in minutes, 0 = unlimited
    #[serde(default)]
    pub daily_minutes: u32,

    /// Allowed hours
    #[serde(default)]
    pub schedule: ScheduleSpec,

    /// Minutes-remaining thresholds at which warnings fire
    #[serde(default = "default_warnings")]
    pub warnings: Vec<u32>,

    /// Auto-resume a paused timer after this many minutes
    #[serde(default = "default_pause_auto_resume")]
    pub pause_auto_resume_minutes: u32,
}

impl UserPolicy {
    /// Warning thresholds deduplicated and sorted largest-first, the order
    /// they are processed within a tick.
    pub fn warning_thresholds(&self) -> Vec<u32> {
        let mut thresholds: Vec<u32> = self.warnings.clone();
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        thresholds.dedup();
        thresholds
    }
}

fn default_warnings() -> Vec<u32> {
    vec![10, 5, 1]
}

fn default_pause_auto_resume() -> u32 {
    60
}

impl Config {
    /// Load and validate configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            anyhow::bail!("Configuration must list at least one user");
        }

        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            if user.username.is_empty() {
                anyhow::bail!("Username cannot be empty");
            }
            if !seen.insert(user.username.as_str()) {
                anyhow::bail!("Duplicate username: {}", user.username);
            }
        }

        Ok(())
    }

    pub fn get_user(&self, username: &str) -> Option<&UserPolicy> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Effective state file path
    pub fn state_path(&self) -> PathBuf {
        self.agent
            .state_file
            .clone()
            .unwrap_or_else(crate::state::default_state_path)
    }

    /// Effective command drop-in directory
    pub fn command_dir(&self) -> PathBuf {
        self.agent
            .command_dir
            .clone()
            .unwrap_or_else(default_command_dir)
    }
}

/// Config shared across the daemon's tasks. The inner value is replaced
/// whole on settings updates, never mutated in place.
pub type SharedConfig = Arc<RwLock<Config>>;

pub fn shared(config: Config) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// System config path, falling back to the user's config directory when
/// not running as root.
pub fn default_config_path() -> PathBuf {
    let system = PathBuf::from("/etc/timewarden/config.yaml");
    if system.exists() || is_root() {
        return system;
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "timewarden") {
        return dirs.config_dir().join("config.yaml");
    }

    system
}

fn default_command_dir() -> PathBuf {
    if is_root() {
        return PathBuf::from("/var/lib/timewarden/commands");
    }

    if let Some(dirs) = directories::BaseDirs::new() {
        let base = dirs.state_dir().unwrap_or_else(|| dirs.data_local_dir());
        return base.join("timewarden").join("commands");
    }

    PathBuf::from("/var/lib/timewarden/commands")
}

pub(crate) fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(not(unix))]
    {
        false
    }
}

/// Example configuration shipped with the crate
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");
