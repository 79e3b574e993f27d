use crate::error::{Result, SimflowError};
use crate::paths;
use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};
use crate::scheduler::{AdapterSettings, MissingMetadataPolicy, SchedulerKind};
use crate::script;
use crate::selection::TaskSelection;
use crate::types::ProcessType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerChoice {
    /// Probe the PATH at startup.
    #[default]
    Auto,
    Slurm,
    Pbs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub kind: SchedulerChoice,
    /// Queue owner; defaults to `$USER`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Project/allocation charged for submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    #[serde(default)]
    pub missing_metadata: MissingMetadataPolicy,
}

fn default_command_timeout() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerChoice::default(),
            user: None,
            account: None,
            command_timeout_seconds: default_command_timeout(),
            missing_metadata: MissingMetadataPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// The concrete scheduler to talk to.
    pub fn resolve_kind(&self) -> Result<SchedulerKind> {
        match self.kind {
            SchedulerChoice::Slurm => Ok(SchedulerKind::Slurm),
            SchedulerChoice::Pbs => Ok(SchedulerKind::Pbs),
            SchedulerChoice::Auto => SchedulerKind::detect().ok_or_else(|| {
                SimflowError::Config(
                    "scheduler.kind is auto but neither sbatch nor qsub is on PATH".into(),
                )
            }),
        }
    }

    pub fn user(&self) -> Option<String> {
        self.user.clone().or_else(|| std::env::var("USER").ok())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            user: self.user(),
            account: self.account.clone(),
            missing_metadata: self.missing_metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// MailboxConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Keep consumed updates under `mailbox/archive/` instead of deleting.
    #[serde(default)]
    pub archive: bool,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Cap on Queued + Running tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    /// Where realisation directories live; relative to the root.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    /// Per-stage job script path templates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<ProcessType, String>,
    /// Per-stage submission selectors.
    #[serde(default)]
    pub tasks: TaskSelection,
}

fn default_version() -> u32 {
    1
}

fn default_max_concurrent() -> u32 {
    20
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_poll_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    300
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("Runs")
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            version: default_version(),
            scheduler: SchedulerConfig::default(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            poll_interval_seconds: default_poll_interval(),
            stale_after_seconds: default_stale_after(),
            mailbox: MailboxConfig::default(),
            runs_dir: default_runs_dir(),
            scripts: BTreeMap::new(),
            tasks: TaskSelection::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(SimflowError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        if self.max_concurrent == 0 {
            push(
                WarnLevel::Warning,
                "max_concurrent is 0; the run loop will never submit".to_string(),
            );
        }

        if self.poll_interval_seconds == 0 {
            push(
                WarnLevel::Error,
                "poll_interval_seconds must be at least 1".to_string(),
            );
        }

        if self.scheduler.command_timeout_seconds == 0 {
            push(
                WarnLevel::Error,
                "scheduler.command_timeout_seconds must be at least 1".to_string(),
            );
        }

        if self.stale_after_seconds < self.poll_interval_seconds {
            push(
                WarnLevel::Warning,
                format!(
                    "stale_after_seconds ({}) is shorter than poll_interval_seconds ({}); \
                     every idle gap will be reported as a collection failure",
                    self.stale_after_seconds, self.poll_interval_seconds
                ),
            );
        }

        for (stage, template) in &self.scripts {
            for name in script::unknown_placeholders(template) {
                push(
                    WarnLevel::Error,
                    format!("unknown placeholder '{{{name}}}' in scripts.{stage}"),
                );
            }
        }

        if self.scheduler.kind == SchedulerChoice::Auto && SchedulerKind::detect().is_none() {
            push(
                WarnLevel::Warning,
                "scheduler.kind is auto but neither sbatch nor qsub is on PATH".to_string(),
            );
        }

        warnings
    }
}
