//! Uniform interface over batch schedulers.
//!
//! One [`SchedulerAdapter`] is built at startup from config and used for the
//! life of the process. Adapters shell out through a [`CommandRunner`] so
//! tests can script scheduler output.

pub mod command;
pub mod pbs;
pub mod queue;
pub mod slurm;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::JobUsage;
use crate::types::Status;

pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use pbs::PbsAdapter;
pub use queue::QueueFormat;
pub use slurm::SlurmAdapter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The command could not run, timed out, or produced nothing usable.
    /// Retried on the next poll cycle.
    #[error("scheduler command '{command}' failed: {reason}")]
    Transient { command: String, reason: String },

    /// The output did not match the expected format; the caller must not
    /// act on any of it.
    #[error("unexpected output from '{command}': {reason}")]
    MalformedOutput { command: String, reason: String },

    /// The scheduler refused a job. No job was created.
    #[error("submission of {script} failed: {reason}")]
    Submission { script: String, reason: String },
}

impl SchedulerError {
    pub fn transient(command: impl Into<String>, reason: impl Into<String>) -> Self {
        SchedulerError::Transient {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        SchedulerError::MalformedOutput {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn submission(script: &Path, reason: impl Into<String>) -> Self {
        SchedulerError::Submission {
            script: script.display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Transient { .. })
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

// ---------------------------------------------------------------------------
// Kinds & policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Slurm,
    Pbs,
}

impl SchedulerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "slurm",
            SchedulerKind::Pbs => "pbs",
        }
    }

    /// Job script extension used by this scheduler family.
    pub fn script_extension(self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "sl",
            SchedulerKind::Pbs => "pbs",
        }
    }

    /// Probe the PATH for a submit command: `sbatch` first, then `qsub`.
    pub fn detect() -> Option<SchedulerKind> {
        if which::which("sbatch").is_ok() {
            return Some(SchedulerKind::Slurm);
        }
        if which::which("qsub").is_ok() {
            return Some(SchedulerKind::Pbs);
        }
        None
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slurm" => Ok(SchedulerKind::Slurm),
            "pbs" => Ok(SchedulerKind::Pbs),
            other => Err(format!("unknown scheduler: {other}")),
        }
    }
}

/// What to record for a job that left the queue without retrievable
/// accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingMetadataPolicy {
    /// Treat it as cancelled. Terminal; no retry.
    #[default]
    Killed,
    /// Treat it as failed, so the retry budget applies.
    Failed,
}

impl MissingMetadataPolicy {
    pub fn status(self) -> Status {
        match self {
            MissingMetadataPolicy::Killed => Status::Killed,
            MissingMetadataPolicy::Failed => Status::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One row of the scheduler's queue view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerJob {
    pub job_id: u64,
    pub status: Status,
    /// The scheduler's own status code, before mapping.
    pub raw_status: String,
}

/// Accounting for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobMetadata {
    pub job_id: u64,
    pub status: Status,
    pub usage: JobUsage,
    /// False when accounting was unavailable and `status` comes from the
    /// missing-metadata policy.
    pub found: bool,
}

impl JobMetadata {
    /// The conservative record for a job the scheduler no longer knows.
    pub fn missing(job_id: u64, policy: MissingMetadataPolicy) -> Self {
        Self {
            job_id,
            status: policy.status(),
            usage: JobUsage {
                cores: Some(0),
                run_time_seconds: Some(0),
                ..JobUsage::default()
            },
            found: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Submit `script` with `run_dir` as the working directory.
    async fn submit(&self, run_dir: &Path, script: &Path) -> SchedulerResult<u64>;

    async fn cancel(&self, job_id: u64) -> SchedulerResult<()>;

    /// The current queue for the configured user.
    async fn list_queue(&self) -> SchedulerResult<Vec<SchedulerJob>>;

    /// Accounting for a job, or the missing-metadata fallback.
    async fn job_metadata(&self, job_id: u64) -> SchedulerResult<JobMetadata>;
}

/// Connection settings shared by both adapters.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub user: Option<String>,
    pub account: Option<String>,
    pub missing_metadata: MissingMetadataPolicy,
}

/// Build the adapter for `kind`, shelling out through `runner`.
pub fn build(
    kind: SchedulerKind,
    settings: AdapterSettings,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn SchedulerAdapter> {
    match kind {
        SchedulerKind::Slurm => Box::new(SlurmAdapter::new(settings, runner)),
        SchedulerKind::Pbs => Box::new(PbsAdapter::new(settings, runner)),
    }
}

/// Build the adapter for `kind` on top of the real system commands.
pub fn build_system(
    kind: SchedulerKind,
    settings: AdapterSettings,
    timeout: Duration,
) -> Box<dyn SchedulerAdapter> {
    build(kind, settings, Arc::new(SystemRunner::new(timeout)))
}

/// Turn a submit command's stdout into a job id.
///
/// The id is the first run of digits in the last non-empty line; anything
/// else is a [`SchedulerError::Submission`].
pub(crate) fn parse_job_id(script: &Path, stdout: &str) -> SchedulerResult<u64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| SchedulerError::submission(script, "no job id in output"))?;
    let token = line
        .split_whitespace()
        .last()
        .unwrap_or(line)
        .split('.')
        .next()
        .unwrap_or_default();
    token.parse::<u64>().map_err(|_| {
        SchedulerError::submission(script, format!("non-numeric job id '{line}'"))
    })
}
