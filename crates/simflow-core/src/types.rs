use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SimflowError;

// ---------------------------------------------------------------------------
// ProcessType
// ---------------------------------------------------------------------------

/// One stage of the per-realisation simulation pipeline.
///
/// Stages form a DAG:
/// `emod3d → {merge_ts, winbin_aio} → hf → bb → im_calculation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    Emod3d,
    MergeTs,
    WinbinAio,
    Hf,
    Bb,
    ImCalculation,
}

impl ProcessType {
    pub fn all() -> &'static [ProcessType] {
        &[
            ProcessType::Emod3d,
            ProcessType::MergeTs,
            ProcessType::WinbinAio,
            ProcessType::Hf,
            ProcessType::Bb,
            ProcessType::ImCalculation,
        ]
    }

    /// Stable numeric code; accepted anywhere a stage name is.
    pub fn code(self) -> u8 {
        match self {
            ProcessType::Emod3d => 1,
            ProcessType::MergeTs => 2,
            ProcessType::WinbinAio => 3,
            ProcessType::Hf => 4,
            ProcessType::Bb => 5,
            ProcessType::ImCalculation => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessType::Emod3d => "emod3d",
            ProcessType::MergeTs => "merge_ts",
            ProcessType::WinbinAio => "winbin_aio",
            ProcessType::Hf => "hf",
            ProcessType::Bb => "bb",
            ProcessType::ImCalculation => "im_calculation",
        }
    }

    /// Upstream stages that must be `Completed` for the same realisation
    /// before this stage may be queued.
    pub fn dependencies(self) -> &'static [ProcessType] {
        match self {
            ProcessType::Emod3d => &[],
            ProcessType::MergeTs | ProcessType::WinbinAio => &[ProcessType::Emod3d],
            ProcessType::Hf => &[ProcessType::MergeTs, ProcessType::WinbinAio],
            ProcessType::Bb => &[ProcessType::Hf],
            ProcessType::ImCalculation => &[ProcessType::Bb],
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessType {
    type Err = SimflowError;

    /// Accepts either the stage name or its numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessType::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s || s.parse::<u8>().ok() == Some(p.code()))
            .ok_or_else(|| SimflowError::InvalidProcessType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    Queued,
    Running,
    Completed,
    Failed,
    Killed,
}

impl Status {
    pub fn all() -> &'static [Status] {
        &[
            Status::NotStarted,
            Status::Queued,
            Status::Running,
            Status::Completed,
            Status::Failed,
            Status::Killed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Killed => "killed",
        }
    }

    /// Queued or Running: a scheduler job is bound to the task.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Queued | Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = SimflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        Status::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == normalized)
            .ok_or_else(|| SimflowError::InvalidStatus(s.to_string()))
    }
}
