use thiserror::Error;

use crate::scheduler::SchedulerError;

#[derive(Debug, Error)]
pub enum SimflowError {
    #[error("not initialized: run 'simflow init'")]
    NotInitialized,

    #[error("task not found: {run_name}/{process_type}")]
    TaskNotFound {
        run_name: String,
        process_type: String,
    },

    #[error("invalid run name '{0}': use letters, digits, '_' or '-'")]
    InvalidRunName(String),

    #[error("invalid process type: {0}")]
    InvalidProcessType(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("an update named {0} already exists in the mailbox")]
    DuplicateUpdate(String),

    #[error("malformed update {name}: {reason}")]
    MalformedUpdate { name: String, reason: String },

    #[error("task store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SimflowError {
    /// Errors that must abort the process instead of being retried next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SimflowError::DuplicateUpdate(_))
    }
}

impl From<rusqlite::Error> for SimflowError {
    fn from(e: rusqlite::Error) -> Self {
        SimflowError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SimflowError>;
