//! Bounded re-queue policy for failed tasks.
//!
//! `retries` counts re-submissions after a failure, so a task with
//! `max_retries = 2` gets three attempts in total. The counter is bumped on
//! the `Failed → Queued` transition, never on the failure itself.

use serde::{Deserialize, Serialize};

use crate::task::Task;
use crate::types::Status;

pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// A failed task that may be queued again.
    pub fn can_retry(&self, task: &Task) -> bool {
        task.status == Status::Failed && task.retries < self.max_retries
    }

    /// A failed task with no budget left; needs an operator.
    pub fn is_exhausted(&self, task: &Task) -> bool {
        task.status == Status::Failed && task.retries >= self.max_retries
    }

    /// Completed, Killed, or Failed with the budget spent.
    pub fn is_terminal(&self, task: &Task) -> bool {
        match task.status {
            Status::Completed | Status::Killed => true,
            Status::Failed => self.is_exhausted(task),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessType;

    fn failed(retries: u32) -> Task {
        let mut t = Task::new("Hossack_REL01", ProcessType::Emod3d);
        t.status = Status::Failed;
        t.retries = retries;
        t
    }

    #[test]
    fn budget_boundary() {
        let policy = RetryPolicy::new(2);
        assert!(policy.can_retry(&failed(0)));
        assert!(policy.can_retry(&failed(1)));
        assert!(!policy.can_retry(&failed(2)));
        assert!(policy.is_exhausted(&failed(2)));
    }

    #[test]
    fn zero_budget_means_first_failure_is_final() {
        let policy = RetryPolicy::new(0);
        assert!(policy.is_exhausted(&failed(0)));
        assert!(policy.is_terminal(&failed(0)));
    }

    #[test]
    fn only_failed_tasks_are_retried() {
        let policy = RetryPolicy::default();
        let t = Task::new("Hossack_REL01", ProcessType::Hf);
        assert!(!policy.can_retry(&t));
        assert!(!policy.is_terminal(&t));
    }
}
