use crate::error::{Result, SimflowError};
use crate::mailbox::Update;
use crate::retry::RetryPolicy;
use crate::types::{ProcessType, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduler-reported resource usage of one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUsage {
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub run_time_seconds: Option<u64>,
}

/// One (realisation, stage) row of the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub run_name: String,
    pub process_type: ProcessType,
    pub status: Status,
    pub job_id: Option<u64>,
    pub retries: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cores_used: Option<u32>,
    pub run_time_seconds: Option<u64>,
    pub last_error: Option<String>,
    /// Discovery order; the auto-submit loop submits lowest first.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of applying an update to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Task),
    /// The task already reflects the update.
    Unchanged(Task),
}

impl Transition {
    pub fn task(&self) -> &Task {
        match self {
            Transition::Applied(t) | Transition::Unchanged(t) => t,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            Transition::Applied(t) | Transition::Unchanged(t) => t,
        }
    }
}

impl Task {
    pub fn new(run_name: impl Into<String>, process_type: ProcessType) -> Self {
        let now = Utc::now();
        Self {
            run_name: run_name.into(),
            process_type,
            status: Status::NotStarted,
            job_id: None,
            retries: 0,
            start_time: None,
            end_time: None,
            cores_used: None,
            run_time_seconds: None,
            last_error: None,
            seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.run_name, self.process_type)
    }

    /// Compute the task state after `update`, or reject it.
    ///
    /// Allowed edges:
    /// `NotStarted → Queued`, `Queued → Running`,
    /// `Running → Completed | Failed | Killed`, `Failed → Queued` (budget left),
    /// and any non-terminal status `→ Killed`.
    pub fn transition(
        &self,
        update: &Update,
        policy: &RetryPolicy,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        let from = self.status;
        let to = update.status;
        let reject = |reason: String| SimflowError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            reason,
        };

        if let (Some(bound), Some(requested)) = (self.job_id, update.job_id) {
            let new_attempt = to == Status::Queued && from != Status::Queued;
            if bound != requested && !new_attempt {
                return Err(reject(format!(
                    "update names job {requested} but the task is bound to job {bound}"
                )));
            }
        }

        if from == to {
            return Ok(Transition::Unchanged(self.clone()));
        }

        let non_terminal = !policy.is_terminal(self);
        let allowed = match (from, to) {
            (Status::NotStarted, Status::Queued) => true,
            (Status::Failed, Status::Queued) => policy.can_retry(self),
            (Status::Queued, Status::Running) => true,
            (Status::Running, Status::Completed | Status::Failed | Status::Killed) => true,
            (_, Status::Killed) => non_terminal,
            _ => false,
        };
        if !allowed {
            let reason = if from == Status::Failed && to == Status::Queued {
                format!(
                    "retry budget exhausted ({}/{})",
                    self.retries, policy.max_retries
                )
            } else {
                "transition not permitted".to_string()
            };
            return Err(reject(reason));
        }

        let mut next = self.clone();
        next.status = to;
        next.updated_at = at;

        if to == Status::Queued {
            let job_id = update
                .job_id
                .ok_or_else(|| reject("queued updates must carry a job id".to_string()))?;
            if from == Status::Failed {
                next.retries += 1;
            }
            next.job_id = Some(job_id);
            next.start_time = None;
            next.end_time = None;
            next.cores_used = None;
            next.run_time_seconds = None;
            next.last_error = None;
        }

        if let Some(usage) = &update.usage {
            next.start_time = usage.start_time.or(next.start_time);
            next.end_time = usage.end_time.or(next.end_time);
            next.cores_used = usage.cores.or(next.cores_used);
            next.run_time_seconds = usage.run_time_seconds.or(next.run_time_seconds);
        }

        if update.error.is_some() {
            next.last_error = update.error.clone();
        }

        Ok(Transition::Applied(next))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("Hossack_REL01", ProcessType::Emod3d)
    }

    fn update(status: Status, job_id: Option<u64>) -> Update {
        Update::new("Hossack_REL01", ProcessType::Emod3d, status).with_job_id(job_id)
    }

    fn apply(t: &Task, u: &Update) -> Result<Transition> {
        t.transition(u, &RetryPolicy::new(2), Utc::now())
    }

    #[test]
    fn happy_path_preserves_job_id() {
        let t = task();
        let t = apply(&t, &update(Status::Queued, Some(100))).unwrap().into_task();
        let t = apply(&t, &update(Status::Running, Some(100))).unwrap().into_task();
        let t = apply(&t, &update(Status::Completed, Some(100))).unwrap().into_task();
        assert_eq!(t.status, Status::Completed);
        assert_eq!(t.job_id, Some(100));
        assert_eq!(t.retries, 0);
    }

    #[test]
    fn queued_without_job_id_is_rejected() {
        let err = apply(&task(), &update(Status::Queued, None)).unwrap_err();
        assert!(matches!(err, SimflowError::InvalidTransition { .. }));
    }

    #[test]
    fn skipping_states_is_rejected() {
        for to in [Status::Running, Status::Completed, Status::Failed] {
            let err = apply(&task(), &update(to, Some(1))).unwrap_err();
            assert!(err.to_string().contains("not permitted"), "{to}: {err}");
        }
    }

    #[test]
    fn reapplying_same_update_is_unchanged() {
        let t = apply(&task(), &update(Status::Queued, Some(7))).unwrap().into_task();
        let again = apply(&t, &update(Status::Queued, Some(7))).unwrap();
        assert_eq!(again, Transition::Unchanged(t));
    }

    #[test]
    fn stale_job_id_is_rejected() {
        let t = apply(&task(), &update(Status::Queued, Some(7))).unwrap().into_task();
        let err = apply(&t, &update(Status::Running, Some(8))).unwrap_err();
        assert!(err.to_string().contains("bound to job 7"));
    }

    #[test]
    fn requeue_after_failure_counts_retries() {
        let mut t = task();
        for (attempt, job) in [(0u32, 10u64), (1, 11), (2, 12)] {
            t = apply(&t, &update(Status::Queued, Some(job))).unwrap().into_task();
            assert_eq!(t.retries, attempt);
            t = apply(&t, &update(Status::Running, Some(job))).unwrap().into_task();
            t = apply(&t, &update(Status::Failed, Some(job))).unwrap().into_task();
        }
        let err = apply(&t, &update(Status::Queued, Some(13))).unwrap_err();
        assert!(err.to_string().contains("retry budget exhausted"));
        assert_eq!(t.retries, 2);
    }

    #[test]
    fn kill_allowed_until_terminal() {
        let t = apply(&task(), &update(Status::Killed, None)).unwrap().into_task();
        assert_eq!(t.status, Status::Killed);
        assert!(apply(&t, &update(Status::Queued, Some(1))).is_err());
    }

    #[test]
    fn usage_and_error_are_recorded() {
        let t = apply(&task(), &update(Status::Queued, Some(5))).unwrap().into_task();
        let t = apply(&t, &update(Status::Running, Some(5))).unwrap().into_task();
        let failed = update(Status::Failed, Some(5))
            .with_error("scheduler reported TIMEOUT")
            .with_usage(JobUsage {
                cores: Some(80),
                run_time_seconds: Some(3600),
                ..JobUsage::default()
            });
        let t = apply(&t, &failed).unwrap().into_task();
        assert_eq!(t.cores_used, Some(80));
        assert_eq!(t.run_time_seconds, Some(3600));
        assert_eq!(t.last_error.as_deref(), Some("scheduler reported TIMEOUT"));
    }
}
