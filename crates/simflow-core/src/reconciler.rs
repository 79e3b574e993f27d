//! Single consumer that applies mailbox updates to the task store.

use serde::Serialize;

use crate::error::{Result, SimflowError};
use crate::mailbox::Mailbox;
use crate::store::TaskStore;
use crate::task::Transition;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub applied: usize,
    pub unchanged: usize,
    /// Illegal transitions and updates for unknown tasks.
    pub rejected: usize,
    /// Files that could not be read as updates.
    pub malformed: usize,
}

impl ReconcileReport {
    pub fn consumed(&self) -> usize {
        self.applied + self.unchanged + self.rejected + self.malformed
    }
}

pub struct Reconciler<'a> {
    store: &'a TaskStore,
    mailbox: &'a Mailbox,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a TaskStore, mailbox: &'a Mailbox) -> Self {
        Self { store, mailbox }
    }

    /// Apply every pending update in name (timestamp) order.
    ///
    /// Rejected and malformed updates are logged and retired; they are never
    /// retried. Store failures stop the pass and leave the current file in
    /// place for the next one.
    pub fn drain(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for entry in self.mailbox.pending()? {
            let update = match entry.read() {
                Ok(update) => update,
                Err(SimflowError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(file = %entry.name, "update already consumed elsewhere");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(file = %entry.name, error = %e, "discarding malformed update");
                    report.malformed += 1;
                    self.mailbox.retire(&entry)?;
                    continue;
                }
            };

            match self.store.apply_at(&update, entry.timestamp) {
                Ok(Transition::Applied(task)) => {
                    tracing::info!(
                        run = %task.run_name,
                        stage = %task.process_type,
                        status = %task.status,
                        job_id = ?task.job_id,
                        retries = task.retries,
                        "applied update"
                    );
                    report.applied += 1;
                }
                Ok(Transition::Unchanged(_)) => {
                    tracing::debug!(file = %entry.name, "update already reflected");
                    report.unchanged += 1;
                }
                Err(e @ (SimflowError::InvalidTransition { .. } | SimflowError::TaskNotFound { .. })) => {
                    tracing::warn!(file = %entry.name, error = %e, "rejected update");
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
            self.mailbox.retire(&entry)?;
        }

        Ok(report)
    }
}
