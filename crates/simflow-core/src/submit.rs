//! The auto-submit loop.
//!
//! One cycle:
//!
//! 1. drain the mailbox into the store,
//! 2. check for a stalled pipeline,
//! 3. poll the scheduler queue (a failed poll ends the cycle),
//! 4. post updates for active tasks whose jobs changed state, then drain,
//! 5. compute the runnable set and submit up to the free capacity.
//!
//! All state changes go through the mailbox; the loop never writes task rows
//! directly. Scheduler failures are logged and retried next cycle; only
//! fatal errors (a mailbox name collision) end [`AutoSubmitter::run`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::Instrument;

use crate::config::Config;
use crate::error::Result;
use crate::health;
use crate::mailbox::{Mailbox, Update};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::scheduler::{JobMetadata, SchedulerAdapter, SchedulerError, SchedulerJob};
use crate::script::ScriptLocator;
use crate::selection::TaskSelection;
use crate::store::TaskStore;
use crate::task::Task;
use crate::types::Status;

// ---------------------------------------------------------------------------
// Options & reports
// ---------------------------------------------------------------------------

/// Stop conditions for [`AutoSubmitter::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run a single cycle.
    pub once: bool,
    /// Stop once nothing is active and nothing more can be submitted.
    pub until_idle: bool,
    /// Stop after this many submissions in total.
    pub max_submissions: Option<usize>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub reconciled: ReconcileReport,
    /// A collection failure is open.
    pub stale: bool,
    /// The queue could not be read; nothing was observed or submitted.
    pub poll_failed: bool,
    /// Updates posted from queue and accounting observations.
    pub observed: usize,
    pub active: usize,
    pub runnable: usize,
    pub submitted: usize,
    /// Runnable tasks passed over (missing script, rejected submission).
    pub skipped: usize,
    /// A transient scheduler error stopped submissions early.
    pub submit_interrupted: bool,
}

impl CycleReport {
    fn absorb(&mut self, r: ReconcileReport) {
        self.reconciled.applied += r.applied;
        self.reconciled.unchanged += r.unchanged;
        self.reconciled.rejected += r.rejected;
        self.reconciled.malformed += r.malformed;
    }

    /// Nothing is active and nothing was runnable. A runnable task that was
    /// skipped keeps the loop going so it is retried next cycle.
    pub fn is_idle(&self) -> bool {
        !self.poll_failed
            && !self.submit_interrupted
            && self.active == 0
            && self.runnable == 0
            && self.skipped == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Once,
    Idle,
    MaxSubmissions,
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub cycles: usize,
    pub submitted: usize,
    pub stopped: StopReason,
}

enum SubmitOutcome {
    Submitted,
    Skipped,
    /// Stop submitting for the rest of the cycle.
    Interrupted,
}

// ---------------------------------------------------------------------------
// AutoSubmitter
// ---------------------------------------------------------------------------

pub struct AutoSubmitter {
    store: TaskStore,
    mailbox: Mailbox,
    adapter: Box<dyn SchedulerAdapter>,
    locator: Box<dyn ScriptLocator>,
    selection: TaskSelection,
    max_concurrent: usize,
    poll_interval: Duration,
    stale_after: Duration,
}

impl AutoSubmitter {
    pub fn new(
        config: &Config,
        store: TaskStore,
        mailbox: Mailbox,
        adapter: Box<dyn SchedulerAdapter>,
        locator: Box<dyn ScriptLocator>,
    ) -> Self {
        Self {
            store,
            mailbox,
            adapter,
            locator,
            selection: config.tasks.clone(),
            max_concurrent: config.max_concurrent as usize,
            poll_interval: config.poll_interval(),
            stale_after: config.stale_after(),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn drain(&self) -> Result<ReconcileReport> {
        Reconciler::new(&self.store, &self.mailbox).drain()
    }

    fn pending_keys(&self) -> Result<HashSet<(String, String)>> {
        Ok(self
            .mailbox
            .pending()?
            .into_iter()
            .map(|e| (e.run_name, e.process_type))
            .collect())
    }

    /// Run cycles until a stop condition holds or `shutdown` resolves.
    ///
    /// Non-fatal cycle errors are logged and the loop carries on after the
    /// poll interval. The mailbox is drained once more before returning.
    pub async fn run<F>(&self, opts: &RunOptions, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut cycles = 0;
        let mut submitted = 0;

        let stopped = loop {
            let budget = opts.max_submissions.map(|m| m.saturating_sub(submitted));
            match self.cycle(budget).await {
                Ok(report) => {
                    cycles += 1;
                    submitted += report.submitted;
                    tracing::info!(
                        cycle = cycles,
                        applied = report.reconciled.applied,
                        observed = report.observed,
                        active = report.active,
                        runnable = report.runnable,
                        submitted = report.submitted,
                        "cycle complete"
                    );
                    if opts.max_submissions.is_some_and(|m| submitted >= m) {
                        break StopReason::MaxSubmissions;
                    }
                    if opts.until_idle && report.is_idle() {
                        break StopReason::Idle;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    cycles += 1;
                    tracing::error!(error = %e, "cycle failed");
                }
            }
            if opts.once {
                break StopReason::Once;
            }
            tokio::select! {
                _ = &mut shutdown => break StopReason::Shutdown,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        if let Err(e) = self.drain() {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!(error = %e, "final mailbox drain failed");
        }
        tracing::info!(cycles, submitted, ?stopped, "auto-submit loop stopped");
        Ok(RunSummary {
            cycles,
            submitted,
            stopped,
        })
    }

    /// One pass of the loop, submitting at most `budget` tasks.
    pub async fn cycle(&self, budget: Option<usize>) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        report.absorb(self.drain()?);

        report.stale = health::check_staleness(&self.store, Utc::now(), self.stale_after)?.is_some();

        let queue = match self.adapter.list_queue().await {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(error = %e, "queue poll failed; skipping this cycle");
                report.poll_failed = true;
                return Ok(report);
            }
        };
        self.store.record_poll(Utc::now())?;
        let queue: HashMap<u64, SchedulerJob> = queue.into_iter().map(|j| (j.job_id, j)).collect();

        let pending = self.pending_keys()?;
        for task in self.store.active()? {
            if pending.contains(&(task.run_name.clone(), task.process_type.to_string())) {
                continue;
            }
            let span = tracing::info_span!(
                "task",
                run = %task.run_name,
                stage = %task.process_type,
                job_id = ?task.job_id
            );
            report.observed += self.observe(&task, &queue).instrument(span).await?;
        }
        if report.observed > 0 {
            report.absorb(self.drain()?);
        }

        let active = self.store.active()?.len();
        let pending = self.pending_keys()?;
        let runnable: Vec<Task> = self
            .store
            .list_runnable(&self.selection)?
            .into_iter()
            .filter(|t| !pending.contains(&(t.run_name.clone(), t.process_type.to_string())))
            .filter(|t| t.job_id.map_or(true, |id| !queue.contains_key(&id)))
            .collect();
        report.active = active;
        report.runnable = runnable.len();

        let mut capacity = self.max_concurrent.saturating_sub(active);
        if let Some(budget) = budget {
            capacity = capacity.min(budget);
        }
        if capacity == 0 {
            return Ok(report);
        }

        for task in &runnable {
            if report.submitted >= capacity {
                break;
            }
            let span = tracing::info_span!(
                "task",
                run = %task.run_name,
                stage = %task.process_type
            );
            match self.submit(task).instrument(span).await? {
                SubmitOutcome::Submitted => report.submitted += 1,
                SubmitOutcome::Skipped => report.skipped += 1,
                SubmitOutcome::Interrupted => {
                    report.submit_interrupted = true;
                    break;
                }
            }
        }
        report.active += report.submitted;
        Ok(report)
    }

    /// Post updates for one active task from the queue and accounting.
    /// Returns how many updates were posted.
    async fn observe(&self, task: &Task, queue: &HashMap<u64, SchedulerJob>) -> Result<usize> {
        let Some(job_id) = task.job_id else {
            tracing::warn!("active task has no job id");
            return Ok(0);
        };

        if let Some(job) = queue.get(&job_id) {
            if task.status == Status::Queued && job.status == Status::Running {
                self.post(Update::new(&task.run_name, task.process_type, Status::Running)
                    .with_job_id(Some(job_id)))?;
                return Ok(1);
            }
            return Ok(0);
        }

        let meta = match self.adapter.job_metadata(job_id).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(error = %e, "could not fetch job accounting");
                return Ok(0);
            }
        };
        if meta.status.is_active() {
            tracing::debug!(status = %meta.status, "job left the queue but accounting shows it active");
            return Ok(0);
        }

        let mut posted = 0;
        let ran = matches!(meta.status, Status::Completed | Status::Failed);
        if task.status == Status::Queued && ran {
            self.post(
                Update::new(&task.run_name, task.process_type, Status::Running)
                    .with_job_id(Some(job_id))
                    .with_usage(meta.usage.clone()),
            )?;
            posted += 1;
        }
        self.post(terminal_update(task, &meta))?;
        Ok(posted + 1)
    }

    async fn submit(&self, task: &Task) -> Result<SubmitOutcome> {
        let Some(job) = self.locator.locate(task) else {
            tracing::warn!("job script not found; skipping");
            return Ok(SubmitOutcome::Skipped);
        };

        match self.adapter.submit(&job.run_dir, &job.script).await {
            Ok(job_id) => {
                let queued = Update::new(&task.run_name, task.process_type, Status::Queued)
                    .with_job_id(Some(job_id));
                if let Err(e) = self.post(queued) {
                    // The job exists but nothing records it; cancel it so the
                    // task is not submitted twice.
                    tracing::error!(job_id, error = %e, "could not record submitted job; cancelling it");
                    if let Err(cancel_err) = self.adapter.cancel(job_id).await {
                        tracing::error!(job_id, error = %cancel_err, "orphaned job could not be cancelled");
                    }
                    return Err(e);
                }
                tracing::info!(job_id, retries = task.retries, "submitted");
                Ok(SubmitOutcome::Submitted)
            }
            Err(e @ SchedulerError::Transient { .. }) => {
                tracing::warn!(error = %e, "scheduler unavailable; submissions paused until next cycle");
                Ok(SubmitOutcome::Interrupted)
            }
            Err(e) => {
                tracing::warn!(error = %e, "submission rejected");
                Ok(SubmitOutcome::Skipped)
            }
        }
    }

    fn post(&self, update: Update) -> Result<()> {
        self.mailbox.post(&update)?;
        Ok(())
    }
}

fn terminal_update(task: &Task, meta: &JobMetadata) -> Update {
    let update = Update::new(&task.run_name, task.process_type, meta.status)
        .with_job_id(Some(meta.job_id))
        .with_usage(meta.usage.clone());
    match (meta.found, meta.status) {
        (false, status) => update.with_error(format!(
            "job {} left the queue without accounting; recorded as {status}",
            meta.job_id
        )),
        (true, Status::Failed) => {
            update.with_error(format!("job {} failed on the scheduler", meta.job_id))
        }
        _ => update,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
