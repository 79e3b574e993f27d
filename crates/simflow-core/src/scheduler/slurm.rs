//! Slurm adapter: `sbatch`, `scancel`, `squeue`, `sacct`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use super::queue::{QueueFormat, StatusColumn};
use super::{
    parse_job_id, AdapterSettings, CommandRunner, JobMetadata, SchedulerAdapter, SchedulerError,
    SchedulerJob, SchedulerKind, SchedulerResult,
};
use crate::task::JobUsage;
use crate::types::Status;

const SQUEUE_FORMAT: QueueFormat = QueueFormat {
    header: "JOBID",
    header_line: 0,
    status_column: StatusColumn::Index(1),
    empty_is_idle: false,
};

const SACCT_FIELDS: &str = "JobIDRaw,Start,End,ElapsedRaw,AllocCPUS,State";
const SACCT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Map a `squeue` short state code.
pub fn queue_status(code: &str) -> Status {
    match code {
        "R" | "CG" => Status::Running,
        "PD" | "CF" => Status::Queued,
        "CD" => Status::Completed,
        _ => Status::Failed,
    }
}

/// Map a `sacct` state; `CANCELLED by 1234` reads as `CANCELLED`.
pub fn accounting_status(state: &str) -> Status {
    match state.split_whitespace().next().unwrap_or_default() {
        "COMPLETED" => Status::Completed,
        "RUNNING" | "COMPLETING" => Status::Running,
        "PENDING" | "REQUEUED" | "CONFIGURING" | "SUSPENDED" => Status::Queued,
        "CANCELLED" => Status::Killed,
        _ => Status::Failed,
    }
}

/// `sacct` prints wall-clock times in the cluster's local zone.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), SACCT_TIME_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

pub struct SlurmAdapter {
    settings: AdapterSettings,
    runner: Arc<dyn CommandRunner>,
}

impl SlurmAdapter {
    pub fn new(settings: AdapterSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    fn parse_sacct(&self, job_id: u64, stdout: &str) -> SchedulerResult<JobMetadata> {
        let wanted = job_id.to_string();
        let Some(line) = stdout
            .lines()
            .find(|l| l.split('|').next() == Some(wanted.as_str()))
        else {
            return Ok(JobMetadata::missing(job_id, self.settings.missing_metadata));
        };

        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 6 {
            return Err(SchedulerError::malformed(
                "sacct",
                format!("expected 6 fields, got {} in '{line}'", fields.len()),
            ));
        }
        Ok(JobMetadata {
            job_id,
            status: accounting_status(fields[5]),
            usage: JobUsage {
                start_time: parse_time(fields[1]),
                end_time: parse_time(fields[2]),
                run_time_seconds: fields[3].trim().parse().ok(),
                cores: fields[4].trim().parse().ok(),
            },
            found: true,
        })
    }
}

#[async_trait]
impl SchedulerAdapter for SlurmAdapter {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    async fn submit(&self, run_dir: &Path, script: &Path) -> SchedulerResult<u64> {
        let mut args = Vec::new();
        if let Some(account) = &self.settings.account {
            args.push(format!("--account={account}"));
        }
        args.push(script.display().to_string());

        let out = self.runner.run("sbatch", &args, Some(run_dir)).await?;
        let stderr = out.stderr.trim();
        if !stderr.is_empty() {
            return Err(SchedulerError::submission(script, stderr));
        }
        if !out.success() {
            return Err(SchedulerError::submission(
                script,
                format!("sbatch exited with {:?}", out.code),
            ));
        }
        parse_job_id(script, &out.stdout)
    }

    async fn cancel(&self, job_id: u64) -> SchedulerResult<()> {
        self.runner
            .run("scancel", &[job_id.to_string()], None)
            .await?
            .require_success("scancel")?;
        Ok(())
    }

    async fn list_queue(&self) -> SchedulerResult<Vec<SchedulerJob>> {
        let mut args = Vec::new();
        if let Some(user) = &self.settings.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        args.push("-o".to_string());
        args.push("%A %t".to_string());

        let out = self
            .runner
            .run("squeue", &args, None)
            .await?
            .require_success("squeue")?;
        let rows = SQUEUE_FORMAT.parse("squeue", &out.stdout)?;
        Ok(rows
            .into_iter()
            .map(|row| SchedulerJob {
                job_id: row.job_id,
                status: queue_status(&row.status),
                raw_status: row.status,
            })
            .collect())
    }

    async fn job_metadata(&self, job_id: u64) -> SchedulerResult<JobMetadata> {
        let args = vec![
            "-X".to_string(),
            "-n".to_string(),
            "-P".to_string(),
            "-j".to_string(),
            job_id.to_string(),
            "-o".to_string(),
            SACCT_FIELDS.to_string(),
        ];
        let out = self
            .runner
            .run("sacct", &args, None)
            .await?
            .require_success("sacct")?;
        self.parse_sacct(job_id, &out.stdout)
    }
}
