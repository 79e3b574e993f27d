//! PBS Pro adapter: `qsub`, `qdel`, `qstat`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use super::queue::{QueueFormat, StatusColumn};
use super::{
    parse_job_id, AdapterSettings, CommandRunner, JobMetadata, SchedulerAdapter, SchedulerError,
    SchedulerJob, SchedulerKind, SchedulerResult,
};
use crate::task::JobUsage;
use crate::types::Status;

/// `qstat -u USER`: blank line, then a `<server>:` line.
const USER_QUEUE_FORMAT: QueueFormat = QueueFormat {
    header: "pbs:",
    header_line: 1,
    status_column: StatusColumn::FromEnd(2),
    empty_is_idle: true,
};

/// Plain `qstat`.
const QUEUE_FORMAT: QueueFormat = QueueFormat {
    header: "Job id",
    header_line: 0,
    status_column: StatusColumn::FromEnd(2),
    empty_is_idle: true,
};

const QSTAT_TIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Map a `qstat` state code.
pub fn queue_status(code: &str) -> Status {
    match code {
        "R" | "E" => Status::Running,
        "Q" | "H" | "W" => Status::Queued,
        "F" => Status::Completed,
        _ => Status::Failed,
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive = NaiveDateTime::parse_from_str(&collapsed, QSTAT_TIME_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// `HH:MM:SS` (hours may exceed 24) into seconds.
fn parse_walltime(raw: &str) -> Option<u64> {
    let mut total = 0u64;
    for part in raw.trim().split(':') {
        total = total * 60 + part.parse::<u64>().ok()?;
    }
    Some(total)
}

fn as_u32(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `qstat` says this when a job has left the server's history.
fn is_unknown_job(stderr: &str) -> bool {
    stderr.contains("Unknown Job Id") || stderr.contains("Job has finished")
}

pub struct PbsAdapter {
    settings: AdapterSettings,
    runner: Arc<dyn CommandRunner>,
}

impl PbsAdapter {
    pub fn new(settings: AdapterSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    fn parse_accounting(&self, job_id: u64, stdout: &str) -> SchedulerResult<JobMetadata> {
        let doc: Value = serde_json::from_str(stdout)
            .map_err(|e| SchedulerError::malformed("qstat -f", e.to_string()))?;
        let Some(job) = doc
            .get("Jobs")
            .and_then(Value::as_object)
            .and_then(|jobs| jobs.values().next())
        else {
            return Ok(JobMetadata::missing(job_id, self.settings.missing_metadata));
        };

        let state = job
            .get("job_state")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let exit_status = job.get("Exit_status").and_then(as_i64);
        let status = match (queue_status(state), exit_status) {
            (Status::Completed, Some(code)) if code != 0 => Status::Failed,
            (s, _) => s,
        };

        let time = |key: &str| job.get(key).and_then(Value::as_str).and_then(parse_time);
        let resources = job.get("resources_used");
        let end_time = if status == Status::Completed || status == Status::Failed {
            time("mtime")
        } else {
            None
        };

        Ok(JobMetadata {
            job_id,
            status,
            usage: JobUsage {
                start_time: time("stime"),
                end_time,
                cores: resources.and_then(|r| r.get("ncpus")).and_then(as_u32),
                run_time_seconds: resources
                    .and_then(|r| r.get("walltime"))
                    .and_then(Value::as_str)
                    .and_then(parse_walltime),
            },
            found: true,
        })
    }
}

#[async_trait]
impl SchedulerAdapter for PbsAdapter {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Pbs
    }

    async fn submit(&self, run_dir: &Path, script: &Path) -> SchedulerResult<u64> {
        let mut args = Vec::new();
        if let Some(account) = &self.settings.account {
            args.push("-A".to_string());
            args.push(account.clone());
        }
        args.push(script.display().to_string());

        let out = self.runner.run("qsub", &args, Some(run_dir)).await?;
        let stderr = out.stderr.trim();
        if !stderr.is_empty() {
            return Err(SchedulerError::submission(script, stderr));
        }
        if !out.success() {
            return Err(SchedulerError::submission(
                script,
                format!("qsub exited with {:?}", out.code),
            ));
        }
        parse_job_id(script, &out.stdout)
    }

    async fn cancel(&self, job_id: u64) -> SchedulerResult<()> {
        self.runner
            .run("qdel", &[job_id.to_string()], None)
            .await?
            .require_success("qdel")?;
        Ok(())
    }

    async fn list_queue(&self) -> SchedulerResult<Vec<SchedulerJob>> {
        let (args, format) = match &self.settings.user {
            Some(user) => (vec!["-u".to_string(), user.clone()], USER_QUEUE_FORMAT),
            None => (Vec::new(), QUEUE_FORMAT),
        };
        let out = self
            .runner
            .run("qstat", &args, None)
            .await?
            .require_success("qstat")?;
        let rows = format.parse("qstat", &out.stdout)?;
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
            "-f".to_string(),
            "-F".to_string(),
            "json".to_string(),
            "-x".to_string(),
            job_id.to_string(),
        ];
        let out = self.runner.run("qstat", &args, None).await?;
        if !out.success() && is_unknown_job(&out.stderr) {
            return Ok(JobMetadata::missing(job_id, self.settings.missing_metadata));
        }
        let out = out.require_success("qstat -f")?;
        self.parse_accounting(job_id, &out.stdout)
    }
}
