use crate::output::print_json;
use anyhow::Context;
use simflow_core::mailbox::Update;
use simflow_core::types::Status;
use std::path::Path;

pub fn run(root: &Path, run_name: &str, stage: &str, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let store = super::open_store(root, &config)?;
    let mailbox = super::open_mailbox(root, &config);
    let process_type = super::parse_stage(stage)?;

    let task = store.get(run_name, process_type)?;
    if store.policy().is_terminal(&task) {
        anyhow::bail!("{} is already {}", task.label(), task.status);
    }

    let cancelled_job = match (task.status.is_active(), task.job_id) {
        (true, Some(job_id)) => {
            let adapter = super::build_adapter(&config)?;
            let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            rt.block_on(adapter.cancel(job_id))
                .with_context(|| format!("failed to cancel job {job_id}"))?;
            Some(job_id)
        }
        _ => None,
    };

    let update = Update::new(run_name, process_type, Status::Killed)
        .with_job_id(task.job_id)
        .with_error("cancelled by operator");
    let entry = mailbox.post(&update)?;

    if json {
        print_json(&serde_json::json!({
            "task": task.label(),
            "cancelled_job": cancelled_job,
            "file": entry.name,
        }))?;
    } else {
        match cancelled_job {
            Some(job_id) => println!("Cancelled job {job_id}; posted {}", entry.name),
            None => println!("Posted {}", entry.name),
        }
    }
    Ok(())
}
