use crate::output::{print_json, print_table};
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let adapter = super::build_adapter(&config)?;

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let jobs = rt
        .block_on(adapter.list_queue())
        .context("failed to read the scheduler queue")?;

    if json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    let rows = jobs
        .iter()
        .map(|j| vec![j.job_id.to_string(), j.raw_status.clone(), j.status.to_string()])
        .collect();
    print_table(&["JOB", "CODE", "STATUS"], rows);
    Ok(())
}
