use crate::output::print_json;
use anyhow::Context;
use simflow_core::mailbox::Update;
use simflow_core::types::Status;
use std::path::Path;

pub fn run(
    root: &Path,
    run_name: &str,
    stage: &str,
    status: &str,
    job_id: Option<u64>,
    error: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let mailbox = super::open_mailbox(root, &config);
    let process_type = super::parse_stage(stage)?;
    let status: Status = status
        .parse()
        .with_context(|| format!("unknown status '{status}'"))?;

    let mut update = Update::new(run_name, process_type, status).with_job_id(job_id);
    if let Some(error) = error {
        update = update.with_error(error);
    }
    let entry = mailbox.post(&update)?;

    if json {
        print_json(&serde_json::json!({ "file": entry.name, "update": update }))?;
    } else {
        println!("Posted {}", entry.name);
    }
    Ok(())
}
