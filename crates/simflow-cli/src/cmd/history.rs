use crate::output::{opt, print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, run_name: &str, stage: &str, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let store = super::open_store(root, &config)?;
    let process_type = super::parse_stage(stage)?;

    // fail on unknown tasks rather than printing an empty trail
    store.get(run_name, process_type)?;
    let records = store.history(run_name, process_type)?;

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No transitions recorded for {run_name}/{process_type}.");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.applied_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                r.from.to_string(),
                r.to.to_string(),
                opt(r.job_id),
                r.retries.to_string(),
                opt(r.error.as_deref()),
            ]
        })
        .collect();
    print_table(&["APPLIED", "FROM", "TO", "JOB", "RETRIES", "ERROR"], rows);
    Ok(())
}
