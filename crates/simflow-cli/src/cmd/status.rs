use crate::output::{opt, print_json, print_table};
use chrono::Utc;
use simflow_core::health;
use simflow_core::store::TaskStore;
use simflow_core::task::Task;
use std::path::Path;
use std::time::Duration;

pub fn run(
    root: &Path,
    run_name: Option<&str>,
    stage: Option<&str>,
    pattern: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let store = super::open_store(root, &config)?;

    match (run_name, stage) {
        (Some(run), _) => {
            let mut tasks = store.list_for_run(run)?;
            if let Some(stage) = stage {
                let process_type = super::parse_stage(stage)?;
                tasks.retain(|t| t.process_type == process_type);
            }
            show_tasks(&tasks, json)
        }
        (None, Some(stage)) => {
            let process_type = super::parse_stage(stage)?;
            let tasks = store.list_by_process(process_type, pattern)?;
            show_tasks(&tasks, json)
        }
        (None, None) => show_summary(&store, config.stale_after(), json),
    }
}

// ---------------------------------------------------------------------------
// Task listing
// ---------------------------------------------------------------------------

fn show_tasks(tasks: &[Task], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("No matching tasks.");
        return Ok(());
    }
    let rows = tasks
        .iter()
        .map(|t| {
            vec![
                t.run_name.clone(),
                t.process_type.to_string(),
                t.status.to_string(),
                opt(t.job_id),
                t.retries.to_string(),
                opt(t.cores_used),
                opt(t.run_time_seconds),
            ]
        })
        .collect();
    print_table(
        &["RUN", "STAGE", "STATUS", "JOB", "RETRIES", "CORES", "RUNTIME"],
        rows,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

fn show_summary(store: &TaskStore, stale_after: Duration, json: bool) -> anyhow::Result<()> {
    // A dead run loop cannot record its own stall, so check here too.
    let collection_error = health::check_staleness(store, Utc::now(), stale_after)?;
    let counts = store.status_counts()?;
    let progress = store.run_progress()?;
    let failures = store.failures()?;

    if json {
        let counts: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(s, n)| (s.to_string(), serde_json::Value::from(*n)))
            .collect();
        return print_json(&serde_json::json!({
            "counts": counts,
            "runs": progress,
            "failures": failures,
            "collection_error": collection_error,
        }));
    }

    if let Some(err) = &collection_error {
        println!(
            "COLLECTION FAILURE since {}: {}\n",
            err.since.format("%Y-%m-%d %H:%M:%S"),
            err.detail
        );
    }

    let rows = counts
        .iter()
        .map(|(s, n)| vec![s.to_string(), n.to_string()])
        .collect();
    print_table(&["STATUS", "TASKS"], rows);

    if !progress.is_empty() {
        println!();
        let rows = progress
            .iter()
            .map(|p| {
                vec![
                    p.run_name.clone(),
                    format!("{}/{}", p.completed, p.total),
                    p.active.to_string(),
                    p.failed.to_string(),
                ]
            })
            .collect();
        print_table(&["RUN", "COMPLETED", "ACTIVE", "FAILED"], rows);
    }

    if !failures.is_empty() {
        println!("\nFailed with retries exhausted:");
        for t in &failures {
            println!(
                "  {} (job {}, {} retries): {}",
                t.label(),
                opt(t.job_id),
                t.retries,
                t.last_error.as_deref().unwrap_or("no error recorded")
            );
        }
    }
    Ok(())
}
