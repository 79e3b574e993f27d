use crate::output::print_json;
use simflow_core::types::ProcessType;
use std::path::Path;

pub fn run(root: &Path, runs: &[String], stages: &[String], json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let store = super::open_store(root, &config)?;

    let stages: Vec<ProcessType> = if stages.is_empty() {
        ProcessType::all().to_vec()
    } else {
        stages
            .iter()
            .map(|s| super::parse_stage(s.trim()))
            .collect::<anyhow::Result<_>>()?
    };

    let mut results = Vec::new();
    for run in runs {
        let created = store.install(run, &stages)?;
        results.push(serde_json::json!({ "run_name": run, "created": created }));
        if !json {
            if created == 0 {
                println!("{run}: already installed");
            } else {
                println!("{run}: installed {created} task(s)");
            }
        }
    }

    if json {
        print_json(&results)?;
    }
    Ok(())
}
