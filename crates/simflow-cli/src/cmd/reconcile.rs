use crate::output::print_json;
use simflow_core::reconciler::Reconciler;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let store = super::open_store(root, &config)?;
    let mailbox = super::open_mailbox(root, &config);

    let report = Reconciler::new(&store, &mailbox).drain()?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "Applied {}, unchanged {}, rejected {}, malformed {}",
            report.applied, report.unchanged, report.rejected, report.malformed
        );
    }
    Ok(())
}
