use crate::output::print_json;
use anyhow::Context;
use simflow_core::script::TemplateLocator;
use simflow_core::submit::{AutoSubmitter, RunOptions};
use std::path::Path;

pub fn run(
    root: &Path,
    once: bool,
    until_idle: bool,
    max_submissions: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(root)?;

    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|w| w.level == simflow_core::config::WarnLevel::Error)
        .map(|w| w.message)
        .collect();
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }

    let store = super::open_store(root, &config)?;
    let mailbox = super::open_mailbox(root, &config);
    let adapter = super::build_adapter(&config)?;
    let locator = TemplateLocator::new(
        root,
        &config.runs_dir,
        adapter.kind(),
        config.scripts.clone(),
    );
    let submitter = AutoSubmitter::new(&config, store, mailbox, adapter, Box::new(locator));

    let opts = RunOptions {
        once,
        until_idle,
        max_submissions,
    };

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let summary = rt.block_on(async {
        let shutdown = async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted; finishing up");
            }
        };
        submitter.run(&opts, shutdown).await
    })?;

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "Stopped ({:?}) after {} cycle(s), {} submission(s)",
            summary.stopped, summary.cycles, summary.submitted
        );
    }
    Ok(())
}
