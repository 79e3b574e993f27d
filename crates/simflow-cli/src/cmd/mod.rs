pub mod cancel;
pub mod config;
pub mod history;
pub mod init;
pub mod install;
pub mod queue;
pub mod reconcile;
pub mod run;
pub mod status;
pub mod update;

use anyhow::Context;
use simflow_core::config::Config;
use simflow_core::mailbox::Mailbox;
use simflow_core::scheduler::{self, SchedulerAdapter};
use simflow_core::store::TaskStore;
use simflow_core::types::ProcessType;
use std::path::Path;

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

pub(crate) fn load_config(root: &Path) -> anyhow::Result<Config> {
    Config::load(root).context("failed to load config")
}

pub(crate) fn open_store(root: &Path, config: &Config) -> anyhow::Result<TaskStore> {
    TaskStore::open_root(root, config.retry_policy()).context("failed to open task store")
}

pub(crate) fn open_mailbox(root: &Path, config: &Config) -> Mailbox {
    Mailbox::for_root(root, config.mailbox.archive)
}

pub(crate) fn build_adapter(config: &Config) -> anyhow::Result<Box<dyn SchedulerAdapter>> {
    let kind = config
        .scheduler
        .resolve_kind()
        .context("cannot select a scheduler")?;
    tracing::debug!(scheduler = %kind, "using scheduler");
    Ok(scheduler::build_system(
        kind,
        config.scheduler.adapter_settings(),
        config.scheduler.command_timeout(),
    ))
}

pub(crate) fn parse_stage(stage: &str) -> anyhow::Result<ProcessType> {
    stage
        .parse()
        .with_context(|| format!("unknown stage '{stage}'"))
}
