use anyhow::Context;
use simflow_core::{config::Config, io, paths, store::TaskStore};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    io::ensure_dir(&paths::mailbox_dir(root)).context("failed to create mailbox")?;

    let config_path = paths::config_path(root);
    let config = if config_path.exists() {
        Config::load(root).context("failed to load existing config")?
    } else {
        let config = Config::new();
        config.save(root).context("failed to write config")?;
        println!("Created {}", config_path.display());
        config
    };

    if config.mailbox.archive {
        io::ensure_dir(&paths::archive_dir(root)).context("failed to create mailbox archive")?;
    }

    TaskStore::open(&paths::store_path(root), config.retry_policy())
        .context("failed to create task store")?;

    println!("Initialized simflow in {}", root.display());
    Ok(())
}
