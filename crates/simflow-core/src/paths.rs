use crate::error::{Result, SimflowError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const SIMFLOW_DIR: &str = ".simflow";
pub const MAILBOX_DIR: &str = ".simflow/mailbox";
pub const ARCHIVE_DIR: &str = ".simflow/mailbox/archive";

pub const CONFIG_FILE: &str = ".simflow/config.yaml";
pub const STORE_FILE: &str = ".simflow/tasks.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn simflow_dir(root: &Path) -> PathBuf {
    root.join(SIMFLOW_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn store_path(root: &Path) -> PathBuf {
    root.join(STORE_FILE)
}

pub fn mailbox_dir(root: &Path) -> PathBuf {
    root.join(MAILBOX_DIR)
}

pub fn archive_dir(root: &Path) -> PathBuf {
    root.join(ARCHIVE_DIR)
}

// ---------------------------------------------------------------------------
// Realisation names
// ---------------------------------------------------------------------------

static RUN_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn run_name_re() -> &'static Regex {
    RUN_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").unwrap())
}

/// Run names end up in mailbox file names, where `.` separates fields.
pub fn validate_run_name(run_name: &str) -> Result<()> {
    if run_name.len() > 128 || !run_name_re().is_match(run_name) {
        return Err(SimflowError::InvalidRunName(run_name.to_string()));
    }
    Ok(())
}

/// Fault name of a realisation: `Hossack_REL01` → `Hossack`.
pub fn fault_name(run_name: &str) -> &str {
    run_name.split('_').next().unwrap_or(run_name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
