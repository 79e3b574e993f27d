//! Locating the job script of a task.
//!
//! Script text is produced by external tooling; this module only resolves
//! where it lives from a per-stage path template.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::paths;
use crate::scheduler::SchedulerKind;
use crate::task::Task;
use crate::types::ProcessType;

/// Placeholders a script template may use.
pub const PLACEHOLDERS: &[&str] = &["root", "runs_dir", "fault", "run_name", "stage", "ext"];

/// Template used for stages without their own entry.
pub const DEFAULT_TEMPLATE: &str = "{runs_dir}/{fault}/{run_name}/run_{stage}.{ext}";

/// A script ready to hand to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    /// Working directory for the submission.
    pub run_dir: PathBuf,
    pub script: PathBuf,
}

pub trait ScriptLocator: Send + Sync {
    /// Resolve the script for `task`; `None` when it does not exist yet.
    fn locate(&self, task: &Task) -> Option<JobScript>;
}

/// Resolves scripts by expanding per-stage path templates.
#[derive(Debug, Clone)]
pub struct TemplateLocator {
    root: PathBuf,
    runs_dir: PathBuf,
    extension: &'static str,
    templates: BTreeMap<ProcessType, String>,
}

impl TemplateLocator {
    pub fn new(
        root: &Path,
        runs_dir: &Path,
        kind: SchedulerKind,
        templates: BTreeMap<ProcessType, String>,
    ) -> Self {
        let runs_dir = if runs_dir.is_absolute() {
            runs_dir.to_path_buf()
        } else {
            root.join(runs_dir)
        };
        Self {
            root: root.to_path_buf(),
            runs_dir,
            extension: kind.script_extension(),
            templates,
        }
    }

    fn template(&self, process_type: ProcessType) -> &str {
        self.templates
            .get(&process_type)
            .map(String::as_str)
            .unwrap_or(DEFAULT_TEMPLATE)
    }

    /// Expand the template for `task` without checking the file exists.
    pub fn expand(&self, task: &Task) -> PathBuf {
        let expanded = self
            .template(task.process_type)
            .replace("{root}", &self.root.to_string_lossy())
            .replace("{runs_dir}", &self.runs_dir.to_string_lossy())
            .replace("{fault}", paths::fault_name(&task.run_name))
            .replace("{run_name}", &task.run_name)
            .replace("{stage}", task.process_type.as_str())
            .replace("{ext}", self.extension);
        let path = PathBuf::from(expanded);
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }
}

impl ScriptLocator for TemplateLocator {
    fn locate(&self, task: &Task) -> Option<JobScript> {
        let script = self.expand(task);
        if !script.is_file() {
            return None;
        }
        let run_dir = script
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        Some(JobScript { run_dir, script })
    }
}

/// Placeholders in `template` that are not in [`PLACEHOLDERS`].
pub fn unknown_placeholders(template: &str) -> Vec<String> {
    let mut unknown = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else { break };
        let name = &after[..close];
        if !PLACEHOLDERS.contains(&name) {
            unknown.push(name.to_string());
        }
        rest = &after[close + 1..];
    }
    unknown
}
