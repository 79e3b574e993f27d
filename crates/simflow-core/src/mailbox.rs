//! Append-only directory of task transition requests.
//!
//! Writers never touch the task store. Each request is one JSON file named
//!
//! ```text
//! <YYYYmmddHHMMSS_nnnnnnnnn>.<run_name>.<process_type>
//! ```
//!
//! so a lexicographic listing is also a timestamp-ordered one. Files are
//! staged under a `.tmp` prefix and moved into place without clobbering; a
//! name that already exists is a [`SimflowError::DuplicateUpdate`]. Any other
//! file found in the directory is moved into `unrecognised/` the first time
//! the mailbox is listed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimflowError};
use crate::io;
use crate::paths;
use crate::task::JobUsage;
use crate::types::{ProcessType, Status};

const NAME_TS_FORMAT: &str = "%Y%m%d%H%M%S_%9f";

/// Subdirectory receiving files that are not updates.
pub const UNRECOGNISED_DIR: &str = "unrecognised";

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// A request to move one task to `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub run_name: String,
    pub process_type: ProcessType,
    pub status: Status,
    #[serde(default)]
    pub job_id: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<JobUsage>,
}

impl Update {
    pub fn new(run_name: impl Into<String>, process_type: ProcessType, status: Status) -> Self {
        Self {
            run_name: run_name.into(),
            process_type,
            status,
            job_id: None,
            error: None,
            usage: None,
        }
    }

    pub fn with_job_id(mut self, job_id: Option<u64>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_usage(mut self, usage: JobUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

// ---------------------------------------------------------------------------
// MailboxEntry
// ---------------------------------------------------------------------------

/// A pending update file, identified by its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub run_name: String,
    pub process_type: String,
    pub path: PathBuf,
}

impl MailboxEntry {
    fn parse(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        let mut parts = name.splitn(3, '.');
        let ts = parts.next()?;
        let run_name = parts.next()?;
        let process_type = parts.next()?;
        if run_name.is_empty() || process_type.is_empty() || process_type.contains('.') {
            return None;
        }
        let timestamp = NaiveDateTime::parse_from_str(ts, NAME_TS_FORMAT)
            .ok()?
            .and_utc();
        Some(Self {
            run_name: run_name.to_string(),
            process_type: process_type.to_string(),
            name,
            timestamp,
            path,
        })
    }

    pub fn is_for(&self, run_name: &str, process_type: ProcessType) -> bool {
        self.run_name == run_name && self.process_type == process_type.as_str()
    }

    /// Read and decode the update stored in this entry.
    pub fn read(&self) -> Result<Update> {
        let data = std::fs::read(&self.path)?;
        let update: Update =
            serde_json::from_slice(&data).map_err(|e| SimflowError::MalformedUpdate {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        if !self.is_for(&update.run_name, update.process_type) {
            return Err(SimflowError::MalformedUpdate {
                name: self.name.clone(),
                reason: format!(
                    "content is for {}/{}, name disagrees",
                    update.run_name, update.process_type
                ),
            });
        }
        Ok(update)
    }
}

pub fn entry_name(ts: DateTime<Utc>, run_name: &str, process_type: ProcessType) -> String {
    format!("{}.{}.{}", ts.format(NAME_TS_FORMAT), run_name, process_type)
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

pub struct Mailbox {
    dir: PathBuf,
    archive: Option<PathBuf>,
    /// Last timestamp handed out by this writer; names are strictly increasing.
    last_ts: Mutex<Option<DateTime<Utc>>>,
}

impl Mailbox {
    /// A mailbox that deletes updates once they are consumed.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            archive: None,
            last_ts: Mutex::new(None),
        }
    }

    /// A mailbox that moves consumed updates into `archive`.
    pub fn with_archive(mut self, archive: impl Into<PathBuf>) -> Self {
        self.archive = Some(archive.into());
        self
    }

    /// The mailbox under a simflow root, archiving when `archive` is set.
    pub fn for_root(root: &Path, archive: bool) -> Self {
        let mailbox = Self::new(paths::mailbox_dir(root));
        if archive {
            mailbox.with_archive(paths::archive_dir(root))
        } else {
            mailbox
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = self
            .last_ts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ts = match *last {
            Some(prev) if now <= prev => prev + Duration::nanoseconds(1),
            _ => now,
        };
        *last = Some(ts);
        ts
    }

    /// Write `update` as a new mailbox file.
    pub fn post(&self, update: &Update) -> Result<MailboxEntry> {
        paths::validate_run_name(&update.run_name)?;
        let timestamp = self.next_timestamp();
        let name = entry_name(timestamp, &update.run_name, update.process_type);
        let path = self.dir.join(&name);

        tracing::debug!(
            run = %update.run_name,
            stage = %update.process_type,
            status = %update.status,
            job_id = ?update.job_id,
            file = %name,
            "posting update"
        );

        let data = serde_json::to_vec(update)?;
        io::atomic_create(&path, &data)?;

        Ok(MailboxEntry {
            name,
            timestamp,
            run_name: update.run_name.clone(),
            process_type: update.process_type.to_string(),
            path,
        })
    }

    /// All pending entries in timestamp order.
    ///
    /// Temp files are skipped; names that do not follow the mailbox format are
    /// set aside.
    pub fn pending(&self) -> Result<Vec<MailboxEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_file() {
                continue;
            }
            let path = dirent.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(io::TEMP_PREFIX));
            if is_temp {
                continue;
            }
            match MailboxEntry::parse(path.clone()) {
                Some(entry) => entries.push(entry),
                None => self.set_aside(&path),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Move a file that is not an update out of the listing.
    fn set_aside(&self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let target = self.dir.join(UNRECOGNISED_DIR).join(name);
        let moved = io::ensure_dir(&self.dir.join(UNRECOGNISED_DIR))
            .and_then(|()| std::fs::rename(path, &target).map_err(Into::into));
        match moved {
            Ok(()) => tracing::warn!(
                file = %name.to_string_lossy(),
                moved_to = %target.display(),
                "file with unexpected name moved out of the mailbox"
            ),
            Err(e) => tracing::debug!(
                file = %name.to_string_lossy(),
                error = %e,
                "ignoring file with unexpected name in mailbox"
            ),
        }
    }

    /// Whether an unconsumed update exists for this task.
    pub fn has_pending(&self, run_name: &str, process_type: ProcessType) -> Result<bool> {
        Ok(self
            .pending()?
            .iter()
            .any(|e| e.is_for(run_name, process_type)))
    }

    /// Remove a consumed entry, or move it to the archive.
    ///
    /// An entry that is already gone was retired by another consumer.
    pub fn retire(&self, entry: &MailboxEntry) -> Result<()> {
        let result = match &self.archive {
            Some(archive) => {
                io::ensure_dir(archive)?;
                std::fs::rename(&entry.path, archive.join(&entry.name))
            }
            None => std::fs::remove_file(&entry.path),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queued(run: &str, job: u64) -> Update {
        Update::new(run, ProcessType::Emod3d, Status::Queued).with_job_id(Some(job))
    }

    #[test]
    fn post_then_read_back() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path().join("mailbox"));
        let entry = mb.post(&queued("Hossack_REL01", 100)).unwrap();
        assert!(entry.name.ends_with(".Hossack_REL01.emod3d"));

        let pending = mb.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0], entry);
        assert_eq!(pending[0].read().unwrap(), queued("Hossack_REL01", 100));
    }

    #[test]
    fn file_content_has_documented_fields() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path());
        let entry = mb.post(&queued("Hossack_REL01", 100)).unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&entry.path).unwrap()).unwrap();
        assert_eq!(raw["run_name"], "Hossack_REL01");
        assert_eq!(raw["process_type"], "emod3d");
        assert_eq!(raw["status"], "queued");
        assert_eq!(raw["job_id"], 100);
        assert!(raw["error"].is_null());
    }

    #[test]
    fn rapid_posts_for_same_task_stay_ordered_and_distinct() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path());
        let mut names = Vec::new();
        for job in 0..50 {
            names.push(mb.post(&queued("A", job)).unwrap().name);
        }
        let pending: Vec<String> = mb.pending().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(pending, names);
    }

    #[test]
    fn name_collision_is_duplicate_update() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path());
        let entry = mb.post(&queued("A", 1)).unwrap();
        let err = io::atomic_create(&entry.path, b"{}").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn pending_skips_temp_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path());
        std::fs::write(dir.path().join(".tmpXYZ"), b"partial").unwrap();
        std::fs::write(dir.path().join("README"), b"not an update").unwrap();
        mb.post(&queued("A", 1)).unwrap();
        assert_eq!(mb.pending().unwrap().len(), 1);
        assert!(dir.path().join(".tmpXYZ").exists());
    }

    #[test]
    fn foreign_files_are_set_aside_once() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path());
        std::fs::write(dir.path().join("README"), b"not an update").unwrap();

        assert!(mb.pending().unwrap().is_empty());
        assert!(!dir.path().join("README").exists());
        let moved = dir.path().join(UNRECOGNISED_DIR).join("README");
        assert_eq!(std::fs::read(&moved).unwrap(), b"not an update");

        // the subdirectory itself is never listed
        mb.post(&queued("A", 1)).unwrap();
        assert_eq!(mb.pending().unwrap().len(), 1);
    }

    #[test]
    fn has_pending_matches_run_and_stage() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path());
        mb.post(&queued("A", 1)).unwrap();
        assert!(mb.has_pending("A", ProcessType::Emod3d).unwrap());
        assert!(!mb.has_pending("A", ProcessType::Hf).unwrap());
        assert!(!mb.has_pending("B", ProcessType::Emod3d).unwrap());
    }

    #[test]
    fn retire_archives_when_configured() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        let mb = Mailbox::new(dir.path().join("mailbox")).with_archive(&archive);
        let entry = mb.post(&queued("A", 1)).unwrap();
        mb.retire(&entry).unwrap();
        assert!(mb.pending().unwrap().is_empty());
        assert!(archive.join(&entry.name).exists());
        // second retire of the same entry is a no-op
        mb.retire(&entry).unwrap();
    }

    #[test]
    fn mismatched_content_is_malformed() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path());
        let entry = mb.post(&queued("A", 1)).unwrap();
        std::fs::write(&entry.path, serde_json::to_vec(&queued("B", 1)).unwrap()).unwrap();
        assert!(matches!(
            entry.read().unwrap_err(),
            SimflowError::MalformedUpdate { .. }
        ));
    }

    #[test]
    fn invalid_run_name_is_refused() {
        let dir = TempDir::new().unwrap();
        let mb = Mailbox::new(dir.path());
        assert!(mb.post(&queued("bad.name", 1)).is_err());
    }
}
