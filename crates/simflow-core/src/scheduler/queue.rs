//! Header-validated parsing of queue-status output.

use super::{SchedulerError, SchedulerResult};

/// Which whitespace-separated column holds the status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColumn {
    Index(usize),
    /// Counted from the right: `FromEnd(1)` is the last column.
    FromEnd(usize),
}

/// Layout of one scheduler's queue listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFormat {
    /// Text the header line must contain.
    pub header: &'static str,
    /// Zero-based line the header is expected on.
    pub header_line: usize,
    pub status_column: StatusColumn,
    /// Whether completely empty output means an empty queue rather than a
    /// malformed response.
    pub empty_is_idle: bool,
}

/// One parsed queue row: numeric job id and raw status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
    pub job_id: u64,
    pub status: String,
}

impl QueueFormat {
    /// Parse `stdout` of `command`.
    ///
    /// The header must appear where expected; otherwise the whole listing is
    /// rejected. Blank and `---` separator lines are skipped, as are column
    /// heading lines between the header and the first job row. The job id is
    /// the first column up to its first `.`.
    pub fn parse(&self, command: &str, stdout: &str) -> SchedulerResult<Vec<QueueRow>> {
        if self.empty_is_idle && stdout.trim().is_empty() {
            return Ok(Vec::new());
        }

        let lines: Vec<&str> = stdout.lines().collect();
        let header = lines.get(self.header_line).copied().unwrap_or_default();
        if !header.contains(self.header) {
            return Err(SchedulerError::malformed(
                command,
                format!(
                    "expected '{}' on line {}, found '{}'",
                    self.header,
                    self.header_line + 1,
                    header.trim()
                ),
            ));
        }

        let mut rows = Vec::new();
        for line in lines.iter().skip(self.header_line + 1) {
            let trimmed = line.trim();
            if trimmed.is_empty() || is_separator(trimmed) {
                continue;
            }
            let cols: Vec<&str> = trimmed.split_whitespace().collect();
            let id_text = cols[0].split('.').next().unwrap_or_default();
            let Ok(job_id) = id_text.parse::<u64>() else {
                if rows.is_empty() {
                    continue;
                }
                return Err(SchedulerError::malformed(
                    command,
                    format!("non-numeric job id in row '{trimmed}'"),
                ));
            };
            let status = match self.status_column {
                StatusColumn::Index(i) => cols.get(i),
                StatusColumn::FromEnd(n) => cols.len().checked_sub(n).and_then(|i| cols.get(i)),
            };
            let Some(status) = status.filter(|_| cols.len() > 1) else {
                return Err(SchedulerError::malformed(
                    command,
                    format!("missing status column in row '{trimmed}'"),
                ));
            };
            rows.push(QueueRow {
                job_id,
                status: status.to_string(),
            });
        }
        Ok(rows)
    }
}

fn is_separator(line: &str) -> bool {
    line.chars().all(|c| c == '-' || c.is_whitespace())
}
