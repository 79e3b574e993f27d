//! Detection of a stalled collection pipeline.
//!
//! When neither an update nor a successful poll has been recorded for longer
//! than the threshold, a `collection_failure` condition is persisted in the
//! store. It stays open (with its original `since`) until activity resumes.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::store::{CollectionError, TaskStore};

pub const COLLECTION_FAILURE: &str = "collection_failure";

/// Record or clear the stale-data condition; returns it while it is open.
///
/// A store with no recorded activity at all is not considered stale.
pub fn check_staleness(
    store: &TaskStore,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Result<Option<CollectionError>> {
    let Some(last) = store.last_activity()? else {
        return Ok(None);
    };

    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    let gap = now - last;
    if gap <= threshold {
        if store.clear_collection_errors(now)? > 0 {
            tracing::info!("activity resumed; collection failure cleared");
        }
        return Ok(None);
    }

    let detail = format!(
        "no update or scheduler poll recorded for {}s (threshold {}s)",
        gap.num_seconds(),
        threshold.num_seconds()
    );
    let condition = store.record_collection_error(COLLECTION_FAILURE, &detail, last)?;
    tracing::warn!(since = %condition.since, "{detail}");
    Ok(Some(condition))
}
