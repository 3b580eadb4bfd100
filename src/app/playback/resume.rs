use anyhow::Result;

use crate::db::Database;

use super::COMPLETION_PERCENT;

/// Offset in seconds to resume `episode` at, or `0.0` to start over.
///
/// Only the newest incomplete record counts. Records at or past the
/// completion threshold restart from zero instead of landing in the credits.
pub(crate) fn resolve_resume(db: &Database, tracker_id: i64, episode: u32) -> Result<f64> {
    let Some(record) = db.latest_incomplete_for_tracker(tracker_id, episode)? else {
        return Ok(0.0);
    };
    if record.progress_percent >= COMPLETION_PERCENT {
        return Ok(0.0);
    }
    Ok(record.progress_seconds.max(0.0))
}
