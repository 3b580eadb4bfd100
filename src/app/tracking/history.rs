use anyhow::Result;

use crate::app::episode::next_unit_number;
use crate::app::playback::watched_percent;
use crate::db::{Database, MediaKind, NewHistoryRecord};

/// One progress write for a unit. `completed` is decided by the caller; the
/// recorder never re-derives it from the percentage.
#[derive(Debug, Clone)]
pub(crate) struct ProgressWrite<'a> {
    pub(crate) media_id: &'a str,
    pub(crate) title: &'a str,
    pub(crate) media_kind: MediaKind,
    pub(crate) tracker_id: Option<i64>,
    pub(crate) provider: &'a str,
    pub(crate) episode: u32,
    pub(crate) season: u32,
    pub(crate) current_seconds: f64,
    pub(crate) total_seconds: f64,
    pub(crate) completed: bool,
    /// Whether a following unit exists to receive a placeholder row.
    pub(crate) has_next_unit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordAction {
    Completed { replaced_incomplete: usize },
    UpdatedInPlace,
    Inserted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordResult {
    pub(crate) action: RecordAction,
    pub(crate) placeholder_episode: Option<u32>,
}

pub(crate) struct HistoryRecorder<'a> {
    db: &'a Database,
}

impl<'a> HistoryRecorder<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub(crate) fn record_progress(&self, write: &ProgressWrite<'_>) -> Result<RecordResult> {
        let percent = watched_percent(write.current_seconds, write.total_seconds);

        if !write.completed {
            if self.update_in_place(write, percent)? {
                return Ok(RecordResult {
                    action: RecordAction::UpdatedInPlace,
                    placeholder_episode: None,
                });
            }
            self.db.insert_history(&self.row(write, percent))?;
            return Ok(RecordResult {
                action: RecordAction::Inserted,
                placeholder_episode: None,
            });
        }

        // Incomplete rows go first so none survive once the unit is finished.
        let replaced = self.db.delete_incomplete(write.media_id, write.episode)?;
        if !self.update_in_place(write, percent)? {
            self.db.insert_history(&self.row(write, percent))?;
        }
        log::info!(
            "recorded {} episode {} as completed ({percent:.1}%)",
            write.title,
            write.episode
        );

        Ok(RecordResult {
            action: RecordAction::Completed {
                replaced_incomplete: replaced,
            },
            placeholder_episode: self.write_next_placeholder(write),
        })
    }

    fn update_in_place(&self, write: &ProgressWrite<'_>, percent: f64) -> Result<bool> {
        self.db.update_progress_in_place(
            write.media_id,
            write.episode,
            write.completed,
            write.current_seconds,
            write.total_seconds,
            percent,
            write.provider,
        )
    }

    fn row(&self, write: &ProgressWrite<'_>, percent: f64) -> NewHistoryRecord {
        NewHistoryRecord {
            media_id: write.media_id.to_string(),
            title: write.title.to_string(),
            media_kind: write.media_kind,
            episode: write.episode,
            season: write.season,
            progress_seconds: write.current_seconds,
            total_seconds: write.total_seconds,
            progress_percent: percent,
            completed: write.completed,
            tracker_id: write.tracker_id,
            provider: write.provider.to_string(),
        }
    }

    /// The completed row is already durable, so failures here are only logged.
    fn write_next_placeholder(&self, write: &ProgressWrite<'_>) -> Option<u32> {
        if write.media_kind == MediaKind::Movie || !write.has_next_unit {
            return None;
        }
        let next = next_unit_number(write.episode);
        let placeholder = NewHistoryRecord {
            episode: next,
            progress_seconds: 0.0,
            total_seconds: 0.0,
            progress_percent: 0.0,
            completed: false,
            ..self.row(write, 0.0)
        };
        match self.db.insert_placeholder(&placeholder) {
            Ok(true) => Some(next),
            Ok(false) => None,
            Err(err) => {
                log::warn!(
                    "failed to write placeholder for {} episode {next}: {err:#}",
                    write.title
                );
                None
            }
        }
    }
}
