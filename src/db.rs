use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Tv,
    Movie,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tv => "tv",
            Self::Movie => "movie",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "movie" => Self::Movie,
            _ => Self::Tv,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub id: i64,
    pub media_id: String,
    pub title: String,
    pub media_kind: MediaKind,
    pub episode: u32,
    pub season: u32,
    pub progress_seconds: f64,
    pub total_seconds: f64,
    pub progress_percent: f64,
    pub completed: bool,
    pub watched_at: String,
    pub tracker_id: Option<i64>,
    pub provider: String,
}

/// Row payload for inserts; `id` and `watched_at` are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryRecord {
    pub media_id: String,
    pub title: String,
    pub media_kind: MediaKind,
    pub episode: u32,
    pub season: u32,
    pub progress_seconds: f64,
    pub total_seconds: f64,
    pub progress_percent: f64,
    pub completed: bool,
    pub tracker_id: Option<i64>,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
    pub id: i64,
    pub media_ref: i64,
    pub episode: u32,
    pub progress: f64,
    pub synced: bool,
    pub created_at: String,
    pub synced_at: Option<String>,
}

const HISTORY_COLUMNS: &str = "id, media_id, title, media_kind, episode, season, progress_seconds, total_seconds, progress_percent, completed, watched_at, tracker_id, provider";
const QUEUE_COLUMNS: &str = "id, media_ref, episode, progress, synced, created_at, synced_at";

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let kind: String = row.get(3)?;
    Ok(HistoryRecord {
        id: row.get(0)?,
        media_id: row.get(1)?,
        title: row.get(2)?,
        media_kind: MediaKind::from_db(&kind),
        episode: row.get(4)?,
        season: row.get(5)?,
        progress_seconds: row.get(6)?,
        total_seconds: row.get(7)?,
        progress_percent: row.get(8)?,
        completed: row.get(9)?,
        watched_at: row.get(10)?,
        tracker_id: row.get(11)?,
        provider: row.get(12)?,
    })
}

fn queue_item_from_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    Ok(SyncQueueItem {
        id: row.get(0)?,
        media_ref: row.get(1)?,
        episode: row.get(2)?,
        progress: row.get(3)?,
        synced: row.get(4)?,
        created_at: row.get(5)?,
        synced_at: row.get(6)?,
    })
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        // The background drain runs on its own connection against the same file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS watch_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                media_id TEXT NOT NULL,
                title TEXT NOT NULL,
                media_kind TEXT NOT NULL,
                episode INTEGER NOT NULL,
                season INTEGER NOT NULL DEFAULT 1,
                progress_seconds REAL NOT NULL DEFAULT 0,
                total_seconds REAL NOT NULL DEFAULT 0,
                progress_percent REAL NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                watched_at TEXT NOT NULL,
                tracker_id INTEGER,
                provider TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_watch_history_key
                ON watch_history(media_id, episode, completed);
            CREATE INDEX IF NOT EXISTS idx_watch_history_tracker
                ON watch_history(tracker_id, episode, completed, watched_at DESC);

            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                media_ref INTEGER NOT NULL,
                episode INTEGER NOT NULL,
                progress REAL NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                synced_at TEXT,
                UNIQUE(media_ref, episode)
            );
            CREATE INDEX IF NOT EXISTS idx_sync_queue_pending
                ON sync_queue(synced, created_at);
            "#,
        )?;
        Ok(())
    }

    pub fn insert_history(&self, record: &NewHistoryRecord) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO watch_history (
                media_id, title, media_kind, episode, season, progress_seconds,
                total_seconds, progress_percent, completed, watched_at, tracker_id, provider
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.media_id,
                record.title,
                record.media_kind.as_str(),
                record.episode,
                record.season,
                record.progress_seconds,
                record.total_seconds,
                record.progress_percent,
                record.completed,
                now_timestamp(),
                record.tracker_id,
                record.provider,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Refreshes the newest row for `(media_id, episode)` with the given
    /// completion state in a single statement. Returns `false` when there is
    /// no such row.
    #[allow(clippy::too_many_arguments)]
    pub fn update_progress_in_place(
        &self,
        media_id: &str,
        episode: u32,
        completed: bool,
        progress_seconds: f64,
        total_seconds: f64,
        progress_percent: f64,
        provider: &str,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE watch_history SET
                progress_seconds = ?4,
                total_seconds = ?5,
                progress_percent = ?6,
                provider = ?7,
                watched_at = ?8
            WHERE id = (
                SELECT id FROM watch_history
                WHERE media_id = ?1 AND episode = ?2 AND completed = ?3
                ORDER BY watched_at DESC, id DESC
                LIMIT 1
            )
            "#,
            params![
                media_id,
                episode,
                completed,
                progress_seconds,
                total_seconds,
                progress_percent,
                provider,
                now_timestamp(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_incomplete(&self, media_id: &str, episode: u32) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM watch_history WHERE media_id = ?1 AND episode = ?2 AND completed = 0",
            params![media_id, episode],
        )?;
        Ok(removed)
    }

    /// Inserts `record` only when no row of any state exists for its key.
    pub fn insert_placeholder(&self, record: &NewHistoryRecord) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT INTO watch_history (
                media_id, title, media_kind, episode, season, progress_seconds,
                total_seconds, progress_percent, completed, watched_at, tracker_id, provider
            )
            SELECT ?1, ?2, ?3, ?4, ?5, 0, 0, 0, 0, ?6, ?7, ?8
            WHERE NOT EXISTS (
                SELECT 1 FROM watch_history WHERE media_id = ?1 AND episode = ?4
            )
            "#,
            params![
                record.media_id,
                record.title,
                record.media_kind.as_str(),
                record.episode,
                record.season,
                now_timestamp(),
                record.tracker_id,
                record.provider,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn latest_incomplete_for_tracker(
        &self,
        tracker_id: i64,
        episode: u32,
    ) -> Result<Option<HistoryRecord>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM watch_history \
             WHERE tracker_id = ?1 AND episode = ?2 AND completed = 0 \
             ORDER BY watched_at DESC, id DESC LIMIT 1"
        );
        let record = self
            .conn
            .query_row(&sql, params![tracker_id, episode], history_from_row)
            .optional()?;
        Ok(record)
    }

    /// Most recently touched row for a media, used to pick where to continue.
    pub fn latest_for_media(&self, media_id: &str) -> Result<Option<HistoryRecord>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM watch_history WHERE media_id = ?1 \
             AND (completed = 1 OR progress_seconds > 0) \
             ORDER BY watched_at DESC, id DESC LIMIT 1"
        );
        let record = self
            .conn
            .query_row(&sql, params![media_id], history_from_row)
            .optional()?;
        Ok(record)
    }

    #[cfg(test)]
    pub fn history_for_key(&self, media_id: &str, episode: u32) -> Result<Vec<HistoryRecord>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM watch_history WHERE media_id = ?1 AND episode = ?2 \
             ORDER BY watched_at DESC, id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![media_id, episode], history_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_history(&self) -> Result<Vec<HistoryRecord>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM watch_history ORDER BY watched_at DESC, id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], history_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert-or-refresh keyed by `(media_ref, episode)`; always leaves the item unsynced.
    pub fn upsert_sync_item(&self, media_ref: i64, episode: u32, progress: f64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_queue (media_ref, episode, progress, synced, created_at, synced_at)
            VALUES (?1, ?2, ?3, 0, ?4, NULL)
            ON CONFLICT(media_ref, episode) DO UPDATE SET
                progress = excluded.progress,
                synced = 0,
                synced_at = NULL
            "#,
            params![media_ref, episode, progress, now_timestamp()],
        )?;
        Ok(())
    }

    pub fn unsynced_items(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE synced = 0 \
             ORDER BY created_at ASC, id ASC LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], queue_item_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Marks the item synced only if it still holds the progress that was sent.
    /// Returns false when a newer upsert replaced it in the meantime.
    pub fn mark_synced(&self, id: i64, sent_progress: f64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sync_queue SET synced = 1, synced_at = ?2 \
             WHERE id = ?1 AND progress = ?3 AND synced = 0",
            params![id, now_timestamp(), sent_progress],
        )?;
        Ok(changed > 0)
    }

    #[cfg(test)]
    pub fn sync_item(&self, media_ref: i64, episode: u32) -> Result<Option<SyncQueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE media_ref = ?1 AND episode = ?2"
        );
        let item = self
            .conn
            .query_row(&sql, params![media_ref, episode], queue_item_from_row)
            .optional()?;
        Ok(item)
    }
}
