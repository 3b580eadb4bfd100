use thiserror::Error;

use crate::db::Database;

use super::api::{RemoteTracker, TrackerError};

#[derive(Debug, Error)]
pub(crate) enum SyncError {
    /// The item was queued for the next drain; the local write stands.
    #[error("remote sync failed: {0}")]
    Remote(#[from] TrackerError),
    #[error("sync queue write failed: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncDecision {
    Synced,
    Queued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DrainReport {
    pub(crate) attempted: usize,
    pub(crate) synced: usize,
    pub(crate) failed: usize,
    /// Sent, but replaced by newer progress before it could be marked.
    pub(crate) superseded: usize,
}

/// Decides between pushing progress now and deferring it, and flushes the
/// deferred items. Every queue write is a single upsert or mark statement, so
/// the foreground session and a background drain can share the store.
pub(crate) struct SyncQueue<'a> {
    db: &'a Database,
    tracker: &'a dyn RemoteTracker,
    threshold: f64,
    batch: usize,
}

impl<'a> SyncQueue<'a> {
    pub(crate) fn new(
        db: &'a Database,
        tracker: &'a dyn RemoteTracker,
        threshold: f64,
        batch: usize,
    ) -> Self {
        Self {
            db,
            tracker,
            threshold,
            batch,
        }
    }

    pub(crate) fn sync_or_queue(
        &self,
        media_ref: i64,
        episode: u32,
        fraction: f64,
    ) -> Result<SyncDecision, SyncError> {
        if !self.tracker.is_enabled() || fraction < self.threshold {
            self.db.upsert_sync_item(media_ref, episode, fraction)?;
            log::debug!("queued tracker sync for media {media_ref} episode {episode} ({fraction:.2})");
            return Ok(SyncDecision::Queued);
        }

        match self.tracker.update_progress(media_ref, episode, fraction) {
            Ok(()) => Ok(SyncDecision::Synced),
            Err(err) => {
                // Retried by the next drain pass.
                self.db.upsert_sync_item(media_ref, episode, fraction)?;
                Err(SyncError::Remote(err))
            }
        }
    }

    /// One pass over the oldest unsynced items. A failing item is left for the
    /// next pass and never blocks the rest of the batch.
    pub(crate) fn drain<F>(&self, should_stop: F) -> anyhow::Result<DrainReport>
    where
        F: Fn() -> bool,
    {
        let mut report = DrainReport::default();
        if !self.tracker.is_enabled() {
            log::debug!("tracker disabled; skipping sync queue drain");
            return Ok(report);
        }

        let items = self.db.unsynced_items(self.batch)?;
        for item in items {
            if should_stop() {
                log::debug!("sync queue drain stopped early");
                break;
            }
            report.attempted += 1;

            if let Err(err) = self
                .tracker
                .update_progress(item.media_ref, item.episode, item.progress)
            {
                log::warn!(
                    "sync of media {} episode {} failed: {err}",
                    item.media_ref,
                    item.episode
                );
                report.failed += 1;
                continue;
            }

            match self.db.mark_synced(item.id, item.progress) {
                Ok(true) => report.synced += 1,
                Ok(false) => {
                    log::debug!(
                        "sync item {} changed while it was being sent; left for the next pass",
                        item.id
                    );
                    report.superseded += 1;
                }
                Err(err) => {
                    log::warn!("failed to mark sync item {} as synced: {err:#}", item.id);
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            log::info!(
                "sync queue drain: {} attempted, {} synced, {} failed",
                report.attempted,
                report.synced,
                report.failed
            );
        }
        Ok(report)
    }
}
