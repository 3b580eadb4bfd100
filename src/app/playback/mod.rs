mod audio;
mod controller;
mod driver;
mod mpv;
mod player;
mod poller;
mod process;
mod resume;

#[cfg(test)]
pub(crate) mod fake;

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::Config;
use crate::db::MediaKind;

use super::catalog::{Catalog, ResolvedStream, Subtitle};

pub(crate) use audio::*;
pub(crate) use controller::*;
pub(crate) use driver::*;
pub(crate) use mpv::MpvPlayer;
pub(crate) use player::*;
pub(crate) use poller::*;
pub(crate) use resume::*;

/// Watched percentage at which a unit counts as finished. Shared by the
/// mark-complete, resume-suppression and continue-watching decisions.
pub(crate) const COMPLETION_PERCENT: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ProgressSnapshot {
    pub(crate) current_time: f64,
    pub(crate) duration: f64,
    pub(crate) percent: f64,
    pub(crate) eof: bool,
}

impl ProgressSnapshot {
    pub(crate) fn new(current_time: f64, duration: f64, eof: bool) -> Self {
        Self {
            current_time,
            duration,
            percent: watched_percent(current_time, duration),
            eof,
        }
    }
}

pub(crate) fn watched_percent(current: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    (current / total * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    ResolvingStream,
    LaunchingPlayer,
    Playing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndReason {
    EndOfStream,
    PlayerExited,
    UserStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Completed,
    Incomplete,
    /// User stopped playback; the UI must ask before recording.
    Undetermined,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlaybackOutcome {
    pub(crate) reason: EndReason,
    pub(crate) completion: Completion,
    pub(crate) current_seconds: f64,
    pub(crate) total_seconds: f64,
    pub(crate) percent: f64,
}

impl PlaybackOutcome {
    pub(crate) fn from_snapshot(reason: EndReason, snapshot: Option<&ProgressSnapshot>) -> Self {
        let (current_seconds, total_seconds, percent, eof) = snapshot
            .map(|snap| (snap.current_time, snap.duration, snap.percent, snap.eof))
            .unwrap_or((0.0, 0.0, 0.0, false));
        let completion = match reason {
            EndReason::UserStopped => Completion::Undetermined,
            _ if eof || percent >= COMPLETION_PERCENT => Completion::Completed,
            _ => Completion::Incomplete,
        };
        // At EOF mpv may report a position slightly short of the duration.
        let current_seconds = if eof && total_seconds > 0.0 {
            total_seconds
        } else {
            current_seconds
        };
        Self {
            reason,
            completion,
            current_seconds,
            total_seconds,
            percent: if eof { 100.0 } else { percent },
        }
    }
}

/// Why a session ended without an outcome, phrased for the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum SessionError {
    #[error("{diagnostic}")]
    LaunchTimeout { diagnostic: String },
    #[error("{0}")]
    Playback(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionEvent {
    LaunchTimeout(String),
    PlaybackStarted,
    ProgressUpdated(ProgressSnapshot),
    PlaybackEnded(PlaybackOutcome),
    PlaybackError(String),
}

/// Everything the controller knows about the unit being played. Owned by the
/// controller from `begin` until the outcome is taken.
#[derive(Debug, Clone)]
pub(crate) struct PlaybackSession {
    pub(crate) media_id: String,
    pub(crate) title: String,
    pub(crate) media_kind: MediaKind,
    pub(crate) episode: u32,
    pub(crate) season: u32,
    pub(crate) provider: String,
    pub(crate) tracker_id: Option<i64>,
    pub(crate) is_final_unit: bool,
    pub(crate) stream: Option<ResolvedStream>,
    pub(crate) audio_index: Option<u32>,
    pub(crate) subtitle: Option<Subtitle>,
    pub(crate) resume_offset: f64,
    pub(crate) launched_at: Option<Instant>,
    pub(crate) last_snapshot: Option<ProgressSnapshot>,
}

impl PlaybackSession {
    pub(crate) fn for_unit(catalog: &Catalog, episode: u32) -> Self {
        Self {
            media_id: catalog.media_id.clone(),
            title: catalog.title.clone(),
            media_kind: catalog.kind,
            episode,
            season: catalog.season,
            provider: catalog.provider.clone(),
            tracker_id: catalog.tracker_id,
            is_final_unit: catalog.is_final_unit(episode),
            stream: None,
            audio_index: None,
            subtitle: None,
            resume_offset: 0.0,
            launched_at: None,
            last_snapshot: None,
        }
    }

    pub(crate) fn is_tracker_linked(&self) -> bool {
        self.tracker_id.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionTiming {
    pub(crate) poll_interval: Duration,
    pub(crate) launch_probe_interval: Duration,
    pub(crate) query_timeout: Duration,
    pub(crate) launch_timeout: Duration,
    pub(crate) ipc_grace: Duration,
}

impl SessionTiming {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            launch_probe_interval: Duration::from_millis(250),
            query_timeout: config.query_timeout(),
            launch_timeout: config.launch_timeout(),
            ipc_grace: config.ipc_grace(),
        }
    }
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
