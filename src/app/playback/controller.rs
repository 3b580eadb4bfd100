use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};

use crate::app::catalog::StreamResolver;
use crate::app::episode::next_unit_number;
use crate::app::tracking::{
    HistoryRecorder, ProgressWrite, RecordResult, SyncDecision, SyncQueue,
};
use crate::db::Database;

use super::{
    AudioTrack, COMPLETION_PERCENT, EndReason, PlaybackOutcome, PlaybackSession, PlayerControl,
    PollRequest, PollVerdict, PollerMessage, SessionEvent, SessionState, SessionTiming,
    StartRequest, judge_poll_result, resolve_resume, select_subtitle, select_track,
};

fn launch_timeout_diagnostic(timing: &SessionTiming) -> String {
    format!(
        "The player did not start playback within {}s. Likely causes:\n  \
         - the player binary is missing or not on PATH (set PLAYTRACK_PLAYER_BIN)\n  \
         - the OS, a permission setting or antivirus software blocked it from running\n  \
         - the stream needs headers (Referer/User-Agent) that were not supplied",
        timing.launch_timeout.as_secs()
    )
}

fn launch_failure_message(err: &anyhow::Error) -> String {
    format!(
        "Failed to launch the player: {err:#}. Check that it is installed, executable and not blocked by antivirus software."
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopResult {
    NotActive,
    /// Stopped while launching; the session is discarded without an outcome.
    Cancelled,
    Stopped,
}

/// Drives one playback session at a time through
/// `Idle -> ResolvingStream -> LaunchingPlayer -> Playing -> Completed`,
/// with `Error` reachable from any non-terminal state.
///
/// The controller never blocks: queries are handed out through `poll_due`
/// and their results come back through `handle_message`. Each session gets a
/// new generation number and replies tagged with an older one are dropped.
pub(crate) struct PlaybackController {
    player: Arc<dyn PlayerControl>,
    timing: SessionTiming,
    state: SessionState,
    session: Option<PlaybackSession>,
    outcome: Option<PlaybackOutcome>,
    generation: u64,
    next_poll: Option<Instant>,
    events: Vec<SessionEvent>,
}

impl PlaybackController {
    pub(crate) fn new(player: Arc<dyn PlayerControl>, timing: SessionTiming) -> Self {
        Self {
            player,
            timing,
            state: SessionState::Idle,
            session: None,
            outcome: None,
            generation: 0,
            next_poll: None,
            events: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Resolves the stream, audio track and resume offset, then asks the
    /// player to start. Stream and launch failures move to `Error` and are
    /// reported as events; store failures are returned.
    pub(crate) fn begin(
        &mut self,
        mut session: PlaybackSession,
        resolver: &dyn StreamResolver,
        db: &Database,
        audio_preference: &str,
        choose_track: &mut dyn FnMut(&[AudioTrack]) -> Option<u32>,
        now: Instant,
    ) -> Result<()> {
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::Completed | SessionState::Error
        ) {
            bail!("a playback session is already active");
        }

        self.generation += 1;
        self.outcome = None;
        self.next_poll = None;
        self.session = None;
        self.state = SessionState::ResolvingStream;
        log::info!(
            "resolving {} episode {} (session {})",
            session.title,
            session.episode,
            self.generation
        );

        let mut stream = match resolver.resolve(session.episode) {
            Ok(stream) => stream,
            Err(err) => {
                self.fail(format!("{err}. Try another provider or episode."));
                return Ok(());
            }
        };

        let selected = select_track(&mut stream.audio_tracks, audio_preference).cloned();
        let audio = match selected {
            Some(track) => Some(track),
            None if stream.audio_tracks.is_empty() => None,
            None => choose_track(&stream.audio_tracks).and_then(|index| {
                stream
                    .audio_tracks
                    .iter()
                    .find(|track| track.index == index)
                    .cloned()
            }),
        };
        session.audio_index = audio.as_ref().map(|track| track.index);
        session.subtitle = select_subtitle(&stream.subtitles, audio.as_ref());

        if let Some(tracker_id) = session.tracker_id {
            match resolve_resume(db, tracker_id, session.episode) {
                Ok(offset) => session.resume_offset = offset,
                Err(err) => {
                    self.fail(format!("Failed to read watch history: {err:#}"));
                    return Err(err);
                }
            }
        }

        let request = StartRequest {
            url: stream.url.clone(),
            title: format!("{} - Episode {}", session.title, session.episode),
            headers: stream.headers.clone(),
            referer: stream.referer.clone(),
            start_offset: session.resume_offset,
            audio_index: session.audio_index,
            subtitle: session.subtitle.clone(),
        };
        session.stream = Some(stream);

        if let Err(err) = self.player.start(&request) {
            self.session = Some(session);
            self.fail(launch_failure_message(&err));
            return Ok(());
        }

        if session.resume_offset > 0.0 {
            log::info!("resuming at {:.0}s", session.resume_offset);
        }
        session.launched_at = Some(now);
        self.session = Some(session);
        self.state = SessionState::LaunchingPlayer;
        self.next_poll = Some(now);
        Ok(())
    }

    /// Hands out the query due at `now`, if any, and schedules the next tick
    /// right away without waiting for the previous reply.
    pub(crate) fn poll_due(&mut self, now: Instant) -> Option<PollRequest> {
        if !self.next_poll.is_some_and(|at| now >= at) {
            return None;
        }
        let generation = self.generation;
        match self.state {
            SessionState::LaunchingPlayer => {
                self.next_poll = Some(now + self.timing.launch_probe_interval);
                Some(PollRequest::LaunchProbe { generation })
            }
            SessionState::Playing => {
                self.next_poll = Some(now + self.timing.poll_interval);
                Some(PollRequest::Status { generation })
            }
            _ => {
                self.next_poll = None;
                None
            }
        }
    }

    pub(crate) fn check_deadlines(&mut self, now: Instant) {
        if self.state != SessionState::LaunchingPlayer {
            return;
        }
        let Some(launched_at) = self.launched_at() else {
            return;
        };
        if now.saturating_duration_since(launched_at) < self.timing.launch_timeout {
            return;
        }

        log::warn!(
            "player did not report playback within {:?}",
            self.timing.launch_timeout
        );
        self.stop_player();
        self.state = SessionState::Error;
        self.next_poll = None;
        self.events
            .push(SessionEvent::LaunchTimeout(launch_timeout_diagnostic(&self.timing)));
    }

    pub(crate) fn handle_message(&mut self, message: PollerMessage, now: Instant) {
        match message {
            PollerMessage::LaunchProbe {
                generation,
                playing,
            } => {
                if generation != self.generation
                    || self.state != SessionState::LaunchingPlayer
                    || !playing
                {
                    return;
                }
                log::info!("player reported playback");
                self.state = SessionState::Playing;
                self.next_poll = Some(now + self.timing.poll_interval);
                self.events.push(SessionEvent::PlaybackStarted);
            }
            PollerMessage::Status { generation, result } => {
                if generation != self.generation || self.state != SessionState::Playing {
                    log::trace!("dropping stale status reply from session {generation}");
                    return;
                }
                let since_launch = self
                    .launched_at()
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();

                match judge_poll_result(result, since_launch, self.timing.ipc_grace) {
                    PollVerdict::Snapshot(snapshot) => {
                        if let Some(session) = self.session.as_mut() {
                            session.last_snapshot = Some(snapshot);
                        }
                        self.events.push(SessionEvent::ProgressUpdated(snapshot));
                        if snapshot.eof {
                            // The player is kept open at EOF; close it ourselves.
                            self.stop_player();
                            self.finish(EndReason::EndOfStream);
                        }
                    }
                    PollVerdict::Ignore(err) => {
                        log::debug!("ignoring transient status failure: {err}");
                    }
                    PollVerdict::Fatal(err, class) => {
                        log::warn!("player IPC lost ({class:?}): {err}");
                        self.stop_player();
                        self.finish(EndReason::PlayerExited);
                    }
                }
            }
        }
    }

    /// User-initiated stop.
    pub(crate) fn request_stop(&mut self) -> StopResult {
        match self.state {
            SessionState::LaunchingPlayer => {
                log::info!("launch canceled by user");
                self.stop_player();
                self.state = SessionState::Idle;
                self.session = None;
                self.next_poll = None;
                StopResult::Cancelled
            }
            SessionState::Playing => {
                log::info!("playback stopped by user");
                self.stop_player();
                self.finish(EndReason::UserStopped);
                StopResult::Stopped
            }
            _ => StopResult::NotActive,
        }
    }

    /// Releases the finished session and its outcome, returning to `Idle`.
    pub(crate) fn take_outcome(&mut self) -> Option<(PlaybackSession, PlaybackOutcome)> {
        if self.state != SessionState::Completed {
            return None;
        }
        let session = self.session.take()?;
        let outcome = self.outcome.take()?;
        self.state = SessionState::Idle;
        Some((session, outcome))
    }

    fn launched_at(&self) -> Option<Instant> {
        self.session.as_ref().and_then(|session| session.launched_at)
    }

    fn finish(&mut self, reason: EndReason) {
        let snapshot = self
            .session
            .as_ref()
            .and_then(|session| session.last_snapshot.as_ref());
        let outcome = PlaybackOutcome::from_snapshot(reason, snapshot);
        log::info!(
            "session {} ended ({reason:?}) at {:.1}%",
            self.generation,
            outcome.percent
        );
        self.state = SessionState::Completed;
        self.next_poll = None;
        self.outcome = Some(outcome.clone());
        self.events.push(SessionEvent::PlaybackEnded(outcome));
    }

    fn fail(&mut self, message: String) {
        log::warn!("playback failed: {message}");
        self.state = SessionState::Error;
        self.next_poll = None;
        self.events.push(SessionEvent::PlaybackError(message));
    }

    fn stop_player(&self) {
        if let Err(err) = self.player.stop() {
            log::warn!("failed to stop player: {err:#}");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FinalizeReport {
    pub(crate) record: RecordResult,
    pub(crate) sync: Option<SyncDecision>,
}

/// Persists the outcome of a finished session, then mirrors it to the
/// tracker. Store errors propagate; tracker errors are only logged because
/// the local write already succeeded.
pub(crate) fn finalize_session(
    recorder: &HistoryRecorder<'_>,
    sync: Option<&SyncQueue<'_>>,
    session: &PlaybackSession,
    outcome: &PlaybackOutcome,
    completed: bool,
) -> Result<FinalizeReport> {
    let record = recorder.record_progress(&ProgressWrite {
        media_id: &session.media_id,
        title: &session.title,
        media_kind: session.media_kind,
        tracker_id: session.tracker_id,
        provider: &session.provider,
        episode: session.episode,
        season: session.season,
        current_seconds: outcome.current_seconds,
        total_seconds: outcome.total_seconds,
        completed,
        has_next_unit: !session.is_final_unit,
    })?;

    let mut report = FinalizeReport { record, sync: None };
    let (Some(tracker_id), Some(queue)) = (session.tracker_id, sync) else {
        return Ok(report);
    };
    if !completed && outcome.current_seconds <= 0.0 {
        return Ok(report);
    }

    let fraction = if completed {
        1.0
    } else {
        outcome.percent / 100.0
    };
    match queue.sync_or_queue(tracker_id, session.episode, fraction) {
        Ok(decision) => report.sync = Some(decision),
        Err(err) => log::warn!(
            "tracker sync for {} episode {} failed: {err}",
            session.title,
            session.episode
        ),
    }
    Ok(report)
}

/// Next unit to offer for immediate continuation, looked up in the unit list
/// that was already fetched for this media.
pub(crate) fn next_unit_offer(
    session: &PlaybackSession,
    outcome: &PlaybackOutcome,
    units: &[u32],
) -> Option<u32> {
    if !session.is_tracker_linked()
        || session.is_final_unit
        || outcome.percent < COMPLETION_PERCENT
    {
        return None;
    }
    let next = next_unit_number(session.episode);
    units.contains(&next).then_some(next)
}
