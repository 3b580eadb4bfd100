use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::{
    PlaybackController, PlaybackOutcome, PlaybackSession, PollerMessage, ProgressPoller,
    SessionError, SessionEvent, SessionState, StopResult,
};

const KEY_WAIT: Duration = Duration::from_millis(100);

/// Keyboard (or test script) input polled between controller ticks.
pub(crate) trait KeySource {
    /// Waits up to `timeout` for input; `true` means the user asked to stop.
    fn stop_requested(&mut self, timeout: Duration) -> Result<bool>;
}

#[derive(Debug)]
pub(crate) enum LoopExit {
    Ended {
        session: PlaybackSession,
        outcome: PlaybackOutcome,
    },
    /// Stopped before the player reported playback.
    Cancelled,
    Failed(SessionError),
}

/// Runs one started session to its end. Poll replies, deadlines, new poll
/// dispatches and key input are all serviced from this single thread, so the
/// controller is never touched concurrently.
pub(crate) fn run_session_loop(
    controller: &mut PlaybackController,
    poller: &ProgressPoller,
    replies: &mpsc::Receiver<PollerMessage>,
    keys: &mut dyn KeySource,
    on_event: &mut dyn FnMut(&SessionEvent),
) -> Result<LoopExit> {
    let mut failure = None;
    loop {
        let now = Instant::now();
        while let Ok(message) = replies.try_recv() {
            controller.handle_message(message, now);
        }
        controller.check_deadlines(now);
        if let Some(request) = controller.poll_due(now) {
            poller.dispatch(request);
        }

        for event in controller.drain_events() {
            match &event {
                SessionEvent::LaunchTimeout(diagnostic) => {
                    failure = Some(SessionError::LaunchTimeout {
                        diagnostic: diagnostic.clone(),
                    });
                }
                SessionEvent::PlaybackError(message) => {
                    failure = Some(SessionError::Playback(message.clone()));
                }
                _ => {}
            }
            on_event(&event);
        }

        match controller.state() {
            SessionState::Completed => {
                return Ok(match controller.take_outcome() {
                    Some((session, outcome)) => LoopExit::Ended { session, outcome },
                    None => LoopExit::Failed(SessionError::Playback(
                        "session ended without an outcome".to_string(),
                    )),
                });
            }
            SessionState::Error => {
                return Ok(LoopExit::Failed(failure.unwrap_or_else(|| {
                    SessionError::Playback("playback failed".to_string())
                })));
            }
            SessionState::Idle => return Ok(LoopExit::Cancelled),
            SessionState::ResolvingStream
            | SessionState::LaunchingPlayer
            | SessionState::Playing => {}
        }

        if keys.stop_requested(KEY_WAIT)? && controller.request_stop() == StopResult::Cancelled {
            return Ok(LoopExit::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::app::catalog::Catalog;
    use crate::app::playback::fake::FakePlayer;
    use crate::app::playback::{AudioTrack, EndReason, PlayerControl, SessionTiming};
    use crate::db::Database;

    const CATALOG: &str = r#"{
        "media_id": "show-1",
        "title": "Show One",
        "tracker_id": 42,
        "units": [{"number": 1, "url": "https://cdn.test/1.m3u8"}, {"number": 2}]
    }"#;

    struct ScriptedKeys<F: FnMut() -> bool> {
        stop_when: F,
    }

    impl<F: FnMut() -> bool> KeySource for ScriptedKeys<F> {
        fn stop_requested(&mut self, _timeout: Duration) -> Result<bool> {
            std::thread::sleep(Duration::from_millis(1));
            Ok((self.stop_when)())
        }
    }

    fn fast_timing() -> SessionTiming {
        SessionTiming {
            poll_interval: Duration::from_millis(5),
            launch_probe_interval: Duration::from_millis(2),
            query_timeout: Duration::from_millis(50),
            launch_timeout: Duration::from_millis(300),
            ipc_grace: Duration::from_secs(10),
        }
    }

    fn run(
        player: &Arc<FakePlayer>,
        unit: u32,
        keys: &mut dyn KeySource,
    ) -> (LoopExit, Vec<SessionEvent>) {
        let db = Database::open_in_memory().expect("db");
        let catalog = Catalog::from_json(CATALOG).expect("catalog");
        let control: Arc<dyn PlayerControl> = player.clone();
        let timing = fast_timing();
        let mut controller = PlaybackController::new(control.clone(), timing);
        let (tx, rx) = mpsc::channel();
        let poller = ProgressPoller::new(control, tx, timing.query_timeout);

        controller
            .begin(
                PlaybackSession::for_unit(&catalog, unit),
                &catalog,
                &db,
                "sub",
                &mut |_: &[AudioTrack]| None,
                Instant::now(),
            )
            .expect("begin");

        let mut events = Vec::new();
        let exit = run_session_loop(&mut controller, &poller, &rx, keys, &mut |event| {
            events.push(event.clone())
        })
        .expect("loop");
        (exit, events)
    }

    #[test]
    fn session_runs_until_end_of_stream() {
        let player = FakePlayer::new();
        player.set_playing(true);
        player.push_position(120.0, 1400.0, false);
        player.push_position(1399.0, 1400.0, true);

        let (exit, events) = run(&player, 1, &mut ScriptedKeys { stop_when: || false });

        let LoopExit::Ended { session, outcome } = exit else {
            panic!("unexpected exit: {exit:?}");
        };
        assert_eq!(session.episode, 1);
        assert_eq!(outcome.reason, EndReason::EndOfStream);
        assert_eq!(outcome.percent, 100.0);
        assert!(events.contains(&SessionEvent::PlaybackStarted));
        assert_eq!(player.stop_count(), 1);
    }

    #[test]
    fn launch_timeout_fails_with_diagnostic() {
        let player = FakePlayer::new();

        let (exit, events) = run(&player, 1, &mut ScriptedKeys { stop_when: || false });

        let LoopExit::Failed(err) = exit else {
            panic!("unexpected exit: {exit:?}");
        };
        assert!(matches!(err, SessionError::LaunchTimeout { .. }));
        assert!(err.to_string().contains("antivirus"));
        assert!(matches!(events.as_slice(), [SessionEvent::LaunchTimeout(_)]));
        assert_eq!(player.stop_count(), 1);
        assert_eq!(player.query_count(), 0);
    }

    #[test]
    fn stop_key_during_launch_cancels() {
        let player = FakePlayer::new();

        let (exit, events) = run(&player, 1, &mut ScriptedKeys { stop_when: || true });

        assert!(matches!(exit, LoopExit::Cancelled));
        assert!(events.is_empty());
        assert_eq!(player.stop_count(), 1);
    }

    #[test]
    fn stop_key_while_playing_ends_with_user_stop() {
        let player = FakePlayer::new();
        player.set_playing(true);
        player.push_position(700.0, 1400.0, false);
        let counter = player.clone();

        let (exit, _) = run(
            &player,
            1,
            &mut ScriptedKeys {
                stop_when: move || counter.query_count() >= 3,
            },
        );

        let LoopExit::Ended { outcome, .. } = exit else {
            panic!("unexpected exit: {exit:?}");
        };
        assert_eq!(outcome.reason, EndReason::UserStopped);
        assert_eq!(player.stop_count(), 1);
    }

    #[test]
    fn unresolvable_unit_fails_immediately() {
        let player = FakePlayer::new();

        let (exit, _) = run(&player, 2, &mut ScriptedKeys { stop_when: || false });

        assert!(matches!(
            exit,
            LoopExit::Failed(SessionError::Playback(ref msg)) if msg.contains("no playable source")
        ));
        assert!(player.starts().is_empty());
    }
}
