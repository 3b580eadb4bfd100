use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::catalog::Catalog;
use super::episode::*;
use super::playback::fake::FakePlayer;
use super::playback::*;
use super::tracking::*;
use crate::db::Database;

const CATALOG: &str = r#"{
    "media_id": "show-1",
    "title": "Show One",
    "provider": "allanime",
    "tracker_id": 42,
    "units": [
        {"number": 1, "url": "https://cdn.test/1.m3u8"},
        {"number": 2, "url": "https://cdn.test/2.m3u8"},
        {"number": 3, "url": "https://cdn.test/3.m3u8"}
    ]
}"#;

struct NoKeys;

impl KeySource for NoKeys {
    fn stop_requested(&mut self, _timeout: Duration) -> Result<bool> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(false)
    }
}

/// Stops once the player has answered `after` status queries.
struct StopAfterQueries {
    player: Arc<FakePlayer>,
    after: usize,
}

impl KeySource for StopAfterQueries {
    fn stop_requested(&mut self, _timeout: Duration) -> Result<bool> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(self.player.query_count() >= self.after)
    }
}

fn fast_timing() -> SessionTiming {
    SessionTiming {
        poll_interval: Duration::from_millis(5),
        launch_probe_interval: Duration::from_millis(2),
        query_timeout: Duration::from_millis(50),
        launch_timeout: Duration::from_secs(2),
        ipc_grace: Duration::from_secs(10),
    }
}

fn play_unit(
    db: &Database,
    player: &Arc<FakePlayer>,
    catalog: &Catalog,
    episode: u32,
    keys: &mut dyn KeySource,
) -> (PlaybackSession, PlaybackOutcome) {
    let control: Arc<dyn PlayerControl> = player.clone();
    let timing = fast_timing();
    let (tx, rx) = mpsc::channel();
    let poller = ProgressPoller::new(Arc::clone(&control), tx, timing.query_timeout);
    let mut controller = PlaybackController::new(control, timing);
    controller
        .begin(
            PlaybackSession::for_unit(catalog, episode),
            catalog,
            db,
            "sub",
            &mut |_: &[AudioTrack]| None,
            Instant::now(),
        )
        .expect("begin");

    match run_session_loop(&mut controller, &poller, &rx, keys, &mut |_| {}).expect("loop") {
        LoopExit::Ended { session, outcome } => (session, outcome),
        other => panic!("session did not end normally: {other:?}"),
    }
}

#[test]
fn watched_episode_is_recorded_synced_and_offers_the_next_one() {
    let db = Database::open_in_memory().expect("db");
    let catalog = Catalog::from_json(CATALOG).expect("catalog");
    let tracker = FakeTracker::default();
    let queue = SyncQueue::new(&db, &tracker, 0.85, 100);
    let recorder = HistoryRecorder::new(&db);

    let player = FakePlayer::new();
    player.set_playing(true);
    player.push_position(600.0, 1420.0, false);
    player.push_position(1420.0, 1420.0, true);
    let (session, outcome) = play_unit(&db, &player, &catalog, 1, &mut NoKeys);
    assert_eq!(outcome.completion, Completion::Completed);

    let report = finalize_session(&recorder, Some(&queue), &session, &outcome, true)
        .expect("finalize");
    assert_eq!(report.record.placeholder_episode, Some(2));
    assert_eq!(report.sync, Some(SyncDecision::Synced));
    assert_eq!(tracker.calls(), vec![(42, 1, 1.0)]);

    let rows = db.history_for_key("show-1", 1).expect("rows");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].completed);
    assert_eq!(rows[0].progress_seconds, 1420.0);

    let placeholder = db.history_for_key("show-1", 2).expect("rows");
    assert_eq!(placeholder.len(), 1);
    assert!(!placeholder[0].completed);
    assert_eq!(placeholder[0].progress_seconds, 0.0);

    assert_eq!(
        next_unit_offer(&session, &outcome, &catalog.unit_numbers()),
        Some(2)
    );
    // The placeholder must not produce a resume offset.
    assert_eq!(resolve_resume(&db, 42, 2).expect("resume"), 0.0);
}

#[test]
fn stopped_episode_resumes_where_it_was_left() {
    let db = Database::open_in_memory().expect("db");
    let catalog = Catalog::from_json(CATALOG).expect("catalog");
    let tracker = FakeTracker::default();
    let queue = SyncQueue::new(&db, &tracker, 0.85, 100);
    let recorder = HistoryRecorder::new(&db);

    let player = FakePlayer::new();
    player.set_playing(true);
    player.push_position(540.0, 1440.0, false);
    let mut keys = StopAfterQueries {
        player: player.clone(),
        after: 3,
    };
    let (session, outcome) = play_unit(&db, &player, &catalog, 2, &mut keys);
    assert_eq!(outcome.reason, EndReason::UserStopped);
    assert_eq!(outcome.completion, Completion::Undetermined);
    assert_eq!(outcome.current_seconds, 540.0);

    // User declined to mark it watched.
    let report = finalize_session(&recorder, Some(&queue), &session, &outcome, false)
        .expect("finalize");
    assert_eq!(report.sync, Some(SyncDecision::Queued));
    assert!(tracker.calls().is_empty());
    assert_eq!(next_unit_offer(&session, &outcome, &catalog.unit_numbers()), None);

    let replay = FakePlayer::new();
    replay.set_playing(true);
    replay.push_position(1440.0, 1440.0, true);
    play_unit(&db, &replay, &catalog, 2, &mut NoKeys);
    assert_eq!(replay.starts()[0].start_offset, 540.0);
}

#[test]
fn continue_target_follows_local_history() {
    let db = Database::open_in_memory().expect("db");
    let catalog = Catalog::from_json(CATALOG).expect("catalog");
    let recorder = HistoryRecorder::new(&db);
    let session = PlaybackSession::for_unit(&catalog, 1);
    let outcome = PlaybackOutcome::from_snapshot(
        EndReason::PlayerExited,
        Some(&ProgressSnapshot::new(1300.0, 1400.0, false)),
    );
    finalize_session(&recorder, None, &session, &outcome, true).expect("finalize");

    let local = db
        .latest_for_media("show-1")
        .expect("latest")
        .map(|record| (record.episode, record.completed));
    assert_eq!(local, Some((1, true)));
    assert_eq!(
        continue_target_episode(local, Some(0), &catalog.unit_numbers()),
        Some(2)
    );
}

#[test]
fn failed_remote_sync_is_retried_by_the_next_drain() {
    let db = Database::open_in_memory().expect("db");
    let catalog = Catalog::from_json(CATALOG).expect("catalog");
    let recorder = HistoryRecorder::new(&db);
    let session = PlaybackSession::for_unit(&catalog, 3);
    let outcome = PlaybackOutcome::from_snapshot(
        EndReason::EndOfStream,
        Some(&ProgressSnapshot::new(1400.0, 1400.0, true)),
    );

    let outage = FakeTracker::failing_on(&[3]);
    let report = finalize_session(
        &recorder,
        Some(&SyncQueue::new(&db, &outage, 0.85, 100)),
        &session,
        &outcome,
        true,
    )
    .expect("local write survives remote failure");
    assert_eq!(report.sync, None);
    assert!(matches!(report.record.action, RecordAction::Completed { .. }));
    // Final unit: no placeholder.
    assert_eq!(report.record.placeholder_episode, None);

    let healthy = FakeTracker::default();
    let drained = SyncQueue::new(&db, &healthy, 0.85, 100)
        .drain(|| false)
        .expect("drain");
    assert_eq!(drained.synced, 1);
    assert_eq!(healthy.calls(), vec![(42, 3, 1.0)]);
    assert!(db.unsynced_items(100).expect("pending").is_empty());
}

#[test]
fn unlinked_media_is_recorded_without_tracker_calls() {
    let db = Database::open_in_memory().expect("db");
    let mut catalog = Catalog::from_json(CATALOG).expect("catalog");
    catalog.tracker_id = None;
    let tracker = FakeTracker::default();
    let queue = SyncQueue::new(&db, &tracker, 0.85, 100);
    let recorder = HistoryRecorder::new(&db);
    let session = PlaybackSession::for_unit(&catalog, 1);
    let outcome = PlaybackOutcome::from_snapshot(
        EndReason::PlayerExited,
        Some(&ProgressSnapshot::new(1300.0, 1400.0, false)),
    );

    let report = finalize_session(&recorder, Some(&queue), &session, &outcome, true)
        .expect("finalize");
    assert_eq!(report.sync, None);
    assert!(tracker.calls().is_empty());
    assert_eq!(next_unit_offer(&session, &outcome, &catalog.unit_numbers()), None);
    assert_eq!(db.list_history().expect("history").len(), 2);
}
