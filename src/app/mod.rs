mod catalog;
mod episode;
mod playback;
mod terminal;
mod tracking;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Instant;

use anyhow::Result;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::db::{Database, MediaKind};
use crate::paths::{database_file_path, player_ipc_path};

use self::catalog::Catalog;
use self::episode::{continue_target_episode, format_clock, format_last_seen_display, truncate};
use self::playback::{
    Completion, FinalizeReport, LoopExit, MpvPlayer, PlaybackController, PlaybackSession,
    PlayerControl, ProgressPoller, SessionEvent, SessionTiming, finalize_session,
    next_unit_offer, run_session_loop,
};
use self::terminal::{
    RawTerminal, TerminalKeys, choose_audio_track, confirm, offer_next, say, show_progress,
};
use self::tracking::{AniListTracker, HistoryRecorder, RecordAction, RemoteTracker, SyncQueue};

pub fn run(cli: Cli, config: Config) -> Result<()> {
    let db = open_db()?;

    match cli.command {
        Command::Play {
            catalog,
            episode,
            audio,
        } => {
            let _drain = BackgroundDrain::spawn(&config);
            run_play(&db, &config, &catalog, episode, audio)?;
        }
        Command::Continue { catalog } => {
            let _drain = BackgroundDrain::spawn(&config);
            run_continue(&db, &config, &catalog)?;
        }
        Command::History => run_history(&db)?,
        Command::Queue => run_queue(&db)?,
        Command::Sync => run_sync(&db, &config)?,
    }

    Ok(())
}

fn run_play(
    db: &Database,
    config: &Config,
    catalog_path: &Path,
    episode: Option<u32>,
    audio: Option<String>,
) -> Result<()> {
    let catalog = Catalog::load(catalog_path)?;
    let Some(episode) = episode.or_else(|| catalog.first_unit()) else {
        println!("{} has no episodes in its catalog.", catalog.title);
        return Ok(());
    };
    let audio = audio.unwrap_or_else(|| config.audio_preference.clone());
    play_from(db, config, &catalog, episode, &audio)
}

fn run_continue(db: &Database, config: &Config, catalog_path: &Path) -> Result<()> {
    let catalog = Catalog::load(catalog_path)?;
    let local = db
        .latest_for_media(&catalog.media_id)?
        .map(|record| (record.episode, record.completed));

    let remote = match catalog.tracker_id {
        Some(tracker_id) => {
            let tracker = AniListTracker::from_config(config);
            if tracker.is_enabled() {
                tracker.remote_progress(tracker_id).unwrap_or_else(|err| {
                    log::warn!("could not read tracker progress for {tracker_id}: {err}");
                    None
                })
            } else {
                None
            }
        }
        None => None,
    };

    match continue_target_episode(local, remote, &catalog.unit_numbers()) {
        Some(episode) => play_from(db, config, &catalog, episode, &config.audio_preference),
        None => {
            println!("Nothing left to watch for {}.", catalog.title);
            Ok(())
        }
    }
}

/// Plays `episode`, then keeps chaining into the next unit for as long as
/// the user accepts the continue offer.
fn play_from(
    db: &Database,
    config: &Config,
    catalog: &Catalog,
    mut episode: u32,
    audio: &str,
) -> Result<()> {
    let tracker = AniListTracker::from_config(config);
    let queue = SyncQueue::new(db, &tracker, config.sync_threshold, config.drain_batch);
    let recorder = HistoryRecorder::new(db);
    let timing = SessionTiming::from_config(config);
    let player: Arc<dyn PlayerControl> = Arc::new(MpvPlayer::new(
        config.player_bin.clone(),
        player_ipc_path(),
    ));
    let (tx, rx) = mpsc::channel();
    let poller = ProgressPoller::new(Arc::clone(&player), tx, timing.query_timeout);
    let mut controller = PlaybackController::new(player, timing);
    let units = catalog.unit_numbers();

    loop {
        if !catalog.has_unit(episode) {
            println!("Episode {episode} of {} is not in the catalog.", catalog.title);
            return Ok(());
        }
        match catalog.kind {
            MediaKind::Movie => println!("Playing {}", catalog.title),
            MediaKind::Tv => println!("Playing {} episode {episode}", catalog.title),
        }

        controller.begin(
            PlaybackSession::for_unit(catalog, episode),
            catalog,
            db,
            audio,
            &mut choose_audio_track,
            Instant::now(),
        )?;

        let mut raw = RawTerminal::enter()?;
        let exit = run_session_loop(
            &mut controller,
            &poller,
            &rx,
            &mut TerminalKeys,
            &mut report_event,
        )?;
        raw.leave()?;

        let (session, outcome) = match exit {
            LoopExit::Ended { session, outcome } => (session, outcome),
            LoopExit::Cancelled => {
                println!("Launch canceled. Progress not updated.");
                return Ok(());
            }
            LoopExit::Failed(err) => {
                println!("{err}");
                println!("Progress not updated.");
                return Ok(());
            }
        };

        let completed = match outcome.completion {
            Completion::Completed => true,
            Completion::Incomplete => false,
            Completion::Undetermined => {
                confirm(&format!("Mark episode {} as watched?", session.episode))?
            }
        };
        let report = finalize_session(&recorder, Some(&queue), &session, &outcome, completed)?;
        print_finalize_summary(&session, &report, outcome.current_seconds);

        match next_unit_offer(&session, &outcome, &units) {
            Some(next) if offer_next(next)? => episode = next,
            _ => return Ok(()),
        }
    }
}

fn report_event(event: &SessionEvent) {
    match event {
        SessionEvent::PlaybackStarted => say("Playback started. Press q to stop."),
        SessionEvent::ProgressUpdated(snapshot) => show_progress(snapshot),
        SessionEvent::PlaybackEnded(outcome) => {
            say(&format!("Playback ended at {:.1}%.", outcome.percent));
        }
        // Printed once the terminal is back in cooked mode.
        SessionEvent::LaunchTimeout(_) | SessionEvent::PlaybackError(_) => {}
    }
}

fn print_finalize_summary(session: &PlaybackSession, report: &FinalizeReport, seconds: f64) {
    match report.record.action {
        RecordAction::Completed { .. } => {
            println!("Marked {} episode {} as watched.", session.title, session.episode);
        }
        RecordAction::UpdatedInPlace | RecordAction::Inserted => println!(
            "Saved {} episode {} at {}.",
            session.title,
            session.episode,
            format_clock(seconds)
        ),
    }
}

fn run_history(db: &Database) -> Result<()> {
    let records = db.list_history()?;
    if records.is_empty() {
        println!("No watch history yet. Run `playtrack play <catalog>` first.");
        return Ok(());
    }

    println!(
        "{:<36} {:<6} {:<10} {:<7} {:<5} {:<28}",
        "TITLE", "EP", "POSITION", "PCT", "DONE", "WATCHED"
    );
    for record in records {
        println!(
            "{:<36} {:<6} {:<10} {:<7} {:<5} {:<28}",
            truncate(&record.title, 36),
            record.episode,
            format_clock(record.progress_seconds),
            format!("{:.1}%", record.progress_percent),
            if record.completed { "yes" } else { "no" },
            format_last_seen_display(&record.watched_at)
        );
    }
    Ok(())
}

fn run_queue(db: &Database) -> Result<()> {
    let items = db.unsynced_items(usize::MAX)?;
    if items.is_empty() {
        println!("Sync queue is empty.");
        return Ok(());
    }

    println!("{:<12} {:<6} {:<9} {:<28}", "MEDIA", "EP", "PROGRESS", "QUEUED");
    for item in items {
        println!(
            "{:<12} {:<6} {:<9} {:<28}",
            item.media_ref,
            item.episode,
            format!("{:.0}%", item.progress * 100.0),
            format_last_seen_display(&item.created_at)
        );
    }
    Ok(())
}

fn run_sync(db: &Database, config: &Config) -> Result<()> {
    let tracker = AniListTracker::from_config(config);
    if !tracker.is_enabled() {
        println!("Tracking is disabled or no tracker token is configured. Nothing synced.");
        return Ok(());
    }
    let report = SyncQueue::new(db, &tracker, config.sync_threshold, config.drain_batch)
        .drain(|| false)?;
    println!(
        "Synced {} of {} queued item(s); {} failed and stay queued.",
        report.synced, report.attempted, report.failed
    );
    Ok(())
}

fn open_db() -> Result<Database> {
    let db_path = database_file_path()?;
    let db = Database::open(&db_path)?;
    db.migrate()?;
    Ok(db)
}

/// One drain pass on its own thread and connection while the user watches.
/// Dropping the handle asks the pass to stop after its current item.
struct BackgroundDrain {
    stop: Arc<AtomicBool>,
}

impl BackgroundDrain {
    fn spawn(config: &Config) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let config = config.clone();
        thread::spawn(move || {
            if let Err(err) = drain_once(&config, &flag) {
                log::warn!("background sync drain failed: {err:#}");
            }
        });
        Self { stop }
    }
}

impl Drop for BackgroundDrain {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn drain_once(config: &Config, stop: &AtomicBool) -> Result<()> {
    let tracker = AniListTracker::from_config(config);
    if !tracker.is_enabled() {
        return Ok(());
    }
    let db = open_db()?;
    SyncQueue::new(&db, &tracker, config.sync_threshold, config.drain_batch)
        .drain(|| stop.load(Ordering::Relaxed))?;
    Ok(())
}
