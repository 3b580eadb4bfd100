use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType, disable_raw_mode, enable_raw_mode};

use super::episode::format_clock;
use super::playback::{AudioTrack, KeySource, ProgressSnapshot};

/// Raw mode for the duration of a playback session, restored on drop.
pub(crate) struct RawTerminal {
    active: bool,
}

impl RawTerminal {
    pub(crate) fn enter() -> Result<Self> {
        enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self { active: true })
    }

    pub(crate) fn leave(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        disable_raw_mode().context("failed to disable raw mode")?;
        self.active = false;
        Ok(())
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if self.active {
            let _ = disable_raw_mode();
        }
    }
}

/// Prints a full line; raw mode needs the explicit carriage return.
pub(crate) fn say(line: &str) {
    let mut stdout = io::stdout();
    let _ = execute!(stdout, Clear(ClearType::CurrentLine));
    let _ = write!(stdout, "\r{line}\r\n");
    let _ = stdout.flush();
}

pub(crate) fn show_progress(snapshot: &ProgressSnapshot) {
    let mut stdout = io::stdout();
    let _ = execute!(stdout, Clear(ClearType::CurrentLine));
    let _ = write!(
        stdout,
        "\r  {} / {} ({:.1}%)  [q] stop",
        format_clock(snapshot.current_time),
        format_clock(snapshot.duration),
        snapshot.percent
    );
    let _ = stdout.flush();
}

fn is_stop_key(key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

fn read_key_press() -> Result<KeyEvent> {
    loop {
        if let Event::Key(key) = event::read().context("failed to read terminal input")?
            && key.kind == KeyEventKind::Press
        {
            return Ok(key);
        }
    }
}

pub(crate) struct TerminalKeys;

impl KeySource for TerminalKeys {
    fn stop_requested(&mut self, timeout: Duration) -> Result<bool> {
        if !event::poll(timeout).context("failed to poll terminal input")? {
            return Ok(false);
        }
        let Event::Key(key) = event::read().context("failed to read terminal input")? else {
            return Ok(false);
        };
        Ok(key.kind == KeyEventKind::Press && is_stop_key(&key))
    }
}

/// Single-key yes/no prompt; anything but `y` answers no.
pub(crate) fn confirm(prompt: &str) -> Result<bool> {
    let mut raw = RawTerminal::enter()?;
    say(&format!("{prompt} [y/N]"));
    let key = read_key_press()?;
    raw.leave()?;
    Ok(matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y')))
}

/// Offers the next unit; Enter accepts, any other key declines.
pub(crate) fn offer_next(episode: u32) -> Result<bool> {
    let mut raw = RawTerminal::enter()?;
    say(&format!(
        "Continue with episode {episode}? [Enter] play next, any other key to stop"
    ));
    let key = read_key_press()?;
    raw.leave()?;
    Ok(key.code == KeyCode::Enter)
}

/// Asks which audio track to use when the preference matched nothing.
/// Invoked before raw mode is entered, so it reads a plain line.
pub(crate) fn choose_audio_track(tracks: &[AudioTrack]) -> Option<u32> {
    println!("No audio track matched your preference. Available tracks:");
    for (position, track) in tracks.iter().enumerate() {
        let label = if track.label.is_empty() {
            track.language.as_str()
        } else {
            track.label.as_str()
        };
        println!("  {}) {label}", position + 1);
    }
    print!("Pick a track [1-{}], or Enter for the player default: ", tracks.len());
    let _ = io::stdout().flush();

    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        return None;
    }
    parse_track_choice(line.trim(), tracks)
}

fn parse_track_choice(input: &str, tracks: &[AudioTrack]) -> Option<u32> {
    let position = input.parse::<usize>().ok()?.checked_sub(1)?;
    tracks.get(position).map(|track| track.index)
}
