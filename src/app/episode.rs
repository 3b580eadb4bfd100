use chrono::{DateTime, Local};

pub(crate) fn next_unit_number(episode: u32) -> u32 {
    episode.saturating_add(1)
}

/// Where to pick a show back up, given the newest local history row
/// (`(episode, completed)`) and the tracker's reported progress.
///
/// Local history wins whenever it is ahead: remote sync can lag behind
/// because partial progress sits in the queue until the next drain.
pub(crate) fn continue_target_episode(
    local_latest: Option<(u32, bool)>,
    remote_progress: Option<u32>,
    units: &[u32],
) -> Option<u32> {
    let first = *units.first()?;
    let local_next = local_latest.map(|(episode, completed)| {
        if completed {
            next_unit_number(episode)
        } else {
            episode
        }
    });
    let remote_next = remote_progress.map(next_unit_number);

    let target = match (local_next, remote_next) {
        (Some(local), Some(remote)) if remote > local => remote,
        (Some(local), _) => local,
        (None, Some(remote)) => remote,
        (None, None) => first,
    };

    units.iter().copied().find(|unit| *unit >= target)
}

pub(crate) fn format_clock(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    let mut out = s.to_string();
    if out.chars().count() > max {
        out = out.chars().take(max.saturating_sub(3)).collect::<String>() + "...";
    }
    out
}

pub(crate) fn format_last_seen_display(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M %:z")
                .to_string()
        })
        .unwrap_or_else(|_| raw.to_string())
}
