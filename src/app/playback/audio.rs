use serde::Deserialize;

use crate::app::catalog::Subtitle;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct AudioTrack {
    pub(crate) index: u32,
    #[serde(default)]
    pub(crate) label: String,
    #[serde(default)]
    pub(crate) language: String,
    /// "dub", "sub", "original", or unset.
    #[serde(default, rename = "type")]
    pub(crate) track_type: Option<String>,
}

const DUB_MARKERS: [&str; 4] = ["dub", "dubbed", "english", "eng"];
const SUB_MARKERS: [&str; 5] = ["sub", "japanese", "original", "jpn", "jp"];

/// Guesses a track type from its label. Dub markers are checked first, so a
/// label such as "English Sub" classifies as "dub".
pub(crate) fn classify_track_label(label: &str) -> &'static str {
    let lowered = label.to_lowercase();
    if DUB_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        "dub"
    } else if SUB_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        "sub"
    } else {
        "unknown"
    }
}

fn has_explicit_type(track: &AudioTrack) -> bool {
    track
        .track_type
        .as_deref()
        .map(str::trim)
        .is_some_and(|kind| !kind.is_empty() && !kind.eq_ignore_ascii_case("unknown"))
}

/// Picks the track matching `preference`. `None` means the caller should ask
/// the user, not that anything failed.
///
/// A track matched through its label has its `track_type` filled in so later
/// lookups see the classified value.
pub(crate) fn select_track<'a>(
    tracks: &'a mut [AudioTrack],
    preference: &str,
) -> Option<&'a AudioTrack> {
    match tracks.len() {
        0 => return None,
        1 => return tracks.first(),
        _ => {}
    }

    let preference = preference.trim().to_lowercase();

    if let Some(idx) = tracks.iter().position(|track| {
        has_explicit_type(track)
            && track
                .track_type
                .as_deref()
                .is_some_and(|kind| kind.trim().eq_ignore_ascii_case(&preference))
    }) {
        return tracks.get(idx);
    }

    let idx = tracks.iter().position(|track| {
        !has_explicit_type(track) && classify_track_label(&track.label) == preference
    })?;
    let track = &mut tracks[idx];
    track.track_type = Some(preference);
    Some(&tracks[idx])
}

/// Subtitles only accompany non-dubbed audio; English is preferred.
pub(crate) fn select_subtitle(
    subtitles: &[Subtitle],
    audio: Option<&AudioTrack>,
) -> Option<Subtitle> {
    let dubbed = audio
        .and_then(|track| track.track_type.as_deref())
        .is_some_and(|kind| kind.eq_ignore_ascii_case("dub"));
    if dubbed {
        return None;
    }
    subtitles
        .iter()
        .find(|sub| {
            let lang = sub.language.to_lowercase();
            lang.starts_with("en") || sub.label.to_lowercase().contains("english")
        })
        .or_else(|| subtitles.first())
        .cloned()
}
