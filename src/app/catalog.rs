use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::db::MediaKind;

use super::playback::AudioTrack;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct Subtitle {
    pub(crate) url: String,
    #[serde(default)]
    pub(crate) language: String,
    #[serde(default)]
    pub(crate) label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedStream {
    pub(crate) url: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) referer: Option<String>,
    pub(crate) audio_tracks: Vec<AudioTrack>,
    pub(crate) subtitles: Vec<Subtitle>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum StreamError {
    #[error("no playable source for unit {unit}")]
    NotAvailable { unit: u32 },
    #[error("unit {unit} has an unusable source: {reason}")]
    Invalid { unit: u32, reason: String },
}

pub(crate) trait StreamResolver {
    fn resolve(&self, unit: u32) -> Result<ResolvedStream, StreamError>;
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CatalogKind {
    Tv,
    Movie,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCatalog {
    media_id: String,
    title: String,
    #[serde(default = "default_kind")]
    kind: CatalogKind,
    #[serde(default = "default_season")]
    season: u32,
    #[serde(default)]
    provider: String,
    #[serde(default)]
    tracker_id: Option<i64>,
    #[serde(default)]
    units: Vec<CatalogUnit>,
}

fn default_kind() -> CatalogKind {
    CatalogKind::Tv
}

fn default_season() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CatalogUnit {
    pub(crate) number: u32,
    #[serde(default)]
    pub(crate) url: Option<String>,
    #[serde(default)]
    pub(crate) headers: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) referer: Option<String>,
    #[serde(default)]
    pub(crate) audio_tracks: Vec<AudioTrack>,
    #[serde(default)]
    pub(crate) subtitles: Vec<Subtitle>,
}

/// One media with its already-fetched unit list, read from a JSON file.
#[derive(Debug, Clone)]
pub(crate) struct Catalog {
    pub(crate) media_id: String,
    pub(crate) title: String,
    pub(crate) kind: MediaKind,
    pub(crate) season: u32,
    pub(crate) provider: String,
    pub(crate) tracker_id: Option<i64>,
    units: Vec<CatalogUnit>,
}

impl Catalog {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog at {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid catalog at {}", path.display()))
    }

    pub(crate) fn from_json(raw: &str) -> Result<Self> {
        let parsed: RawCatalog = serde_json::from_str(raw)?;
        let mut units = parsed.units;
        units.sort_by_key(|unit| unit.number);
        units.dedup_by_key(|unit| unit.number);
        Ok(Self {
            media_id: parsed.media_id,
            title: parsed.title,
            kind: match parsed.kind {
                CatalogKind::Tv => MediaKind::Tv,
                CatalogKind::Movie => MediaKind::Movie,
            },
            season: parsed.season,
            provider: parsed.provider,
            tracker_id: parsed.tracker_id,
            units,
        })
    }

    pub(crate) fn unit_numbers(&self) -> Vec<u32> {
        self.units.iter().map(|unit| unit.number).collect()
    }

    pub(crate) fn has_unit(&self, number: u32) -> bool {
        self.units.iter().any(|unit| unit.number == number)
    }

    pub(crate) fn first_unit(&self) -> Option<u32> {
        self.units.first().map(|unit| unit.number)
    }

    pub(crate) fn is_final_unit(&self, number: u32) -> bool {
        self.kind == MediaKind::Movie || self.units.last().is_some_and(|unit| unit.number == number)
    }
}

impl StreamResolver for Catalog {
    fn resolve(&self, unit: u32) -> Result<ResolvedStream, StreamError> {
        let entry = self
            .units
            .iter()
            .find(|candidate| candidate.number == unit)
            .ok_or(StreamError::NotAvailable { unit })?;
        let url = entry
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(StreamError::NotAvailable { unit })?;
        if let Some(name) = entry
            .headers
            .keys()
            .find(|name| name.trim().is_empty() || name.contains([':', '\r', '\n']))
        {
            return Err(StreamError::Invalid {
                unit,
                reason: format!("malformed header name {name:?}"),
            });
        }
        Ok(ResolvedStream {
            url: url.to_string(),
            headers: entry
                .headers
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            referer: entry.referer.clone(),
            audio_tracks: entry.audio_tracks.clone(),
            subtitles: entry.subtitles.clone(),
        })
    }
}
