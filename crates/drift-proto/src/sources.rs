//! Loaders for the static JSON lists: curated stations, space-audio clip
//! sources, and ATC live streams.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::Station;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One entry of `sources.json`: a named clip list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceSource {
    pub name: String,
    /// Clip list file, relative to the sources file.
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceClip {
    pub name: String,
    pub url: String,
}

/// A YouTube live stream; `id` is the video id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtcSource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl AtcSource {
    pub fn stream_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.id)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, SourceError> {
    let content = std::fs::read_to_string(path).map_err(|source| SourceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Curated stations, dropping entries without a playable URL.
pub fn load_curated_stations(path: &Path) -> Result<Vec<Station>, SourceError> {
    let mut stations: Vec<Station> = read_json(path)?;
    stations.retain(|s| !s.url.is_empty());
    Ok(stations)
}

pub fn load_space_sources(path: &Path) -> Result<Vec<SpaceSource>, SourceError> {
    read_json(path)
}

/// Resolve a clip list name against the directory holding `sources.json`.
pub fn resolve_clip_path(sources_file: &Path, json: &str) -> PathBuf {
    let candidate = PathBuf::from(json);
    if candidate.is_absolute() {
        return candidate;
    }
    sources_file
        .parent()
        .map(|dir| dir.join(&candidate))
        .unwrap_or(candidate)
}

pub fn load_space_clips(path: &Path) -> Result<Vec<SpaceClip>, SourceError> {
    read_json(path)
}

pub fn load_atc_sources(path: &Path) -> Result<Vec<AtcSource>, SourceError> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_curated_drops_unplayable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ambient-stations.json");
        std::fs::write(
            &path,
            r#"[
                {"stationuuid": "a", "name": "A", "url_resolved": "http://a/stream"},
                {"stationuuid": "b", "name": "B", "url_resolved": ""}
            ]"#,
        )
        .unwrap();
        let stations = load_curated_stations(&path).unwrap();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].id, "a");
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_atc_sources(Path::new("/nonexistent/atc-sources.json")).unwrap_err();
        assert!(matches!(err, SourceError::Read { .. }));
    }

    #[test]
    fn test_space_sources_and_clips() {
        let dir = tempfile::tempdir().unwrap();
        let sources_path = dir.path().join("sources.json");
        std::fs::write(&sources_path, r#"[{"name": "Apollo 11", "json": "apollo11.json"}]"#).unwrap();
        std::fs::write(
            dir.path().join("apollo11.json"),
            r#"[{"name": "Liftoff", "url": "https://archive.org/liftoff.mp3"}]"#,
        )
        .unwrap();

        let sources = load_space_sources(&sources_path).unwrap();
        let clip_path = resolve_clip_path(&sources_path, &sources[0].json);
        let clips = load_space_clips(&clip_path).unwrap();
        assert_eq!(clips[0].name, "Liftoff");
    }

    #[test]
    fn test_atc_stream_url() {
        let source = AtcSource {
            id: "abc123".to_string(),
            name: "KJFK".to_string(),
            timezone: Some("America/New_York".to_string()),
        };
        assert_eq!(source.stream_url(), "https://www.youtube.com/watch?v=abc123");
    }
}
