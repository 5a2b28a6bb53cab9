//! Saved stations, one list per channel.
//!
//! Entries are snapshots taken when the station was favorited; they do not
//! follow later changes in the directory.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::Station;
use crate::store::{channel_key, KvStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavoriteEntry {
    pub stationuuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url_resolved: String,
    #[serde(default)]
    pub tags: String,
}

impl From<&Station> for FavoriteEntry {
    fn from(station: &Station) -> Self {
        Self {
            stationuuid: station.id.clone(),
            name: station.name.clone(),
            url_resolved: station.url.clone(),
            tags: station.tags.clone(),
        }
    }
}

impl From<&FavoriteEntry> for Station {
    fn from(fav: &FavoriteEntry) -> Self {
        Station {
            id: fav.stationuuid.clone(),
            name: fav.name.clone(),
            url: fav.url_resolved.clone(),
            tags: fav.tags.clone(),
            ..Station::default()
        }
    }
}

#[derive(Clone)]
pub struct Favorites {
    store: KvStore,
    key: String,
}

impl Favorites {
    pub fn new(store: KvStore, namespace: &str) -> Self {
        Self {
            store,
            key: channel_key("favorites", namespace),
        }
    }

    pub fn list(&self) -> Vec<FavoriteEntry> {
        self.store.get_or_default(&self.key)
    }

    fn save(&self, favorites: &[FavoriteEntry]) -> Result<(), StoreError> {
        self.store.set_json(&self.key, favorites)
    }

    pub fn contains(&self, station_id: &str) -> bool {
        self.list().iter().any(|f| f.stationuuid == station_id)
    }

    pub fn get(&self, station_id: &str) -> Option<FavoriteEntry> {
        self.list().into_iter().find(|f| f.stationuuid == station_id)
    }

    /// Returns false if the station was already saved.
    pub fn add(&self, station: &Station) -> Result<bool, StoreError> {
        let mut favorites = self.list();
        if favorites.iter().any(|f| f.stationuuid == station.id) {
            return Ok(false);
        }
        favorites.push(FavoriteEntry::from(station));
        self.save(&favorites)?;
        Ok(true)
    }

    pub fn remove(&self, station_id: &str) -> Result<bool, StoreError> {
        let mut favorites = self.list();
        let before = favorites.len();
        favorites.retain(|f| f.stationuuid != station_id);
        if favorites.len() == before {
            return Ok(false);
        }
        self.save(&favorites)?;
        Ok(true)
    }

    /// Add or remove; returns the new favorite flag.
    pub fn toggle(&self, station: &Station) -> Result<bool, StoreError> {
        if self.remove(&station.id)? {
            Ok(false)
        } else {
            self.add(station)?;
            Ok(true)
        }
    }

    /// Merge by `stationuuid`, keeping existing entries and skipping
    /// duplicates inside `imported` too. Returns how many were added.
    pub fn import(&self, imported: &[FavoriteEntry]) -> Result<usize, StoreError> {
        let mut merged = self.list();
        let before = merged.len();
        for entry in imported {
            if !merged.iter().any(|m| m.stationuuid == entry.stationuuid) {
                merged.push(entry.clone());
            }
        }
        let added = merged.len() - before;
        if added > 0 {
            self.save(&merged)?;
        }
        Ok(added)
    }

    pub fn export_json(&self) -> anyhow::Result<String> {
        export_json(&self.list())
    }
}

/// Pretty-printed JSON array, the export file format.
pub fn export_json(favorites: &[FavoriteEntry]) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(favorites)?)
}

/// Parse an export file. Anything but a JSON array of entries is rejected.
pub fn parse_import(content: &str) -> anyhow::Result<Vec<FavoriteEntry>> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    if !value.is_array() {
        anyhow::bail!("favorites import must be a JSON array");
    }
    Ok(serde_json::from_value(value)?)
}

pub fn read_import_file(path: &Path) -> anyhow::Result<Vec<FavoriteEntry>> {
    let content = std::fs::read_to_string(path)?;
    parse_import(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(id: &str) -> Station {
        Station {
            id: id.to_string(),
            name: format!("Station {}", id),
            url: format!("http://example.com/{}", id),
            tags: "ambient".to_string(),
            ..Station::default()
        }
    }

    #[test]
    fn test_toggle_adds_then_removes() {
        let favs = Favorites::new(KvStore::in_memory(), "roulette");
        assert!(favs.toggle(&station("a")).unwrap());
        assert!(favs.contains("a"));
        assert!(!favs.toggle(&station("a")).unwrap());
        assert!(favs.list().is_empty());
    }

    #[test]
    fn test_add_is_snapshot_and_deduplicated() {
        let favs = Favorites::new(KvStore::in_memory(), "curated");
        assert!(favs.add(&station("a")).unwrap());
        let mut renamed = station("a");
        renamed.name = "Renamed".to_string();
        assert!(!favs.add(&renamed).unwrap());
        assert_eq!(favs.get("a").unwrap().name, "Station a");
    }

    #[test]
    fn test_import_merges_by_id() {
        let favs = Favorites::new(KvStore::in_memory(), "curated");
        favs.add(&station("a")).unwrap();
        let imported = vec![
            FavoriteEntry::from(&station("a")),
            FavoriteEntry::from(&station("b")),
            FavoriteEntry::from(&station("b")),
        ];
        assert_eq!(favs.import(&imported).unwrap(), 1);
        let ids: Vec<_> = favs.list().into_iter().map(|f| f.stationuuid).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_channels_do_not_share_favorites() {
        let store = KvStore::in_memory();
        let curated = Favorites::new(store.clone(), "curated");
        let roulette = Favorites::new(store, "roulette");
        curated.add(&station("a")).unwrap();
        assert!(!roulette.contains("a"));
    }

    #[test]
    fn test_export_then_parse_import() {
        let favs = Favorites::new(KvStore::in_memory(), "roulette");
        favs.add(&station("a")).unwrap();
        let exported = favs.export_json().unwrap();
        assert!(exported.contains("\n  "));
        assert!(exported.contains("\"url_resolved\""));
        let parsed = parse_import(&exported).unwrap();
        assert_eq!(parsed, favs.list());
    }

    #[test]
    fn test_import_rejects_non_array() {
        assert!(parse_import(r#"{"stationuuid": "a"}"#).is_err());
        assert!(parse_import("not json").is_err());
    }
}
