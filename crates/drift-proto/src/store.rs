//! Persistent key-value store.
//!
//! Every key holds one JSON document. On disk each key is a `<key>.json` file
//! in the data directory; a write serialises the whole value to a temp file
//! and renames it over the old one, so readers never see a half-written
//! document. Reads that hit a missing or malformed document fall back to
//! `None` (or the caller's default) and log at `warn`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Well-known keys. Per-channel keys are built with [`channel_key`].
pub mod keys {
    pub const TAGS_CACHE: &str = "tags";
    pub const SERVERS_CACHE: &str = "servers";
    pub const LAST_SERVER: &str = "last_server";
    pub const SELECTED_TAG: &str = "selected.tag";
    pub const SELECTED_SPACE_SOURCE: &str = "selected.space_source";
    pub const SELECTED_ATC_SOURCE: &str = "selected.atc_source";
    pub const SELECTED_CURATED_STATION: &str = "selected.curated_station";
    pub const VOLUME: &str = "volume";
    pub const COLLAPSED: &str = "collapsed";
}

/// `blacklist.curated`, `favorites.roulette`, ...
pub fn channel_key(prefix: &str, channel: &str) -> String {
    format!("{}.{}", prefix, channel)
}

#[derive(Clone)]
enum Backend {
    Dir(PathBuf),
    Memory(Arc<Mutex<HashMap<String, String>>>),
}

/// Cheaply cloneable handle; clones share the same backing storage.
#[derive(Clone)]
pub struct KvStore {
    backend: Backend,
}

impl KvStore {
    /// File-backed store rooted at `dir` (created lazily on first write).
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Dir(dir.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    fn path_for(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}.json", key))
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        match &self.backend {
            Backend::Dir(dir) => match std::fs::read_to_string(Self::path_for(dir, key)) {
                Ok(content) => Some(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    warn!("store: failed to read {}: {}", key, e);
                    None
                }
            },
            Backend::Memory(map) => map.lock().ok()?.get(key).cloned(),
        }
    }

    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Dir(dir) => {
                let io_err = |source| StoreError::Io {
                    key: key.to_string(),
                    source,
                };
                std::fs::create_dir_all(dir).map_err(io_err)?;
                let path = Self::path_for(dir, key);
                let tmp = dir.join(format!(".{}.json.tmp", key));
                std::fs::write(&tmp, value).map_err(io_err)?;
                std::fs::rename(&tmp, &path).map_err(io_err)?;
                Ok(())
            }
            Backend::Memory(map) => {
                if let Ok(mut guard) = map.lock() {
                    guard.insert(key.to_string(), value.to_string());
                }
                Ok(())
            }
        }
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Dir(dir) => match std::fs::remove_file(Self::path_for(dir, key)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StoreError::Io {
                    key: key.to_string(),
                    source,
                }),
            },
            Backend::Memory(map) => {
                if let Ok(mut guard) = map.lock() {
                    guard.remove(key);
                }
                Ok(())
            }
        }
    }

    /// Decode the document under `key`. Missing and malformed documents both
    /// read as `None`; the latter is logged.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key)?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("store: malformed JSON under {}, using defaults: {}", key, e);
                None
            }
        }
    }

    pub fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.get_json(key).unwrap_or_default()
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, &raw)
    }

    /// Plain string values (last server, selected tag) are stored as JSON
    /// strings like everything else.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_json::<String>(key).filter(|s| !s.is_empty())
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_json(key, value)
    }
}
