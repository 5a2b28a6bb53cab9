//! Station blacklist with exponential cooldown.
//!
//! A failing station is exiled for `base * 2^(fails-1)`, capped at `max`.
//! Entries whose cooldown has lapsed are only removed when they are next read;
//! nothing sweeps the document in the background. A station that reaches the
//! playing state loses its entry entirely, so the next failure starts the
//! backoff again from `base`.
//!
//! Each namespace (one per channel) is a single JSON document
//! `{station_id: {fails, until}}` rewritten on every mutation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::protocol::Station;
use crate::store::{channel_key, KvStore, StoreError};

pub const BASE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub fails: u32,
    /// Cooldown expiry, Unix milliseconds.
    pub until: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BlacklistPolicy {
    fn default() -> Self {
        Self {
            base: BASE_TTL,
            max: MAX_TTL,
        }
    }
}

impl BlacklistPolicy {
    /// `min(base * 2^(fails-1), max)`. `fails` of 0 is treated as 1.
    pub fn cooldown(&self, fails: u32) -> Duration {
        let exp = fails.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}

type Document = HashMap<String, BlacklistEntry>;

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Blacklist bound to one store. The namespace is passed per call so a single
/// manager can serve every channel.
#[derive(Clone)]
pub struct Blacklist {
    store: KvStore,
    policy: BlacklistPolicy,
}

impl Blacklist {
    pub fn new(store: KvStore, policy: BlacklistPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> BlacklistPolicy {
        self.policy
    }

    fn key(namespace: &str) -> String {
        channel_key("blacklist", namespace)
    }

    fn load(&self, namespace: &str) -> Document {
        self.store.get_or_default(&Self::key(namespace))
    }

    fn save(&self, namespace: &str, doc: &Document) -> Result<(), StoreError> {
        self.store.set_json(&Self::key(namespace), doc)
    }

    pub fn is_blacklisted(&self, namespace: &str, station_id: &str) -> bool {
        self.is_blacklisted_at(namespace, station_id, now_millis())
    }

    /// True iff an entry exists with `until > now`. An expired entry is
    /// deleted as a side effect.
    pub fn is_blacklisted_at(&self, namespace: &str, station_id: &str, now: i64) -> bool {
        let mut doc = self.load(namespace);
        let Some(entry) = doc.get(station_id) else {
            return false;
        };
        if now < entry.until {
            return true;
        }
        doc.remove(station_id);
        if let Err(e) = self.save(namespace, &doc) {
            warn!("blacklist: failed to evict {} from {}: {}", station_id, namespace, e);
        }
        false
    }

    pub fn blacklist(&self, namespace: &str, station_id: &str) -> Result<BlacklistEntry, StoreError> {
        self.blacklist_at(namespace, station_id, now_millis())
    }

    pub fn blacklist_at(
        &self,
        namespace: &str,
        station_id: &str,
        now: i64,
    ) -> Result<BlacklistEntry, StoreError> {
        let mut doc = self.load(namespace);
        let fails = doc.get(station_id).map_or(0, |e| e.fails) + 1;
        let ttl = self.policy.cooldown(fails);
        let entry = BlacklistEntry {
            fails,
            until: now.saturating_add(ttl.as_millis() as i64),
        };
        doc.insert(station_id.to_string(), entry);
        self.save(namespace, &doc)?;
        info!(
            "Station {} blacklisted in {} for {}h (fail #{})",
            station_id,
            namespace,
            ttl.as_secs() / 3600,
            fails
        );
        Ok(entry)
    }

    /// Forget all failure history for a station. Returns whether an entry
    /// was removed.
    pub fn unblacklist(&self, namespace: &str, station_id: &str) -> Result<bool, StoreError> {
        let mut doc = self.load(namespace);
        if doc.remove(station_id).is_none() {
            return Ok(false);
        }
        self.save(namespace, &doc)?;
        info!("Station {} removed from {} blacklist (now playing)", station_id, namespace);
        Ok(true)
    }

    /// Raw entry lookup without eviction.
    pub fn entry(&self, namespace: &str, station_id: &str) -> Option<BlacklistEntry> {
        self.load(namespace).get(station_id).copied()
    }

    pub fn available_count(&self, namespace: &str, stations: &[Station]) -> usize {
        self.available_count_at(namespace, stations, now_millis())
    }

    /// Stations not under cooldown. The namespace document is read once and
    /// every lapsed entry is evicted in the same pass.
    pub fn available_count_at(&self, namespace: &str, stations: &[Station], now: i64) -> usize {
        let mut doc = self.load(namespace);
        let before = doc.len();
        doc.retain(|_, entry| now < entry.until);
        if doc.len() != before {
            if let Err(e) = self.save(namespace, &doc) {
                warn!("blacklist: failed to evict lapsed entries from {}: {}", namespace, e);
            }
        }
        stations.iter().filter(|s| !doc.contains_key(&s.id)).count()
    }
}
