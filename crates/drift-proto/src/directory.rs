//! radio-browser.info directory client with mirror failover.
//!
//! Candidate order for every request:
//!
//! ```text
//!   last working server
//!   cached server list (shuffled, if younger than the TTL)
//!   fresh server list   (shuffled, only when < min_candidates so far)
//!   hardcoded fallbacks (shuffled, always)
//! ```
//!
//! Duplicates keep their first position. The first mirror to answer with a
//! success status becomes the new "last working" server.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blacklist::now_millis;
use crate::config::DirectoryConfig;
use crate::protocol::{Station, TagInfo};
use crate::store::{keys, KvStore};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("all directory servers unavailable: {last_error}")]
    AllServersUnavailable { last_error: String },

    #[error("malformed directory response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no stations found for tag '{0}'")]
    NoStations(String),
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, DirectoryError> {
        serde_json::from_str(&self.body).map_err(|source| DirectoryError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

/// Plain GET. Non-success statuses are returned as responses; only
/// connection-level failures are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> anyhow::Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &DirectoryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> anyhow::Result<HttpResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse {
            url: url.to_string(),
            status,
            body,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerCache {
    servers: Vec<String>,
    /// Fetch time, Unix milliseconds.
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TagCache {
    tags: Vec<TagInfo>,
    expires: i64,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    name: String,
}

/// Ordered, de-duplicated candidate list.
#[derive(Default)]
struct Candidates {
    servers: Vec<String>,
    seen: HashSet<String>,
}

impl Candidates {
    fn add(&mut self, server: String) {
        if !server.is_empty() && self.seen.insert(server.clone()) {
            self.servers.push(server);
        }
    }

    fn add_shuffled(&mut self, mut list: Vec<String>) {
        list.shuffle(&mut rand::thread_rng());
        for server in list {
            self.add(server);
        }
    }

    fn len(&self) -> usize {
        self.servers.len()
    }
}

pub struct Directory<T: Transport> {
    transport: T,
    store: KvStore,
    config: DirectoryConfig,
}

/// Seconds to milliseconds, saturating at `i64::MAX`.
fn ttl_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

impl<T: Transport> Directory<T> {
    pub fn new(transport: T, store: KvStore, config: DirectoryConfig) -> Self {
        Self {
            transport,
            store,
            config,
        }
    }

    pub fn last_working_server(&self) -> Option<String> {
        self.store.get_string(keys::LAST_SERVER)
    }

    fn cached_servers_at(&self, now: i64) -> Option<Vec<String>> {
        let cache: ServerCache = self.store.get_json(keys::SERVERS_CACHE)?;
        let ttl = ttl_millis(self.config.server_cache_ttl_secs);
        if cache.servers.is_empty() || now.saturating_sub(cache.timestamp) > ttl {
            return None;
        }
        Some(cache.servers)
    }

    async fn fetch_server_list(&self) -> anyhow::Result<Vec<String>> {
        let response = self.transport.get(&self.config.server_list_url).await?;
        if !response.is_success() {
            anyhow::bail!("server list returned {}", response.status);
        }
        let entries: Vec<ServerEntry> = response.json()?;
        if entries.is_empty() {
            anyhow::bail!("no servers in list");
        }
        Ok(entries
            .into_iter()
            .map(|s| format!("https://{}", s.name))
            .collect())
    }

    pub async fn resolve_servers(&self) -> Vec<String> {
        self.resolve_servers_at(now_millis()).await
    }

    pub async fn resolve_servers_at(&self, now: i64) -> Vec<String> {
        let mut candidates = Candidates::default();

        if let Some(last) = self.last_working_server() {
            candidates.add(last);
        }

        if let Some(cached) = self.cached_servers_at(now) {
            candidates.add_shuffled(cached);
        }

        if candidates.len() < self.config.min_candidates {
            match self.fetch_server_list().await {
                Ok(fresh) => {
                    debug!("directory: fetched {} mirrors", fresh.len());
                    let cache = ServerCache {
                        servers: fresh.clone(),
                        timestamp: now,
                    };
                    if let Err(e) = self.store.set_json(keys::SERVERS_CACHE, &cache) {
                        warn!("directory: failed to cache server list: {}", e);
                    }
                    candidates.add_shuffled(fresh);
                }
                Err(e) => warn!("Failed to fetch Radio Browser server list: {}", e),
            }
        }

        candidates.add_shuffled(self.config.fallback_servers.clone());
        candidates.servers
    }

    /// GET `path` against each candidate until one answers with success.
    pub async fn fetch_with_failover(&self, path: &str) -> Result<HttpResponse, DirectoryError> {
        let servers = self.resolve_servers().await;
        let mut last_error: Option<String> = None;

        for server in servers {
            let url = format!("{}{}", server, path);
            match self.transport.get(&url).await {
                Ok(response) if response.is_success() => {
                    if let Err(e) = self.store.set_string(keys::LAST_SERVER, &server) {
                        warn!("directory: failed to remember {}: {}", server, e);
                    }
                    return Ok(response);
                }
                Ok(response) => {
                    warn!(
                        "Radio Browser server {} failed with {}, trying next...",
                        server, response.status
                    );
                    last_error = Some(format!("Server {} returned {}", server, response.status));
                }
                Err(e) => {
                    warn!("Radio Browser server {} error: {} - trying next...", server, e);
                    last_error = Some(format!("Server {}: {}", server, e));
                }
            }
        }

        Err(DirectoryError::AllServersUnavailable {
            last_error: last_error.unwrap_or_else(|| "All Radio Browser servers failed".to_string()),
        })
    }

    /// Stations carrying exactly `tag`, in the directory's random order,
    /// without entries that have no resolved URL.
    pub async fn stations_by_tag(&self, tag: &str) -> Result<Vec<Station>, DirectoryError> {
        let path = format!(
            "/json/stations/bytagexact/{}?order=random&hidebroken=true",
            urlencoding::encode(tag)
        );
        let response = self.fetch_with_failover(&path).await?;
        let mut stations: Vec<Station> = response.json()?;
        stations.retain(|s| !s.url.is_empty());
        if stations.is_empty() {
            return Err(DirectoryError::NoStations(tag.to_string()));
        }
        info!("directory: {} stations for tag '{}'", stations.len(), tag);
        Ok(stations)
    }

    pub async fn tags(&self) -> Result<Vec<TagInfo>, DirectoryError> {
        self.tags_at(now_millis()).await
    }

    /// Tag list, served from the cache while it is fresh.
    pub async fn tags_at(&self, now: i64) -> Result<Vec<TagInfo>, DirectoryError> {
        if let Some(cache) = self.store.get_json::<TagCache>(keys::TAGS_CACHE) {
            if now < cache.expires {
                return Ok(cache.tags);
            }
        }

        let response = self
            .fetch_with_failover("/json/tags?limit=2000&order=stationcount&reverse=true")
            .await?;
        let mut tags: Vec<TagInfo> = response.json()?;
        tags.retain(|t| t.stationcount > self.config.min_tag_station_count);

        let cache = TagCache {
            tags: tags.clone(),
            expires: now.saturating_add(ttl_millis(self.config.tag_cache_ttl_secs)),
        };
        if let Err(e) = self.store.set_json(keys::TAGS_CACHE, &cache) {
            warn!("directory: failed to cache tags: {}", e);
        }
        Ok(tags)
    }
}
