/// Per-channel playback session controller.
///
/// One `ChannelController` owns one media backend (an mpv process in the
/// daemon, a fake in tests) and drives it through:
///
/// ```text
///   Idle ──play──▶ Connecting ──playing──▶ Playing ──stop──▶ Paused
///                     │   ▲                   │                │
///                  waiting│                waiting           resume
///                     ▼   │                   ▼                │
///                  Buffering ◀────────────────┘     Connecting ◀┘
///                     │
///          watchdog / error ──▶ Unavailable (manual)
///                               or next eligible station (auto-retry)
/// ```
///
/// Every `play` issues a new session token. Media events and watchdog timers
/// carry the token they were created under; anything older than the current
/// token is dropped on entry.
use async_trait::async_trait;
use drift_proto::blacklist::Blacklist;
use drift_proto::favorites::Favorites;
use drift_proto::protocol::{ChannelId, ChannelState, PlaybackStatus, Station};
use drift_proto::rotation::Rotation;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::core::DaemonEvent;

pub const MSG_STATION_OFFLINE: &str = "Station offline - try another";
pub const MSG_ALL_OFFLINE: &str = "All stations offline";
pub const MSG_NO_WORKING: &str = "No working stations";
pub const MSG_NO_STATIONS: &str = "No stations loaded";
pub const MSG_STREAM_ERROR: &str = "Stream unavailable";

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEventKind {
    /// Audio is actually being produced.
    Playing,
    /// Delivery stalled; the backend is waiting for data.
    Waiting,
    Error(String),
    /// The media reached its natural end.
    Ended,
    Title(Option<String>),
}

#[derive(Debug, Clone)]
pub struct MediaEvent {
    pub channel: ChannelId,
    pub session: u64,
    pub kind: MediaEventKind,
}

/// The platform audio pipeline for one channel.
///
/// `load` replaces whatever was bound before; events for the new media must
/// be reported under `session`.
#[async_trait]
pub trait MediaBackend: Send {
    async fn load(&mut self, url: &str, session: u64, volume: f32) -> anyhow::Result<()>;
    async fn pause(&mut self) -> anyhow::Result<()>;
    async fn resume(&mut self) -> anyhow::Result<()>;
    /// Detach the current media entirely.
    async fn unload(&mut self) -> anyhow::Result<()>;
    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()>;
    async fn shutdown(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    /// User picked this station; failures stop and report.
    Manual,
    /// Failures advance through the rotation.
    AutoRetry,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub buffering_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retry_attempts: u32,
}

pub struct ChannelController<B: MediaBackend> {
    channel: ChannelId,
    backend: B,
    /// Present only on channels that exile failing stations.
    blacklist: Option<Blacklist>,
    favorites: Option<Favorites>,
    rotation: Rotation<Station>,
    settings: ControllerSettings,
    events: mpsc::Sender<DaemonEvent>,

    session: u64,
    mode: PlayMode,
    stopping: bool,
    /// The backend holds `current` and can simply be unpaused.
    bound: bool,
    retries: u32,
    watchdog: Option<AbortHandle>,

    current: Option<Station>,
    status: PlaybackStatus,
    message: String,
    title: Option<String>,
    source: Option<String>,
    volume: f32,
}

impl<B: MediaBackend> ChannelController<B> {
    pub fn new(
        channel: ChannelId,
        backend: B,
        blacklist: Option<Blacklist>,
        favorites: Option<Favorites>,
        settings: ControllerSettings,
        events: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            channel,
            backend,
            blacklist,
            favorites,
            rotation: Rotation::default(),
            settings,
            events,
            session: 0,
            mode: PlayMode::Manual,
            stopping: false,
            bound: false,
            retries: 0,
            watchdog: None,
            current: None,
            status: PlaybackStatus::Idle,
            message: PlaybackStatus::Idle.label().to_string(),
            title: None,
            source: None,
            volume: 0.5,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn set_source_label(&mut self, source: Option<String>) {
        self.source = source;
    }

    /// Surface a failure that happened outside the session (e.g. the
    /// station list could not be fetched).
    pub fn report_unavailable(&mut self, message: &str) {
        self.cancel_watchdog();
        self.bound = false;
        self.set_status(PlaybackStatus::Unavailable, message);
    }

    /// Replace the station list and reseed the rotation. The bound station
    /// (if any) keeps playing.
    pub fn set_stations(&mut self, stations: Vec<Station>) {
        debug!("{}: {} stations loaded", self.channel, stations.len());
        self.rotation.seed(stations);
    }

    /// Published snapshot of this channel.
    pub fn snapshot(&self) -> ChannelState {
        let total = self.rotation.len();
        let available = match &self.blacklist {
            Some(blacklist) => blacklist.available_count(self.channel.as_str(), self.rotation.items()),
            None => total,
        };
        let is_favorite = match (&self.favorites, &self.current) {
            (Some(favorites), Some(station)) => favorites.contains(&station.id),
            _ => false,
        };
        ChannelState {
            status: self.status,
            message: self.message.clone(),
            station: self.current.clone(),
            title: self.title.clone(),
            available,
            total,
            is_favorite,
            source: self.source.clone(),
            muted: false,
        }
    }

    // ── user actions ──────────────────────────────────────────────────────────

    /// Play `station_id` from the loaded list (or the favorites) in manual
    /// mode; without an id, advance through the rotation in auto-retry mode.
    pub async fn play(&mut self, station_id: Option<&str>) {
        self.retries = 0;
        let Some(id) = station_id else {
            self.advance().await;
            return;
        };

        let station = self
            .rotation
            .find(|s| s.id == id)
            .cloned()
            .or_else(|| {
                self.favorites
                    .as_ref()
                    .and_then(|f| f.get(id))
                    .map(|fav| Station::from(&fav))
            });

        match station {
            Some(station) => self.play_manual(station).await,
            None => {
                warn!("{}: unknown station {}", self.channel, id);
                self.set_status(PlaybackStatus::Unavailable, "Unknown station");
            }
        }
    }

    /// Play a station that is not necessarily part of the rotation.
    pub async fn play_manual(&mut self, station: Station) {
        self.retries = 0;
        if let Err(e) = self.start(station, PlayMode::Manual).await {
            warn!("{}: play rejected: {}", self.channel, e);
            self.record_failure();
            let message = self.offline_message();
            self.set_status(PlaybackStatus::Unavailable, message);
        }
    }

    /// Next eligible station in auto-retry mode.
    pub async fn shuffle(&mut self) {
        self.retries = 0;
        self.advance().await;
    }

    /// Pause the session. Never blacklists; the rotation is left as is.
    pub async fn stop(&mut self) {
        self.stopping = true;
        self.cancel_watchdog();
        if let Err(e) = self.backend.pause().await {
            debug!("{}: pause failed: {}", self.channel, e);
        }
        let status = if self.current.is_some() {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Idle
        };
        self.set_status(status, status.label());
    }

    /// Detach the source completely (used when a source is deselected).
    pub async fn clear(&mut self) {
        self.stopping = true;
        self.cancel_watchdog();
        self.session += 1;
        self.bound = false;
        if let Err(e) = self.backend.unload().await {
            debug!("{}: unload failed: {}", self.channel, e);
        }
        self.current = None;
        self.title = None;
        self.set_status(PlaybackStatus::Idle, PlaybackStatus::Idle.label());
    }

    /// Resume the bound source. A station that failed is loaded again;
    /// with nothing selected, or when the backend refuses, something fresh
    /// is started.
    pub async fn resume(&mut self) {
        self.retries = 0;
        let Some(station) = self.current.clone() else {
            self.advance().await;
            return;
        };

        if !self.bound {
            let mode = self.mode;
            if let Err(e) = self.start(station, mode).await {
                warn!("{}: reload rejected: {}", self.channel, e);
                self.fail().await;
            }
            return;
        }

        match self.backend.resume().await {
            Ok(()) => {
                self.stopping = false;
                self.set_status(PlaybackStatus::Connecting, PlaybackStatus::Connecting.label());
                let timeout = self.settings.connect_timeout;
                self.arm_watchdog(timeout);
            }
            Err(e) => {
                warn!("{}: resume rejected ({}), picking a fresh station", self.channel, e);
                self.advance().await;
            }
        }
    }

    pub async fn toggle(&mut self) {
        if self.status.is_active() {
            self.stop().await;
        } else {
            self.resume().await;
        }
    }

    pub async fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if self.current.is_some() {
            if let Err(e) = self.backend.set_volume(self.volume).await {
                debug!("{}: set volume failed: {}", self.channel, e);
            }
        }
    }

    /// Add or remove the bound station from the favorites. Returns the new
    /// flag, or `None` when nothing is playing or the channel keeps no
    /// favorites.
    pub fn toggle_favorite(&self) -> anyhow::Result<Option<bool>> {
        match (&self.favorites, &self.current) {
            (Some(favorites), Some(station)) => Ok(Some(favorites.toggle(station)?)),
            _ => Ok(None),
        }
    }

    pub async fn shutdown(&mut self) {
        self.cancel_watchdog();
        self.backend.shutdown().await;
    }

    // ── platform events ───────────────────────────────────────────────────────

    pub async fn on_media_event(&mut self, session: u64, kind: MediaEventKind) {
        if session != self.session {
            debug!(
                "{}: dropping {:?} from stale session {} (current {})",
                self.channel, kind, session, self.session
            );
            return;
        }

        if let MediaEventKind::Title(title) = kind {
            self.title = title;
            return;
        }

        if self.stopping {
            debug!("{}: ignoring {:?} while stopped", self.channel, kind);
            return;
        }

        match kind {
            MediaEventKind::Playing => {
                self.cancel_watchdog();
                self.retries = 0;
                if let (Some(blacklist), Some(station)) = (&self.blacklist, &self.current) {
                    if let Err(e) = blacklist.unblacklist(self.channel.as_str(), &station.id) {
                        warn!("{}: failed to clear blacklist entry: {}", self.channel, e);
                    }
                }
                let name = self
                    .current
                    .as_ref()
                    .map(|s| s.display_name().to_string())
                    .unwrap_or_default();
                info!("{}: playing {}", self.channel, name);
                self.set_status(PlaybackStatus::Playing, PlaybackStatus::Playing.label());
            }
            MediaEventKind::Waiting => {
                if matches!(
                    self.status,
                    PlaybackStatus::Connecting | PlaybackStatus::Buffering | PlaybackStatus::Playing
                ) {
                    self.set_status(PlaybackStatus::Buffering, PlaybackStatus::Buffering.label());
                    let timeout = self.settings.buffering_timeout;
                    self.arm_watchdog(timeout);
                }
            }
            MediaEventKind::Error(reason) => {
                warn!("{}: playback error: {}", self.channel, reason);
                self.fail().await;
            }
            MediaEventKind::Ended => {
                if self.channel == ChannelId::Space {
                    self.advance().await;
                } else {
                    warn!("{}: stream ended", self.channel);
                    self.fail().await;
                }
            }
            MediaEventKind::Title(_) => {}
        }
    }

    pub async fn on_watchdog(&mut self, session: u64) {
        if session != self.session || self.stopping {
            return;
        }
        if matches!(
            self.status,
            PlaybackStatus::Connecting | PlaybackStatus::Buffering
        ) {
            warn!(
                "{}: no audio from {} in time",
                self.channel,
                self.current.as_ref().map(|s| s.display_name()).unwrap_or("?")
            );
            self.fail().await;
        }
    }

    // ── internals ─────────────────────────────────────────────────────────────

    /// Tear down the previous session and bind `station` under a new token.
    async fn start(&mut self, station: Station, mode: PlayMode) -> anyhow::Result<()> {
        self.cancel_watchdog();
        self.session += 1;
        self.stopping = false;
        self.mode = mode;
        self.title = None;
        info!(
            "{}: session {} -> {} ({:?})",
            self.channel,
            self.session,
            station.display_name(),
            mode
        );
        let url = station.url.clone();
        self.current = Some(station);
        self.set_status(PlaybackStatus::Connecting, PlaybackStatus::Connecting.label());

        self.bound = false;
        self.backend.load(&url, self.session, self.volume).await?;
        self.bound = true;
        let timeout = self.settings.connect_timeout;
        self.arm_watchdog(timeout);
        Ok(())
    }

    fn next_eligible(&mut self) -> Option<Station> {
        let namespace = self.channel.as_str();
        match &self.blacklist {
            Some(blacklist) => self
                .rotation
                .next(|s| !blacklist.is_blacklisted(namespace, &s.id))
                .cloned(),
            None => self.rotation.next(|_| true).cloned(),
        }
    }

    /// Walk the rotation in auto-retry mode until a load is accepted, the
    /// rotation has nothing eligible, or the retry budget runs out.
    async fn advance(&mut self) {
        loop {
            let Some(station) = self.next_eligible() else {
                self.cancel_watchdog();
                let message = if self.rotation.is_empty() {
                    MSG_NO_STATIONS
                } else {
                    MSG_ALL_OFFLINE
                };
                info!("{}: {}", self.channel, message);
                self.set_status(PlaybackStatus::Unavailable, message);
                return;
            };

            match self.start(station, PlayMode::AutoRetry).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("{}: load rejected: {}", self.channel, e);
                    self.record_failure();
                    if !self.count_retry() {
                        return;
                    }
                }
            }
        }
    }

    /// Blacklist the bound station and decide what happens next.
    async fn fail(&mut self) {
        self.cancel_watchdog();
        self.bound = false;
        self.record_failure();

        if self.mode == PlayMode::AutoRetry && self.channel.uses_failover() {
            if self.count_retry() {
                self.advance().await;
            }
        } else {
            let message = self.offline_message();
            self.set_status(PlaybackStatus::Unavailable, message);
        }
    }

    /// Count one automatic retry. Returns false (and reports exhaustion) once
    /// the budget is spent.
    fn count_retry(&mut self) -> bool {
        self.retries += 1;
        if self.retries >= self.settings.max_retry_attempts {
            warn!(
                "{}: giving up after {} attempts",
                self.channel, self.retries
            );
            self.set_status(PlaybackStatus::Unavailable, MSG_NO_WORKING);
            return false;
        }
        true
    }

    fn record_failure(&self) {
        if let (Some(blacklist), Some(station)) = (&self.blacklist, &self.current) {
            match blacklist.blacklist(self.channel.as_str(), &station.id) {
                Ok(entry) => debug!("{}: {} now at {} fails", self.channel, station.id, entry.fails),
                Err(e) => warn!("{}: failed to persist blacklist: {}", self.channel, e),
            }
        }
    }

    fn offline_message(&self) -> &'static str {
        if self.channel.uses_failover() {
            MSG_STATION_OFFLINE
        } else {
            MSG_STREAM_ERROR
        }
    }

    fn set_status(&mut self, status: PlaybackStatus, message: &str) {
        self.status = status;
        self.message = message.to_string();
    }

    fn arm_watchdog(&mut self, timeout: Duration) {
        self.cancel_watchdog();
        let events = self.events.clone();
        let channel = self.channel;
        let session = self.session;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(DaemonEvent::Watchdog { channel, session }).await;
        });
        self.watchdog = Some(task.abort_handle());
    }

    fn cancel_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use drift_proto::blacklist::BlacklistPolicy;
    use drift_proto::store::KvStore;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    impl<B: MediaBackend> ChannelController<B> {
        pub fn session(&self) -> u64 {
            self.session
        }

        pub fn current(&self) -> Option<&Station> {
            self.current.as_ref()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Load(String, u64),
        Pause,
        Resume,
        Unload,
        Volume,
    }

    /// Records every call; URLs in `broken` reject `load`.
    #[derive(Clone, Default)]
    pub struct FakeBackend {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub broken: Arc<Mutex<HashSet<String>>>,
        pub reject_resume: Arc<Mutex<bool>>,
    }

    impl FakeBackend {
        pub fn loads(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match c {
                    Call::Load(url, _) => Some(url.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl MediaBackend for FakeBackend {
        async fn load(&mut self, url: &str, session: u64, _volume: f32) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Load(url.to_string(), session));
            if self.broken.lock().unwrap().contains(url) {
                anyhow::bail!("load rejected");
            }
            Ok(())
        }

        async fn pause(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Pause);
            Ok(())
        }

        async fn resume(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Resume);
            if *self.reject_resume.lock().unwrap() {
                anyhow::bail!("resume rejected");
            }
            Ok(())
        }

        async fn unload(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Unload);
            Ok(())
        }

        async fn set_volume(&mut self, _volume: f32) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Volume);
            Ok(())
        }

        async fn shutdown(&mut self) {}
    }

    pub fn station(id: &str) -> Station {
        Station {
            id: id.to_string(),
            name: id.to_uppercase(),
            url: format!("http://{}/stream", id),
            ..Station::default()
        }
    }

    struct Harness {
        controller: ChannelController<FakeBackend>,
        backend: FakeBackend,
        blacklist: Blacklist,
        events: mpsc::Receiver<DaemonEvent>,
    }

    fn harness(channel: ChannelId, ids: &[&str], max_retry_attempts: u32) -> Harness {
        let store = KvStore::in_memory();
        let blacklist = Blacklist::new(store.clone(), BlacklistPolicy::default());
        let backend = FakeBackend::default();
        let (tx, rx) = mpsc::channel(16);
        let settings = ControllerSettings {
            buffering_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            max_retry_attempts,
        };
        let uses_failover = channel.uses_failover();
        let mut controller = ChannelController::new(
            channel,
            backend.clone(),
            uses_failover.then(|| blacklist.clone()),
            uses_failover.then(|| Favorites::new(store.clone(), channel.as_str())),
            settings,
            tx,
        );
        controller.set_stations(ids.iter().map(|id| station(id)).collect());
        Harness {
            controller,
            backend,
            blacklist,
            events: rx,
        }
    }

    fn current_id(h: &Harness) -> String {
        h.controller.current().map(|s| s.id.clone()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_playing_event_reaches_playing_and_clears_blacklist() {
        let mut h = harness(ChannelId::Roulette, &["a"], 10);
        h.blacklist.blacklist_at("roulette", "a", 0).unwrap();

        h.controller.play(Some("a")).await;
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);

        let session = h.controller.session();
        h.controller.on_media_event(session, MediaEventKind::Playing).await;
        assert_eq!(h.controller.status(), PlaybackStatus::Playing);
        assert!(h.blacklist.entry("roulette", "a").is_none());
    }

    #[tokio::test]
    async fn test_stale_session_events_are_ignored() {
        let mut h = harness(ChannelId::Roulette, &["a", "b"], 10);
        h.controller.play(Some("a")).await;
        let old = h.controller.session();
        h.controller.play(Some("b")).await;
        let new = h.controller.session();
        assert!(new > old);

        h.controller
            .on_media_event(old, MediaEventKind::Error("late".to_string()))
            .await;
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);
        assert_eq!(current_id(&h), "b");
        assert!(h.blacklist.entry("roulette", "a").is_none());

        h.controller.on_watchdog(old).await;
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);
    }

    #[tokio::test]
    async fn test_stop_never_blacklists() {
        let mut h = harness(ChannelId::Curated, &["a"], 10);
        h.controller.play(Some("a")).await;
        let session = h.controller.session();
        h.controller.on_media_event(session, MediaEventKind::Playing).await;

        h.controller.stop().await;
        assert_eq!(h.controller.status(), PlaybackStatus::Paused);

        h.controller
            .on_media_event(session, MediaEventKind::Error("aborted".to_string()))
            .await;
        h.controller.on_media_event(session, MediaEventKind::Waiting).await;
        h.controller.on_watchdog(session).await;

        assert_eq!(h.controller.status(), PlaybackStatus::Paused);
        assert!(h.blacklist.entry("curated", "a").is_none());
    }

    #[tokio::test]
    async fn test_manual_error_reports_offline_without_advancing() {
        let mut h = harness(ChannelId::Curated, &["a", "b"], 10);
        h.controller.play(Some("a")).await;
        let session = h.controller.session();
        h.controller
            .on_media_event(session, MediaEventKind::Error("404".to_string()))
            .await;

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, PlaybackStatus::Unavailable);
        assert_eq!(snapshot.message, MSG_STATION_OFFLINE);
        assert_eq!(h.backend.loads().len(), 1);
        assert_eq!(h.blacklist.entry("curated", "a").unwrap().fails, 1);
        assert_eq!(snapshot.available, 1);
    }

    #[tokio::test]
    async fn test_buffering_watchdog_advances_in_auto_mode() {
        let mut h = harness(ChannelId::Roulette, &["a", "b", "c"], 10);
        h.controller.shuffle().await;
        let first = current_id(&h);
        let session = h.controller.session();

        h.controller.on_media_event(session, MediaEventKind::Playing).await;
        h.controller.on_media_event(session, MediaEventKind::Waiting).await;
        assert_eq!(h.controller.status(), PlaybackStatus::Buffering);

        h.controller.on_watchdog(session).await;
        assert_eq!(h.blacklist.entry("roulette", &first).unwrap().fails, 1);
        assert_ne!(current_id(&h), first);
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);
        assert!(h.controller.session() > session);
    }

    #[tokio::test]
    async fn test_watchdog_timer_fires_event() {
        tokio::time::pause();
        let mut h = harness(ChannelId::Roulette, &["a"], 10);
        h.controller.play(Some("a")).await;
        let session = h.controller.session();
        h.controller.on_media_event(session, MediaEventKind::Waiting).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        match h.events.recv().await {
            Some(DaemonEvent::Watchdog { channel, session: fired }) => {
                assert_eq!(channel, ChannelId::Roulette);
                assert_eq!(fired, session);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_bound_reports_no_working_stations() {
        let ids: Vec<String> = (0..6).map(|i| format!("s{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut h = harness(ChannelId::Roulette, &refs, 3);
        for id in &ids {
            h.backend.broken.lock().unwrap().insert(format!("http://{}/stream", id));
        }

        h.controller.shuffle().await;

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, PlaybackStatus::Unavailable);
        assert_eq!(snapshot.message, MSG_NO_WORKING);
        assert_eq!(h.backend.loads().len(), 3);
        assert_eq!(snapshot.available, 3);
    }

    #[tokio::test]
    async fn test_all_blacklisted_reports_offline() {
        let mut h = harness(ChannelId::Roulette, &["a", "b"], 10);
        h.blacklist.blacklist("roulette", "a").unwrap();
        h.blacklist.blacklist("roulette", "b").unwrap();

        h.controller.shuffle().await;
        assert_eq!(h.controller.status(), PlaybackStatus::Unavailable);
        assert_eq!(h.controller.snapshot().message, MSG_ALL_OFFLINE);
        assert!(h.backend.loads().is_empty());
    }

    #[tokio::test]
    async fn test_user_action_resets_retry_budget() {
        let mut h = harness(ChannelId::Roulette, &["a", "b", "c", "d"], 2);
        h.controller.shuffle().await;
        let s = h.controller.session();
        h.controller
            .on_media_event(s, MediaEventKind::Error("x".to_string()))
            .await;
        // one retry spent, still going
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);

        h.controller.shuffle().await;
        let s = h.controller.session();
        h.controller
            .on_media_event(s, MediaEventKind::Error("x".to_string()))
            .await;
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);
    }

    #[tokio::test]
    async fn test_resume_reuses_source_then_falls_back() {
        let mut h = harness(ChannelId::Roulette, &["a", "b"], 10);
        h.controller.play(Some("a")).await;
        h.controller.stop().await;
        h.controller.toggle().await;
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);
        assert_eq!(current_id(&h), "a");
        assert_eq!(h.backend.loads().len(), 1);

        h.controller.stop().await;
        *h.backend.reject_resume.lock().unwrap() = true;
        h.controller.resume().await;
        assert_eq!(h.backend.loads().len(), 2);
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);
    }

    #[tokio::test]
    async fn test_toggle_after_failure_reloads_station() {
        let mut h = harness(ChannelId::Curated, &["a", "b"], 10);
        h.controller.play(Some("a")).await;
        let first = h.controller.session();
        h.controller
            .on_media_event(first, MediaEventKind::Error("dropped".to_string()))
            .await;
        assert_eq!(h.controller.status(), PlaybackStatus::Unavailable);
        assert_eq!(h.blacklist.entry("curated", "a").unwrap().fails, 1);

        h.controller.toggle().await;
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);
        assert_eq!(current_id(&h), "a");
        assert_eq!(h.backend.loads().len(), 2);
        assert!(h.controller.session() > first);
        assert!(!h.backend.calls.lock().unwrap().contains(&Call::Resume));

        let session = h.controller.session();
        h.controller.on_media_event(session, MediaEventKind::Playing).await;
        assert_eq!(h.controller.status(), PlaybackStatus::Playing);
        assert!(h.blacklist.entry("curated", "a").is_none());
    }

    #[tokio::test]
    async fn test_stop_then_toggle_after_failure_still_reloads() {
        let mut h = harness(ChannelId::Curated, &["a"], 10);
        h.controller.play(Some("a")).await;
        let session = h.controller.session();
        h.controller.on_watchdog(session).await;
        assert_eq!(h.controller.status(), PlaybackStatus::Unavailable);

        h.controller.stop().await;
        h.controller.toggle().await;
        assert_eq!(h.backend.loads().len(), 2);
        assert!(!h.backend.calls.lock().unwrap().contains(&Call::Resume));
    }

    #[tokio::test]
    async fn test_manual_buffering_watchdog_reports_offline() {
        let mut h = harness(ChannelId::Curated, &["a", "b"], 10);
        h.controller.play(Some("a")).await;
        let session = h.controller.session();
        h.controller.on_media_event(session, MediaEventKind::Playing).await;
        h.controller.on_media_event(session, MediaEventKind::Waiting).await;
        assert_eq!(h.controller.status(), PlaybackStatus::Buffering);

        h.controller.on_watchdog(session).await;
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, PlaybackStatus::Unavailable);
        assert_eq!(snapshot.message, MSG_STATION_OFFLINE);
        assert_eq!(current_id(&h), "a");
        assert_eq!(h.backend.loads().len(), 1);
        assert_eq!(h.blacklist.entry("curated", "a").unwrap().fails, 1);
    }

    #[tokio::test]
    async fn test_silent_connect_times_out_and_fails_over() {
        tokio::time::pause();
        let mut h = harness(ChannelId::Roulette, &["a", "b"], 10);
        h.controller.shuffle().await;
        let first = current_id(&h);
        let session = h.controller.session();

        tokio::time::advance(Duration::from_secs(16)).await;
        let fired = match h.events.recv().await {
            Some(DaemonEvent::Watchdog { session, .. }) => session,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(fired, session);

        h.controller.on_watchdog(fired).await;
        assert_eq!(h.blacklist.entry("roulette", &first).unwrap().fails, 1);
        assert_ne!(current_id(&h), first);
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);
    }

    #[tokio::test]
    async fn test_space_clip_end_plays_another_without_blacklist() {
        let mut h = harness(ChannelId::Space, &["liftoff", "landing"], 10);
        h.controller.shuffle().await;
        let session = h.controller.session();
        h.controller.on_media_event(session, MediaEventKind::Playing).await;
        h.controller.on_media_event(session, MediaEventKind::Ended).await;
        assert_eq!(h.backend.loads().len(), 2);
        assert_eq!(h.controller.status(), PlaybackStatus::Connecting);

        let session = h.controller.session();
        h.controller
            .on_media_event(session, MediaEventKind::Error("gone".to_string()))
            .await;
        assert_eq!(h.controller.status(), PlaybackStatus::Unavailable);
        assert!(h.blacklist.entry("space", "liftoff").is_none());
        assert!(h.blacklist.entry("space", "landing").is_none());
    }

    #[tokio::test]
    async fn test_title_updates_even_while_paused() {
        let mut h = harness(ChannelId::Roulette, &["a"], 10);
        h.controller.play(Some("a")).await;
        let session = h.controller.session();
        h.controller.stop().await;
        h.controller
            .on_media_event(session, MediaEventKind::Title(Some("Artist - Track".to_string())))
            .await;
        assert_eq!(h.controller.snapshot().title.as_deref(), Some("Artist - Track"));
    }

    #[tokio::test]
    async fn test_favorite_toggle_and_play_from_favorites() {
        let mut h = harness(ChannelId::Curated, &["a"], 10);
        assert_eq!(h.controller.toggle_favorite().unwrap(), None);

        h.controller.play(Some("a")).await;
        assert_eq!(h.controller.toggle_favorite().unwrap(), Some(true));
        assert!(h.controller.snapshot().is_favorite);

        // list replaced; the favorite is still playable by id
        h.controller.set_stations(vec![station("z")]);
        h.controller.play(Some("a")).await;
        assert_eq!(current_id(&h), "a");
    }
}
