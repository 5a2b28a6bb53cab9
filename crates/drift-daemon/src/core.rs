/// DaemonCore: single-owner event loop for all mutable playback state.
///
/// Every input (client commands, media events from the per-channel mpv
/// processes, watchdog timers, directory fetch results, the heartbeat) is a
/// `DaemonEvent` on one mpsc channel. DaemonCore owns the four channel
/// controllers exclusively; no other task touches them. After each event the
/// controllers' snapshots are copied into the shared `StateManager` and a
/// `BroadcastMessage::StateUpdated` goes out if anything changed.
///
/// Directory requests run in spawned tasks and come back as events, so a slow
/// mirror never blocks playback control.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use drift_proto::blacklist::Blacklist;
use drift_proto::config::Config;
use drift_proto::directory::{Directory, Transport};
use drift_proto::favorites::Favorites;
use drift_proto::protocol::{ChannelId, Command, Station, TagInfo};
use drift_proto::settings;
use drift_proto::sources::{self, AtcSource, SpaceSource};
use drift_proto::state::StateManager;
use drift_proto::store::{keys, KvStore};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::playback::{ChannelController, ControllerSettings, MediaBackend, MediaEvent};
use crate::BroadcastMessage;

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a TCP client or the HTTP API.
    ClientCommand(Command),
    Media(MediaEvent),
    /// A watchdog armed under `session` ran out.
    Watchdog { channel: ChannelId, session: u64 },
    StationsLoaded {
        tag: String,
        result: Result<Vec<Station>, String>,
    },
    TagsLoaded(Result<Vec<TagInfo>, String>),
    /// Periodic refresh (cooldowns lapse without any other event).
    HeartbeatTick,
    Shutdown,
}

/// The four controllers, addressable by id.
struct Channels<B: MediaBackend> {
    curated: ChannelController<B>,
    roulette: ChannelController<B>,
    space: ChannelController<B>,
    atc: ChannelController<B>,
}

impl<B: MediaBackend> Channels<B> {
    fn get(&self, channel: ChannelId) -> &ChannelController<B> {
        match channel {
            ChannelId::Curated => &self.curated,
            ChannelId::Roulette => &self.roulette,
            ChannelId::Space => &self.space,
            ChannelId::Atc => &self.atc,
        }
    }

    fn get_mut(&mut self, channel: ChannelId) -> &mut ChannelController<B> {
        match channel {
            ChannelId::Curated => &mut self.curated,
            ChannelId::Roulette => &mut self.roulette,
            ChannelId::Space => &mut self.space,
            ChannelId::Atc => &mut self.atc,
        }
    }
}

pub struct DaemonCore<B: MediaBackend, T: Transport + 'static> {
    config: Config,
    store: KvStore,
    state_manager: Arc<StateManager>,
    directory: Arc<Directory<T>>,
    channels: Channels<B>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    space_sources: Vec<SpaceSource>,
    atc_sources: Vec<AtcSource>,
    /// Tag whose station list is in flight; results for other tags are stale.
    pending_tag: Option<String>,
    /// Restart roulette playback once the pending list arrives.
    play_after_load: bool,
    last_titles: HashMap<ChannelId, Option<String>>,
    last_published_rev: u64,
}

impl<B: MediaBackend, T: Transport + 'static> DaemonCore<B, T> {
    pub fn new(
        config: Config,
        store: KvStore,
        transport: T,
        mut make_backend: impl FnMut(ChannelId) -> B,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let state_manager = Arc::new(StateManager::new(store.clone()));
        let directory = Arc::new(Directory::new(
            transport,
            store.clone(),
            config.directory.clone(),
        ));
        let blacklist = Blacklist::new(store.clone(), config.playback.blacklist_policy());
        let controller_settings = ControllerSettings {
            buffering_timeout: config.playback.buffering_timeout(),
            connect_timeout: config.playback.connect_timeout(),
            max_retry_attempts: config.playback.max_retry_attempts,
        };

        let mut make = |channel: ChannelId| {
            let failover = channel.uses_failover();
            ChannelController::new(
                channel,
                make_backend(channel),
                failover.then(|| blacklist.clone()),
                failover.then(|| Favorites::new(store.clone(), channel.as_str())),
                controller_settings.clone(),
                event_tx.clone(),
            )
        };
        let channels = Channels {
            curated: make(ChannelId::Curated),
            roulette: make(ChannelId::Roulette),
            space: make(ChannelId::Space),
            atc: make(ChannelId::Atc),
        };

        Self {
            config,
            store,
            state_manager,
            directory,
            channels,
            event_tx,
            broadcast_tx,
            space_sources: Vec::new(),
            atc_sources: Vec::new(),
            pending_tag: None,
            play_after_load: false,
            last_titles: HashMap::new(),
            last_published_rev: 0,
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Load static sources, restore persisted selections and volumes, and
    /// start the initial directory fetches. Nothing starts playing.
    pub async fn bootstrap(&mut self) {
        let curated_path = self.config.sources.curated_stations.clone();
        match sources::load_curated_stations(&curated_path) {
            Ok(stations) => {
                info!("Loaded {} curated stations from {:?}", stations.len(), curated_path);
                self.channels.curated.set_stations(stations);
            }
            Err(e) => warn!("Curated stations unavailable: {}", e),
        }
        let selected_station = self.store.get_string(keys::SELECTED_CURATED_STATION);
        self.channels.curated.set_source_label(selected_station);

        match sources::load_space_sources(&self.config.sources.space_sources) {
            Ok(list) => self.space_sources = list,
            Err(e) => warn!("Space sources unavailable: {}", e),
        }
        let space_source = self
            .store
            .get_string(keys::SELECTED_SPACE_SOURCE)
            .unwrap_or_else(|| self.config.sources.default_space_source.clone());
        self.load_space_source(&space_source);

        match sources::load_atc_sources(&self.config.sources.atc_sources) {
            Ok(list) => self.atc_sources = list,
            Err(e) => warn!("ATC sources unavailable: {}", e),
        }
        if let Some(id) = self.store.get_string(keys::SELECTED_ATC_SOURCE) {
            let station = self.atc_station(&id);
            self.channels.atc.set_stations(vec![station]);
            self.channels.atc.set_source_label(Some(id));
        }

        let tag = self
            .store
            .get_string(keys::SELECTED_TAG)
            .unwrap_or_else(|| self.config.directory.default_tag.clone());
        self.channels.roulette.set_source_label(Some(tag.clone()));
        self.request_stations(tag, false);
        self.request_tags();

        self.apply_all_volumes().await;
        self.publish().await;
    }

    /// Run the event loop until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.bootstrap().await;

        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
                if heartbeat_tx.send(DaemonEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        while let Some(evt) = event_rx.recv().await {
            if matches!(evt, DaemonEvent::Shutdown) {
                info!("DaemonCore: shutdown requested");
                break;
            }
            self.handle_event(evt).await;
        }

        self.cleanup().await;
        Ok(())
    }

    pub async fn handle_event(&mut self, evt: DaemonEvent) {
        match evt {
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("DaemonCore: command error: {}", e);
                }
            }
            DaemonEvent::Media(event) => {
                self.channels
                    .get_mut(event.channel)
                    .on_media_event(event.session, event.kind)
                    .await;
            }
            DaemonEvent::Watchdog { channel, session } => {
                self.channels.get_mut(channel).on_watchdog(session).await;
            }
            DaemonEvent::StationsLoaded { tag, result } => {
                self.on_stations_loaded(tag, result).await;
            }
            DaemonEvent::TagsLoaded(result) => match result {
                Ok(tags) => {
                    info!("Loaded {} tags", tags.len());
                    self.state_manager.set_tags(tags).await;
                }
                Err(e) => warn!("Failed to load tags: {}", e),
            },
            DaemonEvent::HeartbeatTick | DaemonEvent::Shutdown => {}
        }
        self.publish().await;
    }

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Play { channel, station_id } => {
                if channel == ChannelId::Curated {
                    if let Some(id) = &station_id {
                        self.store.set_string(keys::SELECTED_CURATED_STATION, id)?;
                        self.channels.curated.set_source_label(Some(id.clone()));
                    }
                }
                self.channels
                    .get_mut(channel)
                    .play(station_id.as_deref())
                    .await;
            }
            Command::Shuffle { channel } => self.channels.get_mut(channel).shuffle().await,
            Command::Stop { channel } => self.channels.get_mut(channel).stop().await,
            Command::Toggle { channel } => self.channels.get_mut(channel).toggle().await,
            Command::SelectTag { tag } => self.select_tag(tag)?,
            Command::SelectSource { channel, source } => self.select_source(channel, source).await?,
            Command::Volume { channel, value } => {
                self.state_manager.set_channel_volume(channel, value).await?;
                self.apply_volume(channel).await;
            }
            Command::MasterVolume { value } => {
                self.state_manager.set_master_volume(value).await?;
                self.apply_all_volumes().await;
            }
            Command::Mute { channel, muted } => {
                self.state_manager.set_muted(channel, muted).await;
                self.apply_volume(channel).await;
            }
            Command::MuteMaster { muted } => {
                self.state_manager.set_master_muted(muted).await;
                self.apply_all_volumes().await;
            }
            Command::ToggleFavorite { channel } => {
                match self.channels.get(channel).toggle_favorite()? {
                    Some(true) => info!("{}: added to favorites", channel),
                    Some(false) => info!("{}: removed from favorites", channel),
                    None => debug!("{}: nothing to favorite", channel),
                }
                self.state_manager.refresh_favorites(channel).await;
            }
            Command::RemoveFavorite { channel, station_id } => {
                Favorites::new(self.store.clone(), channel.as_str()).remove(&station_id)?;
                self.state_manager.refresh_favorites(channel).await;
            }
            Command::ImportFavorites { channel, favorites } => {
                let added =
                    Favorites::new(self.store.clone(), channel.as_str()).import(&favorites)?;
                info!(
                    "{}: imported {} of {} favorites",
                    channel,
                    added,
                    favorites.len()
                );
                self.state_manager.refresh_favorites(channel).await;
            }
            Command::SetCollapsed { section, collapsed } => {
                settings::set_collapsed(&self.store, &section, collapsed)?;
            }
            Command::Refresh => {
                let tag = self
                    .store
                    .get_string(keys::SELECTED_TAG)
                    .unwrap_or_else(|| self.config.directory.default_tag.clone());
                let playing = self.channels.roulette.status().is_active();
                self.request_stations(tag, playing);
            }
            Command::GetState => {
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
        }
        Ok(())
    }

    fn select_tag(&mut self, tag: String) -> anyhow::Result<()> {
        let tag = tag.trim().to_string();
        if tag.is_empty() {
            anyhow::bail!("empty tag");
        }
        self.store.set_string(keys::SELECTED_TAG, &tag)?;
        self.channels.roulette.set_source_label(Some(tag.clone()));
        let playing = self.channels.roulette.status().is_active();
        self.request_stations(tag, playing);
        Ok(())
    }

    async fn select_source(
        &mut self,
        channel: ChannelId,
        source: Option<String>,
    ) -> anyhow::Result<()> {
        match channel {
            ChannelId::Space => {
                let Some(json) = source else {
                    anyhow::bail!("space needs a source");
                };
                self.store.set_string(keys::SELECTED_SPACE_SOURCE, &json)?;
                let playing = self.channels.space.status().is_active();
                self.load_space_source(&json);
                if playing {
                    self.channels.space.shuffle().await;
                }
            }
            ChannelId::Atc => match source {
                None => {
                    self.store.remove(keys::SELECTED_ATC_SOURCE)?;
                    self.channels.atc.clear().await;
                    self.channels.atc.set_stations(Vec::new());
                    self.channels.atc.set_source_label(None);
                }
                Some(id) => {
                    self.store.set_string(keys::SELECTED_ATC_SOURCE, &id)?;
                    let station = self.atc_station(&id);
                    self.channels.atc.set_stations(vec![station.clone()]);
                    self.channels.atc.set_source_label(Some(id));
                    self.channels.atc.play_manual(station).await;
                }
            },
            ChannelId::Roulette => match source {
                Some(tag) => self.select_tag(tag)?,
                None => anyhow::bail!("roulette needs a tag"),
            },
            ChannelId::Curated => anyhow::bail!("curated has no selectable source"),
        }
        Ok(())
    }

    async fn on_stations_loaded(&mut self, tag: String, result: Result<Vec<Station>, String>) {
        if self.pending_tag.as_deref() != Some(tag.as_str()) {
            debug!("Dropping stale station list for '{}'", tag);
            return;
        }
        self.pending_tag = None;
        let play = std::mem::take(&mut self.play_after_load);
        let roulette = &mut self.channels.roulette;

        match result {
            Ok(stations) => {
                roulette.set_stations(stations);
                if play {
                    roulette.shuffle().await;
                }
            }
            Err(e) => {
                warn!("Failed to load stations for '{}': {}", tag, e);
                roulette.set_stations(Vec::new());
                if !roulette.status().is_active() {
                    roulette.report_unavailable("No stations found - try another genre");
                }
            }
        }
    }

    fn request_stations(&mut self, tag: String, play_after_load: bool) {
        self.pending_tag = Some(tag.clone());
        self.play_after_load = play_after_load;
        let directory = Arc::clone(&self.directory);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = directory
                .stations_by_tag(&tag)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(DaemonEvent::StationsLoaded { tag, result }).await;
        });
    }

    fn request_tags(&self) {
        let directory = Arc::clone(&self.directory);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = directory.tags().await.map_err(|e| e.to_string());
            let _ = tx.send(DaemonEvent::TagsLoaded(result)).await;
        });
    }

    fn load_space_source(&mut self, json: &str) {
        let path: PathBuf = sources::resolve_clip_path(&self.config.sources.space_sources, json);
        let label = self
            .space_sources
            .iter()
            .find(|s| s.json == json)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| json.to_string());

        match sources::load_space_clips(&path) {
            Ok(clips) => {
                info!("Loaded {} clips from {}", clips.len(), label);
                let stations = clips
                    .into_iter()
                    .map(|clip| Station {
                        id: clip.url.clone(),
                        name: clip.name,
                        url: clip.url,
                        ..Station::default()
                    })
                    .collect();
                self.channels.space.set_stations(stations);
            }
            Err(e) => {
                warn!("Space source {} unavailable: {}", label, e);
                self.channels.space.set_stations(Vec::new());
            }
        }
        self.channels.space.set_source_label(Some(label));
    }

    /// Station for an ATC video id; unknown ids are still playable.
    fn atc_station(&self, id: &str) -> Station {
        let source = self
            .atc_sources
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .unwrap_or_else(|| AtcSource {
                id: id.to_string(),
                name: id.to_string(),
                timezone: None,
            });
        Station {
            id: source.id.clone(),
            name: source.name.clone(),
            url: source.stream_url(),
            ..Station::default()
        }
    }

    async fn apply_volume(&mut self, channel: ChannelId) {
        let volume = self.state_manager.effective_volume(channel).await;
        self.channels.get_mut(channel).set_volume(volume).await;
    }

    async fn apply_all_volumes(&mut self) {
        for channel in ChannelId::ALL {
            self.apply_volume(channel).await;
        }
    }

    /// Copy controller snapshots into the shared state and notify clients.
    async fn publish(&mut self) {
        for channel in ChannelId::ALL {
            let snapshot = self.channels.get(channel).snapshot();
            let title = snapshot.title.clone();
            self.state_manager.set_channel(channel, snapshot).await;

            if self.last_titles.get(&channel) != Some(&title) {
                self.last_titles.insert(channel, title.clone());
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::TitleUpdated { channel, title });
            }
        }

        let rev = self.state_manager.rev().await;
        if rev != self.last_published_rev {
            self.last_published_rev = rev;
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    async fn cleanup(&mut self) {
        for channel in ChannelId::ALL {
            self.channels.get_mut(channel).shutdown().await;
        }
    }
}
