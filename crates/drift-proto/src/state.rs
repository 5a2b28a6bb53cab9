use crate::favorites::Favorites;
use crate::protocol::{ChannelId, ChannelState, DaemonState, TagInfo};
use crate::settings::VolumeSettings;
use crate::store::{KvStore, StoreError};
use tokio::sync::RwLock;

/// Shared published state. Every mutation bumps `rev`; volume changes are
/// written through to the store. The directory tag list is kept beside the
/// state rather than in it, so state broadcasts stay small.
pub struct StateManager {
    state: RwLock<DaemonState>,
    tags: RwLock<Vec<TagInfo>>,
    store: KvStore,
}

impl StateManager {
    pub fn new(store: KvStore) -> Self {
        let mut state = DaemonState {
            rev: 1,
            volume: VolumeSettings::load(&store),
            ..DaemonState::default()
        };
        state.favorites.curated = Favorites::new(store.clone(), ChannelId::Curated.as_str()).list();
        state.favorites.roulette = Favorites::new(store.clone(), ChannelId::Roulette.as_str()).list();

        Self {
            state: RwLock::new(state),
            tags: RwLock::new(Vec::new()),
            store,
        }
    }

    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    pub async fn rev(&self) -> u64 {
        self.state.read().await.rev
    }

    pub async fn tags(&self) -> Vec<TagInfo> {
        self.tags.read().await.clone()
    }

    pub async fn set_tags(&self, tags: Vec<TagInfo>) {
        *self.tags.write().await = tags;
    }

    /// Replace a channel snapshot. Returns false (and leaves `rev` alone)
    /// when nothing changed. The mute flag is owned here, not by the caller.
    pub async fn set_channel(&self, channel: ChannelId, mut snapshot: ChannelState) -> bool {
        let mut state = self.state.write().await;
        let current = state.channel_mut(channel);
        snapshot.muted = current.muted;
        if *current == snapshot {
            return false;
        }
        *current = snapshot;
        state.rev += 1;
        true
    }

    pub async fn set_channel_volume(&self, channel: ChannelId, value: u8) -> Result<(), StoreError> {
        let volume = {
            let mut state = self.state.write().await;
            state.volume.set_channel(channel, value);
            state.rev += 1;
            state.volume.clone()
        };
        volume.save(&self.store)
    }

    pub async fn set_master_volume(&self, value: u8) -> Result<(), StoreError> {
        let volume = {
            let mut state = self.state.write().await;
            state.volume.set_master(value);
            state.rev += 1;
            state.volume.clone()
        };
        volume.save(&self.store)
    }

    pub async fn set_muted(&self, channel: ChannelId, muted: bool) {
        let mut state = self.state.write().await;
        state.channel_mut(channel).muted = muted;
        state.rev += 1;
    }

    pub async fn set_master_muted(&self, muted: bool) {
        let mut state = self.state.write().await;
        state.master_muted = muted;
        state.rev += 1;
    }

    /// Effective 0.0–1.0 gain for `channel` under the current sliders.
    pub async fn effective_volume(&self, channel: ChannelId) -> f32 {
        let state = self.state.read().await;
        state
            .volume
            .effective(channel, state.channel(channel).muted, state.master_muted)
    }

    /// Re-read a channel's favorites list from the store.
    pub async fn refresh_favorites(&self, channel: ChannelId) {
        let list = Favorites::new(self.store.clone(), channel.as_str()).list();
        let mut state = self.state.write().await;
        match channel {
            ChannelId::Curated => state.favorites.curated = list,
            ChannelId::Roulette => state.favorites.roulette = list,
            ChannelId::Space | ChannelId::Atc => return,
        }
        state.rev += 1;
    }
}
