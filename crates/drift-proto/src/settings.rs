use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::ChannelId;
use crate::store::{keys, KvStore, StoreError};

/// Slider positions, 0–100. Mute flags are not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSettings {
    #[serde(default = "default_master")]
    pub master: u8,
    #[serde(default = "default_channel")]
    pub curated: u8,
    #[serde(default = "default_channel")]
    pub roulette: u8,
    #[serde(default = "default_channel")]
    pub space: u8,
    #[serde(default = "default_channel")]
    pub atc: u8,
}

fn default_master() -> u8 {
    100
}

fn default_channel() -> u8 {
    50
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            master: default_master(),
            curated: default_channel(),
            roulette: default_channel(),
            space: default_channel(),
            atc: default_channel(),
        }
    }
}

impl VolumeSettings {
    pub fn load(store: &KvStore) -> Self {
        store.get_or_default(keys::VOLUME)
    }

    pub fn save(&self, store: &KvStore) -> Result<(), StoreError> {
        store.set_json(keys::VOLUME, self)
    }

    pub fn channel(&self, channel: ChannelId) -> u8 {
        match channel {
            ChannelId::Curated => self.curated,
            ChannelId::Roulette => self.roulette,
            ChannelId::Space => self.space,
            ChannelId::Atc => self.atc,
        }
    }

    pub fn set_channel(&mut self, channel: ChannelId, value: u8) {
        let value = value.min(100);
        match channel {
            ChannelId::Curated => self.curated = value,
            ChannelId::Roulette => self.roulette = value,
            ChannelId::Space => self.space = value,
            ChannelId::Atc => self.atc = value,
        }
    }

    pub fn set_master(&mut self, value: u8) {
        self.master = value.min(100);
    }

    /// Effective 0.0–1.0 gain: channel slider times master slider, zero when
    /// either is muted.
    pub fn effective(&self, channel: ChannelId, channel_muted: bool, master_muted: bool) -> f32 {
        if channel_muted || master_muted {
            return 0.0;
        }
        (self.channel(channel) as f32 / 100.0) * (self.master as f32 / 100.0)
    }
}

/// Collapsed state of the front-end's channel sections.
pub fn load_collapsed(store: &KvStore) -> BTreeMap<String, bool> {
    store.get_or_default(keys::COLLAPSED)
}

pub fn set_collapsed(store: &KvStore, section: &str, collapsed: bool) -> Result<(), StoreError> {
    let mut state = load_collapsed(store);
    state.insert(section.to_string(), collapsed);
    store.set_json(keys::COLLAPSED, &state)
}
