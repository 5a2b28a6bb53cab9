use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::favorites::FavoriteEntry;
use crate::settings::VolumeSettings;

/// Current protocol version. Bump this when the wire format changes in a
/// breaking way. Clients check it on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// One independently controlled audio lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    Curated,
    Roulette,
    Space,
    Atc,
}

impl ChannelId {
    pub const ALL: [ChannelId; 4] = [
        ChannelId::Curated,
        ChannelId::Roulette,
        ChannelId::Space,
        ChannelId::Atc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelId::Curated => "curated",
            ChannelId::Roulette => "roulette",
            ChannelId::Space => "space",
            ChannelId::Atc => "atc",
        }
    }

    /// Channels whose stations go through blacklist + rotation failover.
    pub fn uses_failover(&self) -> bool {
        matches!(self, ChannelId::Curated | ChannelId::Roulette)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelId::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown channel '{}'", s))
    }
}

/// Messages sent from clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Play a specific station (manual mode) or, without an id, the next
    /// eligible one from the rotation (auto-retry mode).
    Play {
        channel: ChannelId,
        #[serde(default)]
        station_id: Option<String>,
    },
    /// Skip to the next eligible station / a random clip.
    Shuffle { channel: ChannelId },
    Stop { channel: ChannelId },
    /// Pause when playing, otherwise resume (or start).
    Toggle { channel: ChannelId },
    SelectTag { tag: String },
    /// Space clip source file or ATC video id; `None` disables ATC.
    SelectSource {
        channel: ChannelId,
        source: Option<String>,
    },
    Volume { channel: ChannelId, value: u8 },
    MasterVolume { value: u8 },
    Mute { channel: ChannelId, muted: bool },
    MuteMaster { muted: bool },
    ToggleFavorite { channel: ChannelId },
    RemoveFavorite { channel: ChannelId, station_id: String },
    ImportFavorites {
        channel: ChannelId,
        favorites: Vec<FavoriteEntry>,
    },
    SetCollapsed { section: String, collapsed: bool },
    /// Re-fetch the roulette station list for the current tag.
    Refresh,
    GetState,
}

/// Messages sent from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    Title {
        channel: ChannelId,
        title: Option<String>,
    },
    Log {
        message: String,
    },
}

/// Playback state of one channel's session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Connecting,
    Buffering,
    Playing,
    Paused,
    Unavailable,
}

impl PlaybackStatus {
    /// Short label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            PlaybackStatus::Idle => "Ready",
            PlaybackStatus::Connecting => "Connecting...",
            PlaybackStatus::Buffering => "Buffering...",
            PlaybackStatus::Playing => "Playing",
            PlaybackStatus::Paused => "Paused",
            PlaybackStatus::Unavailable => "Unavailable",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PlaybackStatus::Connecting | PlaybackStatus::Buffering | PlaybackStatus::Playing
        )
    }
}

/// Snapshot of one channel, published after every change.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChannelState {
    pub status: PlaybackStatus,
    /// Human-readable status line, e.g. "No working stations".
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub station: Option<Station>,
    /// Stream title reported by the stream (ICY or container metadata).
    #[serde(default)]
    pub title: Option<String>,
    /// Stations currently not blacklisted.
    #[serde(default)]
    pub available: usize,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub is_favorite: bool,
    /// Selected tag / source for channels that have one.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub muted: bool,
}

/// Full state of the daemon. `rev` increases on every change so clients can
/// detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    #[serde(default)]
    pub rev: u64,
    pub curated: ChannelState,
    pub roulette: ChannelState,
    pub space: ChannelState,
    pub atc: ChannelState,
    pub volume: VolumeSettings,
    #[serde(default)]
    pub master_muted: bool,
    #[serde(default)]
    pub favorites: ChannelFavorites,
}

impl DaemonState {
    pub fn channel(&self, channel: ChannelId) -> &ChannelState {
        match channel {
            ChannelId::Curated => &self.curated,
            ChannelId::Roulette => &self.roulette,
            ChannelId::Space => &self.space,
            ChannelId::Atc => &self.atc,
        }
    }

    pub fn channel_mut(&mut self, channel: ChannelId) -> &mut ChannelState {
        match channel {
            ChannelId::Curated => &mut self.curated,
            ChannelId::Roulette => &mut self.roulette,
            ChannelId::Space => &mut self.space,
            ChannelId::Atc => &mut self.atc,
        }
    }
}

/// Favorites of the two station channels.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelFavorites {
    pub curated: Vec<FavoriteEntry>,
    pub roulette: Vec<FavoriteEntry>,
}

impl ChannelFavorites {
    pub fn get(&self, channel: ChannelId) -> &[FavoriteEntry] {
        match channel {
            ChannelId::Curated => &self.curated,
            ChannelId::Roulette => &self.roulette,
            ChannelId::Space | ChannelId::Atc => &[],
        }
    }
}

/// A directory station. Field names on the wire follow the radio-browser
/// API so directory responses and curated files deserialize directly.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Station {
    #[serde(rename = "stationuuid")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "url_resolved", default)]
    pub url: String,
    /// Comma-separated free text.
    #[serde(default)]
    pub tags: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub favicon: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub homepage: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub codec: Option<String>,
    #[serde(default, deserialize_with = "zero_as_none")]
    pub bitrate: Option<u32>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub countrycode: Option<String>,
}

impl Station {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            "Unknown Station"
        } else {
            &self.name
        }
    }

    pub fn tag_list(&self) -> impl Iterator<Item = &str> {
        self.tags.split(',').map(str::trim).filter(|t| !t.is_empty())
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

fn zero_as_none<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<u32> = Option::deserialize(deserializer)?;
    Ok(value.filter(|b| *b > 0))
}

/// A directory tag with its station count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagInfo {
    pub name: String,
    #[serde(default)]
    pub stationcount: u32,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::Command(Command::Play {
            channel: ChannelId::Roulette,
            station_id: None,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Play { channel, station_id }) => {
                assert_eq!(channel, ChannelId::Roulette);
                assert!(station_id.is_none());
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let encoded = Message::Command(Command::GetState).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_hello_carries_state() {
        let mut state = DaemonState {
            rev: 42,
            ..Default::default()
        };
        state.roulette.status = PlaybackStatus::Buffering;
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
                assert_eq!(state.roulette.status, PlaybackStatus::Buffering);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_station_from_directory_json() {
        let json = r#"{
            "stationuuid": "96062a7b-0601-11e8-ae97-52543be04c81",
            "name": "SomaFM Drone Zone",
            "url": "http://ice1.somafm.com/dronezone-128-mp3",
            "url_resolved": "http://ice2.somafm.com/dronezone-128-mp3",
            "tags": "ambient,drone, space",
            "favicon": "",
            "homepage": "https://somafm.com/",
            "codec": "MP3",
            "bitrate": 128,
            "countrycode": "US"
        }"#;
        let station: Station = serde_json::from_str(json).unwrap();
        assert_eq!(station.id, "96062a7b-0601-11e8-ae97-52543be04c81");
        assert_eq!(station.url, "http://ice2.somafm.com/dronezone-128-mp3");
        assert!(station.favicon.is_none());
        assert_eq!(station.bitrate, Some(128));
        assert_eq!(
            station.tag_list().collect::<Vec<_>>(),
            vec!["ambient", "drone", "space"]
        );
    }

    #[test]
    fn test_channel_id_parse() {
        assert_eq!("ATC".parse::<ChannelId>().unwrap(), ChannelId::Atc);
        assert!("jazz".parse::<ChannelId>().is_err());
        assert!(ChannelId::Roulette.uses_failover());
        assert!(!ChannelId::Space.uses_failover());
    }
}
