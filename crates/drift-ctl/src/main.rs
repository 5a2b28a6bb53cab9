//! drift-ctl: send one command to a running drift daemon and print the result.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use drift_proto::favorites;
use drift_proto::platform;
use drift_proto::protocol::{Broadcast, ChannelId, ChannelState, Command, DaemonState, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "drift-ctl", about = "Control a running Radio Drift daemon", version)]
struct Cli {
    /// Daemon address, defaults to the local TCP port
    #[arg(long)]
    address: Option<String>,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Play a station by id, or the next one from the rotation
    Play {
        channel: ChannelId,
        station_id: Option<String>,
    },
    /// Skip to another station or clip
    Shuffle { channel: ChannelId },
    Stop { channel: ChannelId },
    /// Pause or resume
    Toggle { channel: ChannelId },
    /// Load roulette stations for a genre tag
    Tag { tag: String },
    /// Select a space clip list or ATC feed; omit to disable ATC
    Source {
        channel: ChannelId,
        source: Option<String>,
    },
    Volume { channel: ChannelId, value: u8 },
    Master { value: u8 },
    Mute {
        channel: ChannelId,
        #[arg(long)]
        off: bool,
    },
    /// Favorite or unfavorite the current station
    Favorite { channel: ChannelId },
    /// Re-fetch the roulette station list
    Refresh,
    /// Print the full daemon state as JSON
    State,
    ExportFavorites {
        channel: ChannelId,
        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    ImportFavorites { channel: ChannelId, file: PathBuf },
}

struct DaemonConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

impl DaemonConnection {
    async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("daemon not reachable at {}", address))?;
        Ok(Self {
            stream,
            read_buffer: Vec::with_capacity(4096),
        })
    }

    async fn send_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        let encoded = Message::Command(cmd).encode()?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    async fn receive_message(&mut self) -> anyhow::Result<Message> {
        let mut buf = [0u8; 4096];
        loop {
            if let Ok((msg, consumed)) = Message::decode(&self.read_buffer) {
                self.read_buffer.drain(..consumed);
                return Ok(msg);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                bail!("daemon closed the connection");
            }
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }

    /// Wait for the next full state snapshot, skipping titles and log lines.
    async fn next_state(&mut self) -> anyhow::Result<DaemonState> {
        loop {
            match self.receive_message().await? {
                Message::Broadcast(Broadcast::Hello { state, .. }) => return Ok(state),
                Message::Broadcast(Broadcast::State { data }) => return Ok(data),
                _ => {}
            }
        }
    }
}

fn command_for(action: &Action, state: &DaemonState) -> anyhow::Result<Option<Command>> {
    let cmd = match action {
        Action::Play {
            channel,
            station_id,
        } => Command::Play {
            channel: *channel,
            station_id: station_id.clone(),
        },
        Action::Shuffle { channel } => Command::Shuffle { channel: *channel },
        Action::Stop { channel } => Command::Stop { channel: *channel },
        Action::Toggle { channel } => Command::Toggle { channel: *channel },
        Action::Tag { tag } => Command::SelectTag { tag: tag.clone() },
        Action::Source { channel, source } => Command::SelectSource {
            channel: *channel,
            source: source.clone(),
        },
        Action::Volume { channel, value } => Command::Volume {
            channel: *channel,
            value: (*value).min(100),
        },
        Action::Master { value } => Command::MasterVolume {
            value: (*value).min(100),
        },
        Action::Mute { channel, off } => Command::Mute {
            channel: *channel,
            muted: !off,
        },
        Action::Favorite { channel } => Command::ToggleFavorite { channel: *channel },
        Action::Refresh => Command::Refresh,
        Action::ImportFavorites { channel, file } => {
            if !channel.uses_failover() {
                bail!("{} has no favorites", channel);
            }
            let favorites = favorites::read_import_file(file)?;
            println!("Importing {} favorites into {}", favorites.len(), channel);
            Command::ImportFavorites {
                channel: *channel,
                favorites,
            }
        }
        Action::State => return Ok(None),
        Action::ExportFavorites { channel, output } => {
            let json = favorites::export_json(state.favorites.get(*channel))?;
            match output {
                Some(path) => {
                    std::fs::write(path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Exported favorites to {}", path.display());
                }
                None => println!("{}", json),
            }
            return Ok(None);
        }
    };
    Ok(Some(cmd))
}

fn target_channel(action: &Action) -> Option<ChannelId> {
    match action {
        Action::Play { channel, .. }
        | Action::Shuffle { channel }
        | Action::Stop { channel }
        | Action::Toggle { channel }
        | Action::Source { channel, .. }
        | Action::Volume { channel, .. }
        | Action::Mute { channel, .. }
        | Action::Favorite { channel }
        | Action::ImportFavorites { channel, .. } => Some(*channel),
        Action::Tag { .. } | Action::Refresh => Some(ChannelId::Roulette),
        _ => None,
    }
}

fn print_channel(channel: ChannelId, state: &ChannelState) {
    let station = state
        .station
        .as_ref()
        .map(|s| s.display_name().to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{:<9} {}", channel.as_str(), state.status.label());
    println!("  station : {}", station);
    if let Some(title) = &state.title {
        println!("  title   : {}", title);
    }
    if !state.message.is_empty() {
        println!("  message : {}", state.message);
    }
    if let Some(source) = &state.source {
        println!("  source  : {}", source);
    }
    if channel.uses_failover() {
        println!("  stations: {}/{} available", state.available, state.total);
    }
    if state.is_favorite {
        println!("  favorite");
    }
    if state.muted {
        println!("  muted");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let address = cli.address.clone().unwrap_or_else(platform::daemon_address);

    let mut conn = DaemonConnection::connect(&address).await?;
    let hello = conn.next_state().await?;

    let Some(cmd) = command_for(&cli.command, &hello)? else {
        if matches!(cli.command, Action::State) {
            println!("{}", serde_json::to_string_pretty(&hello)?);
        }
        return Ok(());
    };

    conn.send_command(cmd).await?;
    conn.send_command(Command::GetState).await?;

    let state = tokio::time::timeout(REPLY_TIMEOUT, conn.next_state())
        .await
        .context("timed out waiting for daemon state")??;

    match target_channel(&cli.command) {
        Some(channel) => print_channel(channel, state.channel(channel)),
        None => println!(
            "master volume {}{}",
            state.volume.master,
            if state.master_muted { " (muted)" } else { "" }
        ),
    }
    Ok(())
}
