use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use drift_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use drift_proto::state::StateManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let sm = state_manager.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, sm, id, evt_tx, bcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

/// Largest frame body a client may announce.
const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug)]
struct FrameTooLarge(usize);

/// Length-prefixed frames accumulated from a client; yields whole messages.
#[derive(Default)]
struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete command. Non-command and undecodable frames are dropped.
    /// A header announcing more than `MAX_FRAME_LEN` bytes is an error; the
    /// stream cannot be resynchronised after it.
    fn next_command(&mut self) -> Result<Option<Command>, FrameTooLarge> {
        while self.buf.len() >= 4 {
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(FrameTooLarge(len));
            }
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            let decoded = Message::decode(&self.buf);
            self.buf.drain(..4 + len);
            match decoded {
                Ok((Message::Command(cmd), _)) => return Ok(Some(cmd)),
                Ok(_) => debug!("ignoring non-command frame from client"),
                Err(e) => warn!("undecodable client frame: {}", e),
            }
        }
        Ok(None)
    }
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut frames = FrameBuffer::default();

    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        let outgoing = tokio::select! {
            result = read_half.read(&mut tmp) => {
                let n = match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                };
                frames.push(&tmp[..n]);
                loop {
                    match frames.next_command() {
                        Ok(Some(cmd)) => {
                            debug!("Client {} sent {:?}", client_id, cmd);
                            if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                warn!("DaemonEvent channel closed");
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(FrameTooLarge(len)) => {
                            warn!("Client {} announced a {} byte frame, dropping it", client_id, len);
                            return;
                        }
                    }
                }
                continue;
            }

            msg = broadcast_rx.recv() => match msg {
                Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                Ok(BroadcastMessage::TitleUpdated { channel, title }) => {
                    Message::Broadcast(Broadcast::Title { channel, title }).encode()
                }
                Ok(BroadcastMessage::Log(message)) => {
                    Message::Broadcast(Broadcast::Log { message }).encode()
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // skipped messages may include state changes
                    warn!("Client {} lagged {} broadcasts, resyncing", client_id, n);
                    encode_state(&state_manager).await
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match outgoing {
            Ok(encoded) => {
                if write_half.write_all(&encoded).await.is_err() {
                    break;
                }
            }
            Err(e) => error!("Failed to encode broadcast: {}", e),
        }
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: state.rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
