use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use drift_proto::favorites::FavoriteEntry;
use drift_proto::protocol::{ChannelId, Command, DaemonState, TagInfo};
use drift_proto::state::StateManager;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Serialize)]
struct ImportQueued {
    received: usize,
}

pub fn router(state_manager: Arc<StateManager>, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    let app_state = HttpState {
        state_manager,
        event_tx,
    };

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/tags", get(get_tags))
        .route("/api/master/volume/:value", post(set_master_volume))
        .route("/api/roulette/tag/:tag", post(select_tag))
        .route("/api/:channel/play", post(play))
        .route("/api/:channel/shuffle", post(shuffle))
        .route("/api/:channel/stop", post(stop))
        .route("/api/:channel/toggle", post(toggle))
        .route("/api/:channel/favorite", post(toggle_favorite))
        .route("/api/:channel/volume/:value", post(set_volume))
        .route("/api/:channel/mute", post(toggle_mute))
        .route("/api/:channel/favorites", get(get_favorites))
        .route("/api/:channel/favorites/import", post(import_favorites))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_manager, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn parse_channel(raw: &str) -> Result<ChannelId, StatusCode> {
    raw.parse().map_err(|_| StatusCode::NOT_FOUND)
}

async fn dispatch(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
        error!("Failed to forward HTTP command");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<DaemonState> {
    Json(state.state_manager.get_state().await)
}

async fn get_tags(State(state): State<HttpState>) -> Json<Vec<TagInfo>> {
    Json(state.state_manager.tags().await)
}

async fn play(State(state): State<HttpState>, Path(channel): Path<String>) -> StatusCode {
    match parse_channel(&channel) {
        Ok(channel) => {
            dispatch(
                &state,
                Command::Play {
                    channel,
                    station_id: None,
                },
            )
            .await
        }
        Err(code) => code,
    }
}

async fn shuffle(State(state): State<HttpState>, Path(channel): Path<String>) -> StatusCode {
    match parse_channel(&channel) {
        Ok(channel) => dispatch(&state, Command::Shuffle { channel }).await,
        Err(code) => code,
    }
}

async fn stop(State(state): State<HttpState>, Path(channel): Path<String>) -> StatusCode {
    match parse_channel(&channel) {
        Ok(channel) => dispatch(&state, Command::Stop { channel }).await,
        Err(code) => code,
    }
}

async fn toggle(State(state): State<HttpState>, Path(channel): Path<String>) -> StatusCode {
    match parse_channel(&channel) {
        Ok(channel) => dispatch(&state, Command::Toggle { channel }).await,
        Err(code) => code,
    }
}

async fn toggle_favorite(State(state): State<HttpState>, Path(channel): Path<String>) -> StatusCode {
    match parse_channel(&channel) {
        Ok(channel) => dispatch(&state, Command::ToggleFavorite { channel }).await,
        Err(code) => code,
    }
}

async fn set_volume(
    State(state): State<HttpState>,
    Path((channel, value)): Path<(String, u8)>,
) -> StatusCode {
    match parse_channel(&channel) {
        Ok(channel) => {
            dispatch(
                &state,
                Command::Volume {
                    channel,
                    value: value.min(100),
                },
            )
            .await
        }
        Err(code) => code,
    }
}

async fn set_master_volume(State(state): State<HttpState>, Path(value): Path<u8>) -> StatusCode {
    dispatch(
        &state,
        Command::MasterVolume {
            value: value.min(100),
        },
    )
    .await
}

/// Flip the channel's mute flag.
async fn toggle_mute(State(state): State<HttpState>, Path(channel): Path<String>) -> StatusCode {
    let channel = match parse_channel(&channel) {
        Ok(channel) => channel,
        Err(code) => return code,
    };
    let muted = !state.state_manager.get_state().await.channel(channel).muted;
    dispatch(&state, Command::Mute { channel, muted }).await
}

async fn select_tag(State(state): State<HttpState>, Path(tag): Path<String>) -> StatusCode {
    dispatch(&state, Command::SelectTag { tag }).await
}

async fn get_favorites(
    State(state): State<HttpState>,
    Path(channel): Path<String>,
) -> Result<Json<Vec<FavoriteEntry>>, StatusCode> {
    let channel = parse_channel(&channel)?;
    let daemon_state = state.state_manager.get_state().await;
    Ok(Json(daemon_state.favorites.get(channel).to_vec()))
}

async fn import_favorites(
    State(state): State<HttpState>,
    Path(channel): Path<String>,
    Json(favorites): Json<Vec<FavoriteEntry>>,
) -> Result<Json<ImportQueued>, StatusCode> {
    let channel = parse_channel(&channel)?;
    let received = favorites.len();
    match dispatch(&state, Command::ImportFavorites { channel, favorites }).await {
        StatusCode::OK => Ok(Json(ImportQueued { received })),
        code => Err(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_proto::store::KvStore;

    fn http_state() -> (HttpState, mpsc::Receiver<DaemonEvent>) {
        let (event_tx, event_rx) = mpsc::channel(4);
        let state = HttpState {
            state_manager: Arc::new(StateManager::new(KvStore::in_memory())),
            event_tx,
        };
        (state, event_rx)
    }

    #[test]
    fn test_parse_channel_rejects_unknown() {
        assert_eq!(parse_channel("space"), Ok(ChannelId::Space));
        assert_eq!(parse_channel("jazz"), Err(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_mute_flips_current_flag() {
        let (state, mut event_rx) = http_state();
        state.state_manager.set_muted(ChannelId::Atc, true).await;

        let code = toggle_mute(State(state.clone()), Path("atc".to_string())).await;
        assert_eq!(code, StatusCode::OK);
        match event_rx.recv().await {
            Some(DaemonEvent::ClientCommand(Command::Mute { channel, muted })) => {
                assert_eq!(channel, ChannelId::Atc);
                assert!(!muted);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_volume_is_clamped() {
        let (state, mut event_rx) = http_state();
        let code = set_volume(State(state), Path(("curated".to_string(), 250))).await;
        assert_eq!(code, StatusCode::OK);
        match event_rx.recv().await {
            Some(DaemonEvent::ClientCommand(Command::Volume { value, .. })) => assert_eq!(value, 100),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_loop_is_server_error() {
        let (state, event_rx) = http_state();
        drop(event_rx);
        let code = stop(State(state), Path("roulette".to_string())).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
