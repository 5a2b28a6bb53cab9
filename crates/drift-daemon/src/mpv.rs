/// mpv IPC driver, one process per channel.
///
/// ```text
///   MpvBackend::load()
///         │
///         ├── MpvDriver::spawn_and_connect()
///         │       ├── writer_task  ← MpvRequest via mpsc → socket
///         │       └── reader_task  ← JSON lines
///         │                             ├── response (request_id) → oneshot
///         │                             └── event / property-change → raw mpsc
///         └── translate_task ← raw mpsc, stamps the session of the file
///                                 mpv is actually playing → DaemonEvent::Media
/// ```
///
/// Unix uses domain sockets, Windows named pipes `\\.\pipe\<name>`.
use async_trait::async_trait;
use drift_proto::config::MpvConfig;
use drift_proto::platform;
use drift_proto::protocol::ChannelId;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::DaemonEvent;
use crate::playback::{MediaBackend, MediaEvent, MediaEventKind};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_ICY_TITLE: u64 = 3;
pub const OBS_PAUSED_FOR_CACHE: u64 = 4;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Unsolicited mpv message (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn loadfile(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, vol: f32) -> anyhow::Result<()> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Must run after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_ICY_TITLE, "metadata/by-key/icy-title"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

/// Owns one mpv child process.
pub struct MpvDriver {
    channel: ChannelId,
    socket_name: String,
    extra_args: Vec<String>,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new(channel: ChannelId, config: &MpvConfig) -> Self {
        Self {
            channel,
            socket_name: platform::mpv_socket_name(channel.as_str()),
            extra_args: config.extra_args.clone(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn args(&self, volume: f32) -> Vec<String> {
        let mut args = vec![
            "--no-video".to_string(),
            "--idle=yes".to_string(),
            platform::mpv_socket_arg(self.channel.as_str()),
            "--quiet".to_string(),
            format!("--volume={}", (volume * 100.0).clamp(0.0, 100.0).round() as i64),
        ];
        if self.channel == ChannelId::Atc {
            args.push("--ytdl=yes".to_string());
            args.push("--ytdl-format=bestaudio/best".to_string());
            if let Some(yt_dlp) = platform::find_yt_dlp_binary() {
                args.push(format!(
                    "--script-opts=ytdl_hook-ytdl_path={}",
                    yt_dlp.display()
                ));
            }
        } else {
            args.push("--ytdl=no".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    async fn spawn_process(&mut self, volume: f32) -> anyhow::Result<()> {
        self.kill().await;

        info!("mpv[{}]: spawning new process", self.channel);
        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let child = tokio::process::Command::new(mpv_binary)
            .args(self.args(volume))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        volume: f32,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process(volume).await?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv[{}]: connected to IPC socket", self.channel);
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        volume: f32,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process(volume).await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv[{}]: connected to named pipe", self.channel);
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

/// Property values seen for the current file.
#[derive(Debug, Default)]
pub struct Observed {
    pause: bool,
    core_idle: Option<bool>,
}

/// Map one raw mpv message onto a media event, if it is one.
pub fn translate(observed: &mut Observed, evt: &MpvEvent) -> Option<MediaEventKind> {
    if let Some((id, data)) = evt.as_property_change() {
        return match id {
            OBS_PAUSE => {
                observed.pause = data.as_bool().unwrap_or(false);
                None
            }
            OBS_CORE_IDLE => {
                observed.core_idle = data.as_bool();
                (observed.core_idle == Some(false) && !observed.pause).then_some(MediaEventKind::Playing)
            }
            OBS_PAUSED_FOR_CACHE => (data.as_bool() == Some(true)).then_some(MediaEventKind::Waiting),
            OBS_ICY_TITLE => Some(MediaEventKind::Title(
                data.as_str()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            )),
            _ => None,
        };
    }

    if evt.event_name()? != "end-file" {
        return None;
    }
    match evt.raw.get("reason").and_then(Value::as_str) {
        Some("eof") => Some(MediaEventKind::Ended),
        Some("error") => {
            let detail = evt
                .raw
                .get("file_error")
                .and_then(Value::as_str)
                .unwrap_or("playback error");
            Some(MediaEventKind::Error(detail.to_string()))
        }
        // stop / quit / redirect belong to a replaced or expanded file
        _ => None,
    }
}

#[derive(Debug, Default)]
struct GateState {
    /// Session of the file mpv last started.
    active: u64,
    /// Sessions whose `loadfile` was sent but whose `start-file` has not
    /// been seen yet, oldest first.
    queued: VecDeque<u64>,
}

/// Session bookkeeping shared by `MpvBackend::load` and the translator.
///
/// A session only becomes active when mpv emits `start-file` for it, so
/// anything the previous file still reports is stamped with the previous
/// session and dropped by the controller.
#[derive(Debug, Default)]
pub struct SessionGate {
    state: std::sync::Mutex<GateState>,
}

impl SessionGate {
    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a load before its `loadfile` is sent.
    pub fn expect_start(&self, session: u64) {
        self.lock().queued.push_back(session);
    }

    /// The `loadfile` for `session` was refused; no `start-file` will come.
    pub fn cancel(&self, session: u64) {
        self.lock().queued.retain(|s| *s != session);
    }

    /// mpv started the next queued file.
    fn file_started(&self) -> Option<u64> {
        let mut state = self.lock();
        let next = state.queued.pop_front()?;
        state.active = next;
        Some(next)
    }

    pub fn active(&self) -> u64 {
        self.lock().active
    }
}

/// Turns raw mpv messages into session-stamped media events.
pub struct Translator {
    observed: Observed,
    gate: Arc<SessionGate>,
}

impl Translator {
    pub fn new(gate: Arc<SessionGate>) -> Self {
        Self {
            observed: Observed::default(),
            gate,
        }
    }

    pub fn process(&mut self, evt: &MpvEvent) -> Option<(u64, MediaEventKind)> {
        if evt.event_name() == Some("start-file") {
            if let Some(session) = self.gate.file_started() {
                debug!("mpv: start-file for session {}", session);
                // pause is a player property and survives the file change
                self.observed = Observed {
                    pause: self.observed.pause,
                    core_idle: None,
                };
            }
            return None;
        }
        let kind = translate(&mut self.observed, evt)?;
        Some((self.gate.active(), kind))
    }
}

async fn translate_task(
    channel: ChannelId,
    gate: Arc<SessionGate>,
    mut raw_rx: mpsc::Receiver<MpvEvent>,
    core_tx: mpsc::Sender<DaemonEvent>,
) {
    let mut translator = Translator::new(gate.clone());
    while let Some(evt) = raw_rx.recv().await {
        if let Some((session, kind)) = translator.process(&evt) {
            let event = MediaEvent {
                channel,
                session,
                kind,
            };
            if core_tx.send(DaemonEvent::Media(event)).await.is_err() {
                return;
            }
        }
    }

    warn!("mpv[{}]: IPC connection lost", channel);
    let event = MediaEvent {
        channel,
        session: gate.active(),
        kind: MediaEventKind::Error("mpv connection lost".to_string()),
    };
    let _ = core_tx.send(DaemonEvent::Media(event)).await;
}

/// `MediaBackend` over a lazily spawned mpv process.
pub struct MpvBackend {
    channel: ChannelId,
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    gate: Arc<SessionGate>,
    translator: Option<JoinHandle<()>>,
    core_tx: mpsc::Sender<DaemonEvent>,
}

impl MpvBackend {
    pub fn new(channel: ChannelId, config: &MpvConfig, core_tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            channel,
            driver: MpvDriver::new(channel, config),
            handle: None,
            gate: Arc::new(SessionGate::default()),
            translator: None,
            core_tx,
        }
    }

    fn live_handle(&mut self) -> Option<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv[{}]: process died, dropping handle", self.channel);
            self.handle = None;
        }
        self.handle.clone()
    }

    async fn ensure_handle(&mut self, volume: f32) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        // the old translator would report the dead connection against the
        // session we are about to start
        if let Some(old) = self.translator.take() {
            old.abort();
        }

        let (raw_tx, raw_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = self.driver.spawn_and_connect(volume, raw_tx).await?;
        self.gate = Arc::new(SessionGate::default());
        self.translator = Some(tokio::spawn(translate_task(
            self.channel,
            self.gate.clone(),
            raw_rx,
            self.core_tx.clone(),
        )));
        handle.observe_all_properties().await;
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl MediaBackend for MpvBackend {
    async fn load(&mut self, url: &str, session: u64, volume: f32) -> anyhow::Result<()> {
        let handle = self.ensure_handle(volume).await?;
        self.gate.expect_start(session);
        if let Err(e) = handle.loadfile(url).await {
            self.gate.cancel(session);
            return Err(e);
        }
        let _ = handle.set_volume(volume).await;
        handle.set_pause(false).await
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        match self.live_handle() {
            Some(handle) => handle.set_pause(true).await,
            None => Ok(()),
        }
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        let handle = self
            .live_handle()
            .ok_or_else(|| anyhow::anyhow!("no mpv process bound"))?;
        handle.set_pause(false).await
    }

    async fn unload(&mut self) -> anyhow::Result<()> {
        match self.live_handle() {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()> {
        match self.live_handle() {
            Some(handle) => handle.set_volume(volume).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(translator) = self.translator.take() {
            translator.abort();
        }
        self.handle = None;
        self.driver.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evt(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    fn prop(id: u64, data: Value) -> MpvEvent {
        evt(json!({ "event": "property-change", "id": id, "data": data }))
    }

    #[test]
    fn test_core_idle_false_unpaused_is_playing() {
        let mut observed = Observed::default();
        assert_eq!(translate(&mut observed, &prop(OBS_CORE_IDLE, json!(true))), None);
        assert_eq!(
            translate(&mut observed, &prop(OBS_CORE_IDLE, json!(false))),
            Some(MediaEventKind::Playing)
        );

        translate(&mut observed, &prop(OBS_PAUSE, json!(true)));
        assert_eq!(translate(&mut observed, &prop(OBS_CORE_IDLE, json!(false))), None);
    }

    #[test]
    fn test_cache_stall_is_waiting() {
        let mut observed = Observed::default();
        assert_eq!(
            translate(&mut observed, &prop(OBS_PAUSED_FOR_CACHE, json!(true))),
            Some(MediaEventKind::Waiting)
        );
        assert_eq!(translate(&mut observed, &prop(OBS_PAUSED_FOR_CACHE, json!(false))), None);
    }

    #[test]
    fn test_end_file_reasons() {
        let mut observed = Observed::default();
        let error = evt(json!({
            "event": "end-file",
            "reason": "error",
            "file_error": "loading failed"
        }));
        assert_eq!(
            translate(&mut observed, &error),
            Some(MediaEventKind::Error("loading failed".to_string()))
        );
        let eof = evt(json!({ "event": "end-file", "reason": "eof" }));
        assert_eq!(translate(&mut observed, &eof), Some(MediaEventKind::Ended));
        let stop = evt(json!({ "event": "end-file", "reason": "stop" }));
        assert_eq!(translate(&mut observed, &stop), None);
        let redirect = evt(json!({ "event": "end-file", "reason": "redirect" }));
        assert_eq!(translate(&mut observed, &redirect), None);
    }

    #[test]
    fn test_icy_title() {
        let mut observed = Observed::default();
        assert_eq!(
            translate(&mut observed, &prop(OBS_ICY_TITLE, json!(" Eno - An Ending "))),
            Some(MediaEventKind::Title(Some("Eno - An Ending".to_string())))
        );
        assert_eq!(
            translate(&mut observed, &prop(OBS_ICY_TITLE, Value::Null)),
            Some(MediaEventKind::Title(None))
        );
    }

    fn start_file() -> MpvEvent {
        evt(json!({ "event": "start-file", "playlist_entry_id": 2 }))
    }

    #[test]
    fn test_previous_file_events_keep_their_session() {
        let gate = Arc::new(SessionGate::default());
        let mut translator = Translator::new(gate.clone());
        gate.expect_start(1);
        assert_eq!(translator.process(&start_file()), None);
        assert_eq!(
            translator.process(&prop(OBS_CORE_IDLE, json!(false))),
            Some((1, MediaEventKind::Playing))
        );

        // second load issued; the old stream is still draining
        gate.expect_start(2);
        let old_error = evt(json!({
            "event": "end-file",
            "reason": "error",
            "file_error": "A died"
        }));
        assert_eq!(
            translator.process(&old_error),
            Some((1, MediaEventKind::Error("A died".to_string())))
        );
        assert_eq!(
            translator.process(&prop(OBS_CORE_IDLE, json!(false))),
            Some((1, MediaEventKind::Playing))
        );

        translator.process(&start_file());
        assert_eq!(gate.active(), 2);
        // fresh file: core-idle must go false again before it counts
        assert_eq!(translator.process(&prop(OBS_CORE_IDLE, json!(true))), None);
        assert_eq!(
            translator.process(&prop(OBS_CORE_IDLE, json!(false))),
            Some((2, MediaEventKind::Playing))
        );
    }

    #[test]
    fn test_refused_load_is_not_waited_for() {
        let gate = Arc::new(SessionGate::default());
        let mut translator = Translator::new(gate.clone());
        gate.expect_start(3);
        gate.cancel(3);
        gate.expect_start(4);
        translator.process(&start_file());
        assert_eq!(gate.active(), 4);
    }

    #[test]
    fn test_start_file_without_load_keeps_session() {
        let gate = Arc::new(SessionGate::default());
        let mut translator = Translator::new(gate.clone());
        gate.expect_start(5);
        translator.process(&start_file());
        translator.process(&start_file());
        assert_eq!(gate.active(), 5);
    }

    #[test]
    fn test_atc_args_enable_ytdl() {
        let config = MpvConfig {
            extra_args: vec!["--audio-device=auto".to_string()],
            ..MpvConfig::default()
        };
        let atc = MpvDriver::new(ChannelId::Atc, &config).args(0.5);
        assert!(atc.contains(&"--ytdl=yes".to_string()));
        assert!(atc.contains(&"--volume=50".to_string()));
        assert_eq!(atc.last().map(String::as_str), Some("--audio-device=auto"));

        let radio = MpvDriver::new(ChannelId::Roulette, &config).args(1.0);
        assert!(radio.contains(&"--ytdl=no".to_string()));
        assert!(radio.iter().any(|a| a.contains("roulette")));
    }
}
