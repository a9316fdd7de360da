//! Decoder process IPC driver with separated reader/writer tasks.
//!
//! The streaming/decoding engine runs as an external process and manages its
//! own network I/O; this driver owns the process and speaks its JSON-lines
//! IPC over a unix socket.
//!
//! ```text
//!   DecoderDriver::spawn_and_connect()
//!         │
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── property-change / event    → typed DecoderEvent channel
//! ```
//!
//! Raw property events are translated to [`DecoderEvent`] here so the engine
//! never sees wire JSON.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs, matched in property-change events.
const OBS_CORE_IDLE: u64 = 1;
const OBS_STATION: u64 = 2;
const OBS_TITLE: u64 = 3;
const OBS_ICY_URL: u64 = 4;
const OBS_BITRATE: u64 = 5;
const OBS_CACHE: u64 = 6;

/// Cache duration treated as a full buffer for the fill percentage.
const CACHE_FULL_SECS: f64 = 10.0;

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("decoder writer task gone")]
    Gone,
    #[error("decoder IPC timeout for req={0}")]
    Timeout(u64),
    #[error("decoder error: {0}")]
    Protocol(String),
}

/// Typed events surfaced to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    /// Audio is (or is no longer) flowing.
    Running(bool),
    Station(String),
    StreamTitle(String),
    IcyUrl(String),
    /// Kilobits per second.
    Bitrate(u32),
    /// Buffer fill 0..=100.
    BufferFill(u8),
    /// The stream ended; `error` marks abnormal termination.
    Ended { error: bool },
}

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<Result<Value, DecoderError>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, DecoderError>>>>>;

// ── public handle ─────────────────────────────────────────────────────────────

/// Cheaply cloneable handle to the decoder writer task.
#[derive(Clone)]
pub struct DecoderHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl DecoderHandle {
    pub async fn send(&self, command: Value) -> Result<Value, DecoderError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = msg.to_string();
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DecoderError::Gone)?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| DecoderError::Timeout(req_id))?
            .map_err(|_| DecoderError::Gone)?
    }

    /// Tell the decoder to connect to a stream URL.
    pub async fn connect(&self, url: &str) -> Result<(), DecoderError> {
        self.send(json!(["loadfile", url])).await?;
        Ok(())
    }

    /// Idempotent stop.
    pub async fn stop(&self) -> Result<(), DecoderError> {
        let _ = self.send(json!(["stop"])).await;
        Ok(())
    }

    /// Software gain stage, in decoder steps.
    pub async fn set_gain(&self, steps: u8) -> Result<(), DecoderError> {
        self.send(json!(["set_property", "volume", steps as f64]))
            .await?;
        Ok(())
    }

    /// Left/right balance in `[-10, 10]`, mapped to the decoder's -1..1 scale.
    pub async fn set_balance(&self, balance: i8) -> Result<(), DecoderError> {
        let value = (balance.clamp(-10, 10) as f64) / 10.0;
        self.send(json!(["set_property", "balance", value])).await?;
        Ok(())
    }

    /// Software-gain step count. Queried once at startup and cached by the
    /// caller; the two-region volume split hinges on it.
    pub async fn software_steps(&self) -> Result<u8, DecoderError> {
        let resp = self.send(json!(["get_property", "volume-max"])).await?;
        Ok(resp["data"].as_f64().unwrap_or(100.0).clamp(0.0, 255.0) as u8)
    }

    /// Register observe_property for everything the engine tracks. Must be
    /// called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_STATION, "metadata/by-key/icy-name"),
            (OBS_TITLE, "metadata/by-key/icy-title"),
            (OBS_ICY_URL, "metadata/by-key/icy-url"),
            (OBS_BITRATE, "audio-bitrate"),
            (OBS_CACHE, "demuxer-cache-duration"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("decoder: observe_property id={} name={}", id, name),
                Err(e) => warn!("decoder: observe_property {} failed: {}", name, e),
            }
        }
    }

    /// Health-check: Ok(()) when the IPC channel is responsive.
    pub async fn ping(&self) -> Result<(), DecoderError> {
        self.send(json!(["get_property", "volume"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the decoder child process and manages (re)connection.
pub struct DecoderDriver {
    binary: String,
    socket: String,
    process: Option<tokio::process::Child>,
}

impl DecoderDriver {
    pub fn new(binary: String, socket: String) -> Self {
        Self {
            binary,
            socket,
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

    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<DecoderEvent>,
    ) -> anyhow::Result<DecoderHandle> {
        // Kill stale process
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }

        let socket_path = std::path::PathBuf::from(&self.socket);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("decoder: spawning {}", self.binary);
        let child = tokio::process::Command::new(&self.binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(format!("--input-ipc-server={}", self.socket))
            .arg("--quiet")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        self.process = Some(child);

        // Wait for the socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("decoder IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("decoder: connected to IPC socket");
        Ok(Self::start_io_tasks(stream, event_tx))
    }

    fn start_io_tasks(stream: UnixStream, event_tx: mpsc::Sender<DecoderEvent>) -> DecoderHandle {
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);

        // pending map: req_id → reply channel. Writer inserts, reader resolves.
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        let pending_w = pending.clone();
        tokio::spawn(writer_task(write_half, cmd_rx, pending_w));
        tokio::spawn(reader_task(reader, pending, event_tx));

        DecoderHandle { tx: cmd_tx }
    }
}

// ── event translation ─────────────────────────────────────────────────────────

/// Translate a raw IPC line into a typed event, if it is one we track.
fn translate_event(val: &Value) -> Option<DecoderEvent> {
    match val.get("event")?.as_str()? {
        "property-change" => {
            let id = val.get("id")?.as_u64()?;
            let data = val.get("data").unwrap_or(&Value::Null);
            match id {
                OBS_CORE_IDLE => Some(DecoderEvent::Running(!data.as_bool().unwrap_or(true))),
                OBS_STATION => Some(DecoderEvent::Station(
                    data.as_str().unwrap_or_default().to_string(),
                )),
                OBS_TITLE => Some(DecoderEvent::StreamTitle(
                    data.as_str().unwrap_or_default().to_string(),
                )),
                OBS_ICY_URL => Some(DecoderEvent::IcyUrl(
                    data.as_str().unwrap_or_default().to_string(),
                )),
                OBS_BITRATE => {
                    let bps = data.as_f64().unwrap_or(0.0);
                    Some(DecoderEvent::Bitrate((bps / 1000.0).round() as u32))
                }
                OBS_CACHE => {
                    let secs = data.as_f64().unwrap_or(0.0);
                    let pct = ((secs / CACHE_FULL_SECS) * 100.0).clamp(0.0, 100.0) as u8;
                    Some(DecoderEvent::BufferFill(pct))
                }
                _ => None,
            }
        }
        "end-file" => {
            let error = val.get("reason").and_then(|r| r.as_str()) == Some("error");
            Some(DecoderEvent::Ended { error })
        }
        _ => None,
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<DecoderEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("decoder reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(DecoderError::Protocol("IPC connection closed".into())));
                }
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
                        debug!("decoder reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    // Command response, routed to the pending request.
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            Err(DecoderError::Protocol(err.to_string()))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("decoder reader: response for unknown req={}", req_id);
                    }
                } else if let Some(event) = translate_event(&val) {
                    let _ = event_tx.send(event).await;
                }
            }
            Err(e) => {
                warn!("decoder reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(DecoderError::Protocol(format!("read error: {}", e))));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register the reply channel before writing so the reader can match it.
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("decoder writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(DecoderError::Protocol(format!("write error: {}", e))));
            }
            break;
        }
    }
    debug!("decoder writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_running_from_core_idle() {
        let val = json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": false});
        assert_eq!(translate_event(&val), Some(DecoderEvent::Running(true)));
        let val = json!({"event": "property-change", "id": OBS_CORE_IDLE, "data": true});
        assert_eq!(translate_event(&val), Some(DecoderEvent::Running(false)));
    }

    #[test]
    fn test_translate_bitrate_to_kbps() {
        let val = json!({"event": "property-change", "id": OBS_BITRATE, "data": 128000.0});
        assert_eq!(translate_event(&val), Some(DecoderEvent::Bitrate(128)));
    }

    #[test]
    fn test_translate_buffer_fill_clamps() {
        let val = json!({"event": "property-change", "id": OBS_CACHE, "data": 5.0});
        assert_eq!(translate_event(&val), Some(DecoderEvent::BufferFill(50)));
        let val = json!({"event": "property-change", "id": OBS_CACHE, "data": 60.0});
        assert_eq!(translate_event(&val), Some(DecoderEvent::BufferFill(100)));
    }

    #[test]
    fn test_translate_end_file_error() {
        let val = json!({"event": "end-file", "reason": "error"});
        assert_eq!(translate_event(&val), Some(DecoderEvent::Ended { error: true }));
        let val = json!({"event": "end-file", "reason": "eof"});
        assert_eq!(
            translate_event(&val),
            Some(DecoderEvent::Ended { error: false })
        );
    }

    #[test]
    fn test_unknown_events_ignored() {
        let val = json!({"event": "seek"});
        assert_eq!(translate_event(&val), None);
        let val = json!({"event": "property-change", "id": 99, "data": 1});
        assert_eq!(translate_event(&val), None);
    }
}
