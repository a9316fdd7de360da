//! HTTP control surface.
//!
//! One endpoint, independent optional query parameters, mirroring what the
//! hardware buttons can do: `play=<url-or-empty>` (empty resumes the last
//! station), `stop=1`, `vol=<N|+N|-N>`, `bal=<N>`, `brightness=<N>`,
//! `enc_mode=<id>`. Responses are a small HTML fragment, or the JSON status
//! object with `json=1` (also served at `/status`).
//!
//! The query string is parsed by hand: clients send `vol=+2` with a literal
//! `+`, which form decoding would turn into a space.

use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use wavebox_core::state::StatusSnapshot;

use crate::engine::{ControlRequest, EngineEvent, VolumeChange};

/// Cloneable handle the handlers use to reach the engine.
#[derive(Clone)]
pub struct EngineClient {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineClient {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    async fn control(&self, req: ControlRequest) -> Option<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineEvent::Control { req, reply }).await.ok()?;
        rx.await.ok()
    }

    async fn status(&self) -> Option<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineEvent::Status { reply }).await.ok()?;
        rx.await.ok()
    }
}

pub fn router(client: EngineClient) -> Router {
    Router::new()
        .route("/", get(control_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(client)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    client: EngineClient,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP socket {}: {}", addr, e);
                return;
            }
        };
        info!("HTTP control surface listening at {}", addr);
        if let Err(e) = axum::serve(listener, router(client)).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn control_handler(
    State(client): State<EngineClient>,
    RawQuery(query): RawQuery,
) -> Response {
    let pairs = parse_query(query.as_deref().unwrap_or(""));
    let (req, want_json) = build_request(&pairs);

    match client.control(req).await {
        Some(snapshot) if want_json => Json(snapshot).into_response(),
        Some(snapshot) => Html(render_fragment(&snapshot)).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "engine unavailable").into_response(),
    }
}

async fn status_handler(State(client): State<EngineClient>) -> Response {
    match client.status().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "engine unavailable").into_response(),
    }
}

// ── query parsing ─────────────────────────────────────────────────────────────

/// Split a raw query string into decoded key/value pairs. `+` stays a
/// literal plus; `%XX` escapes are decoded.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn build_request(pairs: &[(String, String)]) -> (ControlRequest, bool) {
    let mut req = ControlRequest::default();
    let mut want_json = false;

    for (key, value) in pairs {
        match key.as_str() {
            "play" => req.play = Some(value.clone()),
            "stop" => req.stop = value == "1" || value.is_empty(),
            "vol" => match parse_vol(value) {
                Some(change) => req.vol = Some(change),
                None => warn!("ignoring malformed vol parameter '{}'", value),
            },
            "bal" => match value.parse::<i8>() {
                Ok(bal) => req.bal = Some(bal),
                Err(_) => warn!("ignoring malformed bal parameter '{}'", value),
            },
            "brightness" => match value.parse::<u8>() {
                Ok(level) => req.brightness = Some(level),
                Err(_) => warn!("ignoring malformed brightness parameter '{}'", value),
            },
            "enc_mode" => match value.parse::<u8>() {
                Ok(id) => req.enc_mode = Some(id),
                Err(_) => warn!("ignoring malformed enc_mode parameter '{}'", value),
            },
            "json" => want_json = value == "1",
            _ => warn!("ignoring unknown control parameter '{}'", key),
        }
    }
    (req, want_json)
}

/// `vol=42` is absolute; `vol=+3` / `vol=-3` are relative.
fn parse_vol(value: &str) -> Option<VolumeChange> {
    if let Some(rest) = value.strip_prefix('+') {
        rest.parse::<i32>().ok().map(VolumeChange::Relative)
    } else if value.starts_with('-') {
        value.parse::<i32>().ok().map(VolumeChange::Relative)
    } else {
        value.parse::<i32>().ok().map(VolumeChange::Absolute)
    }
}

fn render_fragment(snapshot: &StatusSnapshot) -> String {
    let now_playing = if snapshot.playing {
        if snapshot.station.is_empty() {
            snapshot.url.as_str()
        } else {
            snapshot.station.as_str()
        }
    } else {
        "stopped"
    };
    format!(
        "<html><head><meta http-equiv=\"refresh\" content=\"1; url=/\"></head>\
         <body><p>{}</p><p>vol {}/{}</p></body></html>",
        now_playing, snapshot.volume, snapshot.volume_max
    )
}
