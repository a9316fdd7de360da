//! The single owned device state.
//!
//! Every component's record lives here and is touched only from the engine
//! task; the HTTP surface and the encoder reader hold no state of their own,
//! they only request mutations. `rev` is a monotonic counter bumped on every
//! change so clients can detect missed updates.

use serde::Serialize;
use std::time::Instant;

use crate::connectivity::ConnectivityState;
use crate::tagged::Tagged;
use crate::volume::VolumeState;

/// What the user wants playing, as opposed to what the decoder reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackIntent {
    /// Empty with `should_play == false` means "stopped".
    pub url: String,
    pub should_play: bool,
}

impl PlaybackIntent {
    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn play(url: String) -> Self {
        Self {
            url,
            should_play: true,
        }
    }
}

/// Playback lifecycle as reconciled against the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    #[default]
    Idle,
    Connecting,
    Playing,
    /// Connectivity just came back; a catch-up reconnect is pending.
    Recovering,
}

/// Read-only snapshot of what the decoder reports. Each metadata field is
/// updated independently by asynchronous decoder events and carries a
/// generation tag consumed by the renderer.
#[derive(Debug, Clone, Default)]
pub struct PlaybackObserved {
    pub running: bool,
    pub station: Tagged<String>,
    pub stream_title: Tagged<String>,
    pub bitrate: Tagged<u32>,
    pub icy_url: Tagged<String>,
    pub last_host: Tagged<String>,
    pub buffer_fill_pct: u8,
}

impl PlaybackObserved {
    /// Clear every cached metadata field in one step. Called atomically with
    /// an intent change so stale metadata is never shown for a new station.
    pub fn clear_metadata(&mut self) {
        self.station.clear();
        self.stream_title.clear();
        self.bitrate.clear();
        self.icy_url.clear();
        self.last_host.clear();
    }
}

/// What the rotary encoder adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderMode {
    #[default]
    Volume,
    Brightness,
    Disabled,
}

impl EncoderMode {
    /// Persisted id. Unknown ids are rejected by the caller with a warning,
    /// never an error.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(EncoderMode::Volume),
            1 => Some(EncoderMode::Brightness),
            2 => Some(EncoderMode::Disabled),
            _ => None,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            EncoderMode::Volume => 0,
            EncoderMode::Brightness => 1,
            EncoderMode::Disabled => 2,
        }
    }
}

/// Firmware update progress, shown on the display while present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateProgress {
    pub percent: u8,
}

#[derive(Debug)]
pub struct DeviceState {
    /// Monotonic revision counter, bumped on every change.
    pub rev: u64,
    pub volume: VolumeState,
    pub intent: PlaybackIntent,
    pub phase: PlaybackPhase,
    pub observed: PlaybackObserved,
    pub connectivity: ConnectivityState,
    pub enc_mode: EncoderMode,
    pub brightness: u8,
    /// Last signal strength reported by the link watcher.
    pub rssi_dbm: Option<i32>,
    /// Present while a firmware update is in flight.
    pub update: Option<UpdateProgress>,
    started_at: Instant,
}

impl DeviceState {
    pub fn new(volume: VolumeState, now: Instant) -> Self {
        Self {
            rev: 1,
            volume,
            intent: PlaybackIntent::stopped(),
            phase: PlaybackPhase::Idle,
            observed: PlaybackObserved::default(),
            connectivity: ConnectivityState::default(),
            enc_mode: EncoderMode::default(),
            brightness: 200,
            rssi_dbm: None,
            update: None,
            started_at: now,
        }
    }

    pub fn bump(&mut self) {
        self.rev += 1;
    }

    pub fn uptime_secs(&self, now: Instant) -> u64 {
        now.duration_since(self.started_at).as_secs()
    }

    /// Serializable status for the control surface.
    pub fn snapshot(&self, now: Instant, free_mem_bytes: u64) -> StatusSnapshot {
        StatusSnapshot {
            rev: self.rev,
            url: self.intent.url.clone(),
            station: self.observed.station.get().clone(),
            title: self.observed.stream_title.get().clone(),
            playing: self.intent.should_play,
            phase: self.phase,
            bitrate: *self.observed.bitrate.get(),
            volume: self.volume.logical(),
            volume_max: self.volume.max_volume(),
            balance: self.volume.balance,
            enc_mode: self.enc_mode,
            brightness: self.brightness,
            link: self.connectivity,
            rssi_dbm: self.rssi_dbm,
            uptime_secs: self.uptime_secs(now),
            free_mem_bytes,
            buffer_fill_pct: self.observed.buffer_fill_pct,
        }
    }
}

/// JSON status object exposed by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub rev: u64,
    pub url: String,
    pub station: String,
    pub title: String,
    pub playing: bool,
    pub phase: PlaybackPhase,
    pub bitrate: u32,
    pub volume: u8,
    pub volume_max: u8,
    pub balance: i8,
    pub enc_mode: EncoderMode,
    pub brightness: u8,
    pub link: ConnectivityState,
    pub rssi_dbm: Option<i32>,
    pub uptime_secs: u64,
    pub free_mem_bytes: u64,
    pub buffer_fill_pct: u8,
}
