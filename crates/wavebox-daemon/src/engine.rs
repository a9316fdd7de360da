//! The engine loop.
//!
//! All mutable device state is owned by one task; every external input
//! (HTTP control, decoder events, link events, updater progress, the
//! encoder counter) funnels in through one channel or is drained at the top
//! of the tick. Each reconcile tick: drain encoder delta → reconcile
//! playback intent against the observed decoder state → flush settings if
//! the debounce elapsed. The display advances on its own fixed tick.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use wavebox_core::config::Config;
use wavebox_core::connectivity::{ConnectivityTracker, Edge, LinkEvent};
use wavebox_core::settings::SettingsStore;
use wavebox_core::state::{DeviceState, EncoderMode, StatusSnapshot, UpdateProgress};
use wavebox_core::volume::VolumeState;

use crate::codec::HardwareCodec;
use crate::decoder::{DecoderEvent, DecoderHandle};
use crate::display::{DisplayDriver, Screen, FRAME_INTERVAL};
use crate::input::EncoderCounter;
use crate::net;
use crate::playback::{PlaybackAction, Reconciler};

/// Scheduler tick for the reconcile pass.
pub const RECONCILE_INTERVAL: Duration = Duration::from_millis(250);

/// Brightness change per encoder detent when the knob is in brightness mode.
const BRIGHTNESS_STEP: i32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeChange {
    Absolute(i32),
    Relative(i32),
}

/// One control-surface request; every field is independent and optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlRequest {
    /// `Some("")` means "resume the last persisted URL".
    pub play: Option<String>,
    pub stop: bool,
    pub vol: Option<VolumeChange>,
    pub bal: Option<i8>,
    pub brightness: Option<u8>,
    pub enc_mode: Option<u8>,
}

pub enum EngineEvent {
    Control {
        req: ControlRequest,
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Decoder(DecoderEvent),
    Link(LinkEvent),
    Rssi(Option<i32>),
    StartProvisioning,
    UpdateProgress(u8),
    UpdateFinished {
        ok: bool,
    },
}

pub struct EngineCore {
    config: Config,
    state: DeviceState,
    settings: SettingsStore,
    reconciler: Reconciler,
    tracker: ConnectivityTracker,
    screen: Screen,
    driver: Box<dyn DisplayDriver>,
    codec: Box<dyn HardwareCodec>,
    decoder: DecoderHandle,
    encoder: Arc<EncoderCounter>,
    event_tx: mpsc::Sender<EngineEvent>,
    /// Mute state saved while a firmware update is in flight.
    saved_mute: Option<(bool, bool)>,
}

impl EngineCore {
    pub async fn new(
        config: Config,
        decoder: DecoderHandle,
        codec: Box<dyn HardwareCodec>,
        driver: Box<dyn DisplayDriver>,
        encoder: Arc<EncoderCounter>,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> anyhow::Result<Self> {
        let now = Instant::now();
        let settings = SettingsStore::load(config.daemon.settings_file.clone());

        // The software step count anchors the two-region volume split;
        // queried once and cached for the life of the process.
        let hardware_max = decoder.software_steps().await.unwrap_or_else(|e| {
            warn!("decoder did not report gain steps, assuming 100: {}", e);
            100
        });
        info!("decoder reports {} software gain steps", hardware_max);

        let volume = VolumeState::new(hardware_max, now);
        let state = DeviceState::new(volume, now);
        let screen = Screen::new(config.display.width);

        let mut core = Self {
            config,
            state,
            settings,
            reconciler: Reconciler::new(),
            tracker: ConnectivityTracker::new(),
            screen,
            driver,
            codec,
            decoder,
            encoder,
            event_tx,
            saved_mute: None,
        };
        core.restore_persisted(now).await;
        Ok(core)
    }

    /// Re-apply the persisted record once at boot.
    async fn restore_persisted(&mut self, now: Instant) {
        let record = self.settings.record().clone();

        match EncoderMode::from_id(record.enc_mode) {
            Some(mode) => self.state.enc_mode = mode,
            None => warn!("persisted encoder mode {} unknown, keeping default", record.enc_mode),
        }
        self.state.brightness = record.brightness;

        self.state.volume.set(record.volume as i32, now);
        self.push_volume_outputs().await;

        if record.playing && !record.url.is_empty() {
            info!("resuming last station: {}", record.url);
            let action = self
                .reconciler
                .set_intent(&mut self.state, record.url, true, now);
            self.execute(action).await;
        }
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<EngineEvent>) -> anyhow::Result<()> {
        let mut reconcile = tokio::time::interval(RECONCILE_INTERVAL);
        let mut frame = tokio::time::interval(FRAME_INTERVAL);

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("event channel closed, engine stopping");
                        break;
                    }
                },
                _ = reconcile.tick() => self.reconcile_tick().await,
                _ = frame.tick() => self.frame_tick(),
            }
        }

        // Shutdown: persist whatever is pending.
        if let Err(e) = self.settings.flush() {
            warn!("final settings flush failed: {}", e);
        }
        Ok(())
    }

    async fn reconcile_tick(&mut self) {
        let now = Instant::now();

        // Drain the interrupt-fed counter exactly once per tick; all policy
        // lives here, not in the reader.
        let steps = self.encoder.take();
        if steps != 0 {
            match self.state.enc_mode {
                EncoderMode::Volume => self.apply_volume(VolumeChange::Relative(steps), now).await,
                EncoderMode::Brightness => {
                    let level =
                        (self.state.brightness as i32 + steps * BRIGHTNESS_STEP).clamp(0, 255) as u8;
                    self.apply_brightness(level, now);
                }
                EncoderMode::Disabled => {}
            }
        }

        let action = self.reconciler.tick(&mut self.state, now);
        self.execute(action).await;

        match self.settings.maybe_flush(now) {
            Ok(true) => debug!("settings flushed"),
            Ok(false) => {}
            Err(e) => warn!("settings flush failed: {}", e),
        }
    }

    fn frame_tick(&mut self) {
        let now = Instant::now();
        if let Err(e) = self.screen.tick(&self.state, now, self.driver.as_mut()) {
            debug!("display flush failed: {}", e);
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        let now = Instant::now();
        match event {
            EngineEvent::Control { req, reply } => {
                self.apply_control(req, now).await;
                let _ = reply.send(self.snapshot(now));
            }
            EngineEvent::Status { reply } => {
                let _ = reply.send(self.snapshot(now));
            }
            EngineEvent::Decoder(event) => self.handle_decoder_event(event),
            EngineEvent::Link(event) => self.handle_link_event(event),
            EngineEvent::Rssi(rssi) => {
                self.state.rssi_dbm = rssi;
            }
            EngineEvent::StartProvisioning => self.start_provisioning(),
            EngineEvent::UpdateProgress(percent) => self.update_progress(percent).await,
            EngineEvent::UpdateFinished { ok } => self.update_finished(ok).await,
        }
    }

    async fn apply_control(&mut self, req: ControlRequest, now: Instant) {
        if let Some(id) = req.enc_mode {
            match EncoderMode::from_id(id) {
                Some(mode) => {
                    self.state.enc_mode = mode;
                    self.state.bump();
                    self.settings.update(now, |r| r.enc_mode = id);
                }
                // Out-of-range ids are ignored, not errors.
                None => warn!("ignoring unknown encoder mode id {}", id),
            }
        }

        if let Some(level) = req.brightness {
            self.apply_brightness(level, now);
        }

        if let Some(balance) = req.bal {
            let balance = balance.clamp(-10, 10);
            self.state.volume.balance = balance;
            self.state.bump();
            if let Err(e) = self.decoder.set_balance(balance).await {
                warn!("decoder balance update failed: {}", e);
            }
        }

        if let Some(change) = req.vol {
            self.apply_volume(change, now).await;
        }

        if let Some(url) = req.play {
            let resolved = if url.is_empty() {
                self.settings.record().url.clone()
            } else {
                url
            };
            if resolved.is_empty() {
                warn!("play requested but no station URL known");
            } else {
                self.settings.update(now, |r| {
                    r.url = resolved.clone();
                    r.playing = true;
                });
                let action = self
                    .reconciler
                    .set_intent(&mut self.state, resolved, true, now);
                self.execute(action).await;
            }
        }

        if req.stop {
            self.settings.update(now, |r| r.playing = false);
            let action = self
                .reconciler
                .set_intent(&mut self.state, String::new(), false, now);
            self.execute(action).await;
        }
    }

    /// Map the logical volume and push both outputs together.
    async fn apply_volume(&mut self, change: VolumeChange, now: Instant) {
        let applied = match change {
            VolumeChange::Absolute(v) => self.state.volume.set(v, now),
            VolumeChange::Relative(d) => self.state.volume.adjust(d, now),
        };
        self.state.bump();
        self.settings.update(now, |r| r.volume = applied);
        self.push_volume_outputs().await;
        debug!(
            "volume {} -> hw {} sw {}",
            applied,
            self.state.volume.split().hw_attenuation,
            self.state.volume.split().sw_gain
        );
    }

    async fn push_volume_outputs(&mut self) {
        let split = self.state.volume.split();
        if let Err(e) = self.codec.set_attenuation(split.hw_attenuation) {
            warn!("codec attenuation update failed: {}", e);
        }
        if let Err(e) = self.decoder.set_gain(split.sw_gain).await {
            warn!("decoder gain update failed: {}", e);
        }
    }

    fn apply_brightness(&mut self, level: u8, now: Instant) {
        self.state.brightness = level;
        self.state.bump();
        self.settings.update(now, |r| r.brightness = level);
    }

    fn handle_decoder_event(&mut self, event: DecoderEvent) {
        match event {
            DecoderEvent::Running(running) => {
                if running != self.state.observed.running {
                    self.reconciler.on_running_changed(&mut self.state, running);
                }
            }
            DecoderEvent::Station(name) => {
                self.state.observed.station.set(name);
                self.state.bump();
            }
            DecoderEvent::StreamTitle(title) => {
                self.state.observed.stream_title.set(title);
                self.state.bump();
            }
            DecoderEvent::IcyUrl(url) => {
                self.state.observed.icy_url.set(url);
                self.state.bump();
            }
            DecoderEvent::Bitrate(kbps) => {
                self.state.observed.bitrate.set(kbps);
                self.state.bump();
            }
            DecoderEvent::BufferFill(pct) => {
                self.state.observed.buffer_fill_pct = pct;
            }
            DecoderEvent::Ended { error } => {
                if error {
                    warn!("decoder reported stream error, will retry");
                }
                if self.state.observed.running {
                    self.reconciler.on_running_changed(&mut self.state, false);
                }
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let edge = self.tracker.apply(event);
        self.state.connectivity = self.tracker.state();
        self.state.bump();

        if let Some(edge) = edge {
            self.reconciler.on_edge(&mut self.state, edge);
            if edge == Edge::ProvisioningEnded {
                // WPS is over (either way); kick a normal association.
                let interface = self.config.network.interface.clone();
                tokio::spawn(async move {
                    net::reassociate(&interface).await;
                });
            }
        }
    }

    fn start_provisioning(&mut self) {
        if self.tracker.state() == wavebox_core::connectivity::ConnectivityState::Provisioning {
            debug!("provisioning already in progress");
            return;
        }
        self.tracker.apply(LinkEvent::ProvisioningStarted);
        self.state.connectivity = self.tracker.state();
        self.state.bump();
        net::spawn_wps(
            self.config.network.interface.clone(),
            Duration::from_secs(self.config.network.wps_timeout_secs),
            self.event_tx.clone(),
        );
    }

    async fn update_progress(&mut self, percent: u8) {
        if self.state.update.is_none() {
            // Entering the update flow: silence the outputs, remember how
            // they were.
            info!("firmware update started");
            self.saved_mute = Some(self.codec.mute());
            if let Err(e) = self.codec.set_mute(true, true) {
                warn!("mute for update failed: {}", e);
            }
            let _ = self.decoder.stop().await;
        }
        self.state.update = Some(UpdateProgress { percent });
        self.state.bump();
    }

    async fn update_finished(&mut self, ok: bool) {
        self.state.update = None;
        if let Some((left, right)) = self.saved_mute.take() {
            if let Err(e) = self.codec.set_mute(left, right) {
                warn!("mute restore failed: {}", e);
            }
        }
        if ok {
            info!("firmware update finished");
            self.state.bump();
        } else {
            warn!("firmware update failed");
            let action = self.reconciler.on_update_failed(&mut self.state);
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: PlaybackAction) {
        match action {
            PlaybackAction::None => {}
            PlaybackAction::Stop => {
                if let Err(e) = self.decoder.stop().await {
                    warn!("decoder stop failed: {}", e);
                }
            }
            PlaybackAction::Connect(url) => {
                self.state.observed.last_host.set(host_of(&url).to_string());
                if let Err(e) = self.decoder.connect(&url).await {
                    // Not fatal: the attempt stamp is set, the next elapsed
                    // cooldown retries.
                    warn!("decoder connect failed: {}", e);
                }
            }
        }
    }

    fn snapshot(&self, now: Instant) -> StatusSnapshot {
        self.state.snapshot(now, free_mem_bytes())
    }
}

/// Host part of a stream URL, for the "last host" status field.
pub fn host_of(url: &str) -> &str {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let end = rest.find(['/', ':', '?']).unwrap_or(rest.len());
    &rest[..end]
}

/// `MemAvailable` from /proc/meminfo, in bytes.
pub fn free_mem_bytes() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| parse_meminfo(&content))
        .unwrap_or(0)
}

fn parse_meminfo(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
        Some(kb * 1024)
    })
}
