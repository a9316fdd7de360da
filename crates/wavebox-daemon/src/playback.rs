//! Playback reconciliation.
//!
//! The reconciler owns "what should be playing" and compares it against what
//! the decoder reports, once per engine tick. It is pure: every entry point
//! returns a [`PlaybackAction`] for the engine to execute, and the clock is
//! an explicit argument. Nothing here is fatal; every failure path degrades
//! to "not playing, will retry".

use std::time::{Duration, Instant};
use tracing::{debug, info};
use wavebox_core::connectivity::Edge;
use wavebox_core::state::{DeviceState, PlaybackIntent, PlaybackPhase};

/// Minimum gap between connect attempts. Avoids hot-looping against a dead
/// stream or a flapping network.
pub const CONNECT_COOLDOWN: Duration = Duration::from_secs(5);

/// Station name shown when a firmware update fails. The persisted URL is
/// untouched, so a later retry still targets the original stream.
pub const UPDATE_FAILED_STATION: &str = "update failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackAction {
    None,
    Stop,
    Connect(String),
}

#[derive(Debug, Default)]
pub struct Reconciler {
    last_attempt: Option<Instant>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the playback intent. All cached observed-metadata fields are
    /// cleared atomically with the swap so stale metadata is never shown for
    /// a new station. Re-setting the current intent is a no-op beyond
    /// refreshing the attempt timestamp.
    pub fn set_intent(
        &mut self,
        st: &mut DeviceState,
        url: String,
        play: bool,
        now: Instant,
    ) -> PlaybackAction {
        let new_intent = if play && !url.is_empty() {
            PlaybackIntent::play(url)
        } else {
            PlaybackIntent::stopped()
        };

        // Re-setting the current intent (including a second stop) is a no-op;
        // if the decoder is not running, the tick path reconnects under the
        // normal cooldown.
        if new_intent == st.intent {
            if new_intent.should_play && st.observed.running {
                self.last_attempt = Some(now);
            }
            return PlaybackAction::None;
        }

        st.observed.clear_metadata();
        st.intent = new_intent;
        st.bump();

        if !st.intent.should_play {
            info!("playback: stopped");
            st.phase = PlaybackPhase::Idle;
            self.last_attempt = None;
            return PlaybackAction::Stop;
        }

        st.phase = PlaybackPhase::Connecting;
        if st.connectivity.is_connected() {
            info!("playback: connecting to {}", st.intent.url);
            self.last_attempt = Some(now);
            PlaybackAction::Connect(st.intent.url.clone())
        } else {
            debug!("playback: intent set while offline, connect deferred");
            PlaybackAction::None
        }
    }

    /// React to a connectivity transition edge. A `CameUp` edge marks a
    /// pending catch-up reconnect; the actual attempt flows through the
    /// cooldown gate in [`tick`](Self::tick) so a flapping link never issues
    /// two attempts inside one window.
    pub fn on_edge(&mut self, st: &mut DeviceState, edge: Edge) {
        match edge {
            Edge::CameUp => {
                if st.intent.should_play && !st.observed.running {
                    info!("playback: link restored, reconnect pending");
                    st.phase = PlaybackPhase::Recovering;
                    st.bump();
                }
            }
            Edge::WentDown => {
                if st.intent.should_play {
                    st.phase = PlaybackPhase::Connecting;
                    st.bump();
                }
            }
            Edge::ProvisioningEnded => {}
        }
    }

    /// The decoder's running flag changed.
    pub fn on_running_changed(&mut self, st: &mut DeviceState, running: bool) {
        st.observed.running = running;
        st.phase = match (st.intent.should_play, running) {
            (true, true) => PlaybackPhase::Playing,
            (true, false) => {
                if st.phase == PlaybackPhase::Recovering {
                    PlaybackPhase::Recovering
                } else {
                    PlaybackPhase::Connecting
                }
            }
            (false, _) => PlaybackPhase::Idle,
        };
        st.bump();
    }

    /// Firmware update failed. Swap only the displayed station to the
    /// failure notice and stop the decoder; intent and persisted URL
    /// survive, so the normal reconcile path retries the original stream.
    pub fn on_update_failed(&mut self, st: &mut DeviceState) -> PlaybackAction {
        st.observed.station.set(UPDATE_FAILED_STATION.to_string());
        st.observed.running = false;
        st.bump();
        if st.intent.should_play {
            st.phase = PlaybackPhase::Connecting;
            PlaybackAction::Stop
        } else {
            PlaybackAction::None
        }
    }

    /// Per-tick reconcile: should be playing, decoder is not, connectivity
    /// is up, and the cooldown has elapsed → issue exactly one connect.
    pub fn tick(&mut self, st: &mut DeviceState, now: Instant) -> PlaybackAction {
        if !st.intent.should_play || st.observed.running {
            return PlaybackAction::None;
        }
        if !st.connectivity.is_connected() {
            return PlaybackAction::None;
        }
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < CONNECT_COOLDOWN {
                return PlaybackAction::None;
            }
        }
        info!("playback: reconnecting to {}", st.intent.url);
        self.last_attempt = Some(now);
        st.phase = PlaybackPhase::Connecting;
        st.bump();
        PlaybackAction::Connect(st.intent.url.clone())
    }
}
