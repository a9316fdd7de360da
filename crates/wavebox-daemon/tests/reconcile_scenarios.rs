//! End-to-end reconcile scenarios across the connectivity tracker, the
//! playback reconciler, and the settings store.

use std::time::{Duration, Instant};

use wavebox_core::connectivity::{ConnectivityTracker, LinkEvent};
use wavebox_core::settings::{SettingsStore, DEBOUNCE_WINDOW};
use wavebox_core::state::{DeviceState, PlaybackPhase};
use wavebox_core::volume::VolumeState;
use wavebox_daemon::playback::{PlaybackAction, Reconciler};

const URL: &str = "http://stream.example/a";

fn device(now: Instant) -> DeviceState {
    DeviceState::new(VolumeState::new(100, now), now)
}

fn sync_link(st: &mut DeviceState, tracker: &ConnectivityTracker) {
    st.connectivity = tracker.state();
}

/// Intent set while online; the decoder never starts; the link flaps at 4 s.
/// No reconnect inside the cooldown; exactly one at 6 s.
#[test]
fn scenario_cooldown_across_connectivity_flap() {
    let t0 = Instant::now();
    let mut st = device(t0);
    let mut tracker = ConnectivityTracker::new();
    let mut r = Reconciler::new();

    tracker.apply(LinkEvent::LinkUp);
    sync_link(&mut st, &tracker);

    // First attempt is issued with the intent.
    assert_eq!(
        r.set_intent(&mut st, URL.into(), true, t0),
        PlaybackAction::Connect(URL.into())
    );

    // The link drops and comes back 4 s after the attempt.
    if let Some(edge) = tracker.apply(LinkEvent::LinkDown) {
        sync_link(&mut st, &tracker);
        r.on_edge(&mut st, edge);
    }
    if let Some(edge) = tracker.apply(LinkEvent::LinkUp) {
        sync_link(&mut st, &tracker);
        r.on_edge(&mut st, edge);
    }
    assert_eq!(st.phase, PlaybackPhase::Recovering);

    // 4 s: still inside the cooldown.
    assert_eq!(
        r.tick(&mut st, t0 + Duration::from_secs(4)),
        PlaybackAction::None
    );

    // 6 s: exactly one catch-up reconnect.
    assert_eq!(
        r.tick(&mut st, t0 + Duration::from_secs(6)),
        PlaybackAction::Connect(URL.into())
    );
    assert_eq!(
        r.tick(&mut st, t0 + Duration::from_secs(7)),
        PlaybackAction::None
    );
}

/// Two full flaps inside one cooldown window still yield a single attempt.
#[test]
fn scenario_double_flap_single_attempt() {
    let t0 = Instant::now();
    let mut st = device(t0);
    let mut tracker = ConnectivityTracker::new();
    let mut r = Reconciler::new();

    tracker.apply(LinkEvent::LinkUp);
    sync_link(&mut st, &tracker);
    r.set_intent(&mut st, URL.into(), true, t0);

    let mut attempts = 0;
    for (secs, event) in [
        (1, LinkEvent::LinkDown),
        (2, LinkEvent::LinkUp),
        (3, LinkEvent::LinkDown),
        (4, LinkEvent::LinkUp),
    ] {
        if let Some(edge) = tracker.apply(event) {
            sync_link(&mut st, &tracker);
            r.on_edge(&mut st, edge);
        }
        if r.tick(&mut st, t0 + Duration::from_secs(secs)) != PlaybackAction::None {
            attempts += 1;
        }
    }
    assert_eq!(attempts, 0);

    // Once the window elapses, one attempt.
    assert_eq!(
        r.tick(&mut st, t0 + Duration::from_secs(5)),
        PlaybackAction::Connect(URL.into())
    );
}

/// Switching stations never leaves a stale-title window.
#[test]
fn scenario_station_switch_clears_metadata_atomically() {
    let t0 = Instant::now();
    let mut st = device(t0);
    let mut tracker = ConnectivityTracker::new();
    let mut r = Reconciler::new();

    tracker.apply(LinkEvent::LinkUp);
    sync_link(&mut st, &tracker);

    r.set_intent(&mut st, URL.into(), true, t0);
    r.on_running_changed(&mut st, true);
    st.observed.station.set("Station A".into());
    st.observed.stream_title.set("Song A".into());
    st.observed.bitrate.set(192);
    st.observed.icy_url.set("http://a.example".into());
    st.observed.last_host.set("a.example".into());

    let action = r.set_intent(
        &mut st,
        "http://stream.example/b".into(),
        true,
        t0 + Duration::from_secs(30),
    );
    assert_eq!(
        action,
        PlaybackAction::Connect("http://stream.example/b".into())
    );

    // Every observed field is already cleared when the new intent lands.
    assert!(st.observed.station.get().is_empty());
    assert!(st.observed.stream_title.get().is_empty());
    assert_eq!(*st.observed.bitrate.get(), 0);
    assert!(st.observed.icy_url.get().is_empty());
    assert!(st.observed.last_host.get().is_empty());
}

/// Continuous volume twiddling coalesces into one write per debounce window.
#[test]
fn scenario_settings_coalesce_under_twiddling() {
    let path = std::env::temp_dir().join(format!(
        "wavebox-scenario-settings-{}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let mut store = SettingsStore::load(path.clone());

    let t0 = Instant::now();
    let mut writes = 0;

    // 40 encoder ticks over 8 seconds, flush checked every 250 ms.
    for i in 0..40u64 {
        let now = t0 + Duration::from_millis(200 * i);
        store.update(now, |r| r.volume = 51 + i as u8);
        if store.maybe_flush(now).unwrap() {
            writes += 1;
        }
    }
    assert_eq!(writes, 0);

    // The window elapses: a single write lands.
    assert!(store.maybe_flush(t0 + DEBOUNCE_WINDOW).unwrap());

    // Re-saving the identical record afterwards produces no further writes.
    let final_volume = store.record().volume;
    for _ in 0..3 {
        store.update(t0 + DEBOUNCE_WINDOW, |r| r.volume = final_volume);
        assert!(!store.flush().unwrap());
    }

    let _ = std::fs::remove_file(&path);
}
