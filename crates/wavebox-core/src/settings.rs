//! Debounced, write-minimizing persisted settings.
//!
//! The backing store sits on flash, so writes are rationed two ways: a change
//! opens a 10 second debounce window and the record is flushed once the
//! window elapses (continuous knob-twiddling therefore still hits disk at
//! most every 10 seconds, and on-disk state is never more than 10 seconds
//! stale); and a flush first re-reads the persisted record and skips the
//! write when nothing differs. A crash inside the window loses at most the
//! last 10 seconds of changes, an accepted consistency bound.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Debounce window between a change and its flush.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(10);

fn is_false(b: &bool) -> bool {
    !b
}

fn default_volume() -> u8 {
    50
}

fn default_brightness() -> u8 {
    200
}

/// The persisted record. All scalar, no versioning, last-write-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(default)]
    pub enc_mode: u8,
    #[serde(default)]
    pub url: String,
    /// Logically boolean, stored as presence/absence of the key.
    #[serde(default, skip_serializing_if = "is_false")]
    pub playing: bool,
    #[serde(default = "default_brightness")]
    pub brightness: u8,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            enc_mode: 0,
            url: String::new(),
            playing: false,
            brightness: default_brightness(),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    current: ConfigRecord,
    /// When the oldest unflushed change happened.
    dirty_since: Option<Instant>,
}

impl SettingsStore {
    /// Read the record once at startup. A missing or corrupt file yields
    /// defaults; corruption is logged, not fatal.
    pub fn load(path: PathBuf) -> Self {
        let current = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<ConfigRecord>(&content) {
                Ok(record) => record,
                Err(e) => {
                    warn!("settings file {:?} corrupt, using defaults: {}", path, e);
                    ConfigRecord::default()
                }
            },
            Err(_) => ConfigRecord::default(),
        };
        Self {
            path,
            current,
            dirty_since: None,
        }
    }

    pub fn record(&self) -> &ConfigRecord {
        &self.current
    }

    /// Mutate the in-memory record. Opens the debounce window on the first
    /// actual change; mutations that leave the record identical stay clean.
    pub fn update<F>(&mut self, now: Instant, f: F)
    where
        F: FnOnce(&mut ConfigRecord),
    {
        let before = self.current.clone();
        f(&mut self.current);
        if self.current != before && self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// Flush if the debounce window has elapsed. Returns whether bytes were
    /// actually written.
    pub fn maybe_flush(&mut self, now: Instant) -> anyhow::Result<bool> {
        match self.dirty_since {
            Some(since) if now.duration_since(since) >= DEBOUNCE_WINDOW => self.flush(),
            _ => Ok(false),
        }
    }

    /// Unconditional flush (shutdown path). Still skips identical writes.
    pub fn flush(&mut self) -> anyhow::Result<bool> {
        self.dirty_since = None;

        // Re-read what is persisted and write only if it differs.
        if let Ok(content) = std::fs::read_to_string(&self.path) {
            if let Ok(on_disk) = serde_json::from_str::<ConfigRecord>(&content) {
                if on_disk == self.current {
                    debug!("settings unchanged on disk, skipping write");
                    return Ok(false);
                }
            }
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.current)?;
        std::fs::write(&self.path, json)?;
        debug!("settings flushed to {:?}", self.path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> SettingsStore {
        let path = crate::platform::temp_dir().join(format!(
            "wavebox-settings-test-{}-{}.json",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        SettingsStore::load(path)
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let store = temp_store("missing");
        assert_eq!(store.record(), &ConfigRecord::default());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_identical_update_stays_clean() {
        let mut store = temp_store("clean");
        let now = Instant::now();
        store.update(now, |r| r.volume = default_volume());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_debounce_gates_flush() {
        let mut store = temp_store("debounce");
        let t0 = Instant::now();
        store.update(t0, |r| r.volume = 80);

        // Inside the window: no write.
        assert!(!store.maybe_flush(t0 + Duration::from_secs(4)).unwrap());
        assert!(store.is_dirty());

        // Window elapsed: exactly one write.
        assert!(store.maybe_flush(t0 + DEBOUNCE_WINDOW).unwrap());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_window_anchored_to_first_change() {
        let mut store = temp_store("anchor");
        let t0 = Instant::now();
        store.update(t0, |r| r.volume = 10);
        // Later changes do not push the window out.
        store.update(t0 + Duration::from_secs(8), |r| r.volume = 20);
        assert!(store.maybe_flush(t0 + DEBOUNCE_WINDOW).unwrap());
        assert_eq!(store.record().volume, 20);
    }

    #[test]
    fn test_repeated_identical_states_write_once() {
        let mut store = temp_store("dedup");
        let t0 = Instant::now();
        store.update(t0, |r| r.url = "http://stream.example/a".into());
        assert!(store.flush().unwrap());

        // N further saves of the same record produce zero extra writes.
        for _ in 0..5 {
            store.update(t0, |r| r.url = "http://stream.example/a".into());
            assert!(!store.flush().unwrap());
        }
    }

    #[test]
    fn test_round_trip_and_playing_marker() {
        let mut store = temp_store("marker");
        let path = store.path.clone();
        let t0 = Instant::now();
        store.update(t0, |r| {
            r.volume = 90;
            r.url = "http://stream.example/b".into();
            r.playing = true;
        });
        store.flush().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("playing"));

        let reloaded = SettingsStore::load(path.clone());
        assert_eq!(reloaded.record().volume, 90);
        assert!(reloaded.record().playing);

        // Stopped: the marker disappears from the file entirely.
        let mut store = reloaded;
        store.update(t0, |r| r.playing = false);
        store.flush().unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("playing"));
        assert!(!SettingsStore::load(path).record().playing);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let path = crate::platform::temp_dir().join(format!(
            "wavebox-settings-test-corrupt-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "{not json").unwrap();
        let store = SettingsStore::load(path.clone());
        assert_eq!(store.record(), &ConfigRecord::default());
        let _ = std::fs::remove_file(&path);
    }
}
