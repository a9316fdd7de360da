use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Persisted runtime settings (volume, last url, ...).
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Decoder binary spawned by the daemon.
    #[serde(default = "default_decoder_binary")]
    pub binary: String,
    #[serde(default = "default_decoder_socket")]
    pub socket: String,
}

/// Paths exposed by the kernel codec driver. Empty paths disable the
/// hardware stage (development hosts without the codec).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HardwareConfig {
    #[serde(default)]
    pub attenuation_path: String,
    #[serde(default)]
    pub mute_path: String,
    /// evdev device for the rotary encoder (empty disables it).
    #[serde(default)]
    pub encoder_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_wps_timeout")]
    pub wps_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Character cells per row on the status panel.
    #[serde(default = "default_display_width")]
    pub width: u16,
    #[serde(default = "default_display_rows")]
    pub rows: u16,
    /// Frame sink device (empty renders to the log at trace level).
    #[serde(default)]
    pub device: String,
    /// Backlight control attribute for brightness (empty disables it).
    #[serde(default)]
    pub backlight_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            settings_file: default_settings_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            binary: default_decoder_binary(),
            socket: default_decoder_socket(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            wps_timeout_secs: default_wps_timeout(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_display_width(),
            rows: default_display_rows(),
            device: String::new(),
            backlight_path: String::new(),
        }
    }
}

fn default_settings_file() -> PathBuf {
    platform::data_dir().join("settings.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_decoder_binary() -> String {
    "mpv".to_string()
}

fn default_decoder_socket() -> String {
    platform::decoder_socket_path()
}

fn default_interface() -> String {
    "wlan0".to_string()
}

fn default_wps_timeout() -> u64 {
    120
}

fn default_display_width() -> u16 {
    21
}

fn default_display_rows() -> u16 {
    6
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
