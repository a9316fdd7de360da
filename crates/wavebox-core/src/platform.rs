use std::path::PathBuf;

/// Config directory: `~/.config/wavebox/`.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("wavebox")
}

/// Data directory (logs, persisted settings): `~/.local/share/wavebox/`.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join("wavebox")
}

pub fn temp_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Default decoder IPC socket path.
pub fn decoder_socket_path() -> String {
    format!("{}/wavebox-decoder.sock", temp_dir().display())
}
