//! Hardware codec boundary: the coarse attenuator and per-channel mutes.
//!
//! The kernel codec driver exposes both as writable attributes; paths come
//! from the config. Hosts without the hardware get a no-op driver so the rest
//! of the engine is unchanged.

use std::path::PathBuf;
use tracing::{debug, warn};
use wavebox_core::config::HardwareConfig;

pub trait HardwareCodec: Send {
    /// Coarse stage steps above unity; 0 is unity gain.
    fn set_attenuation(&mut self, steps: u8) -> anyhow::Result<()>;
    fn set_mute(&mut self, left: bool, right: bool) -> anyhow::Result<()>;
    fn mute(&self) -> (bool, bool);
}

pub fn from_config(hw: &HardwareConfig) -> Box<dyn HardwareCodec> {
    if hw.attenuation_path.is_empty() {
        debug!("no codec attenuation path configured, hardware stage disabled");
        Box::new(NullCodec::default())
    } else {
        Box::new(SysfsCodec::new(
            PathBuf::from(&hw.attenuation_path),
            PathBuf::from(&hw.mute_path),
        ))
    }
}

/// Driver writing the kernel codec attributes. Redundant writes are skipped;
/// the attenuator sits on a slow control bus.
pub struct SysfsCodec {
    attenuation_path: PathBuf,
    mute_path: PathBuf,
    last_attenuation: Option<u8>,
    mute: (bool, bool),
}

impl SysfsCodec {
    pub fn new(attenuation_path: PathBuf, mute_path: PathBuf) -> Self {
        Self {
            attenuation_path,
            mute_path,
            last_attenuation: None,
            mute: (false, false),
        }
    }
}

impl HardwareCodec for SysfsCodec {
    fn set_attenuation(&mut self, steps: u8) -> anyhow::Result<()> {
        if self.last_attenuation == Some(steps) {
            return Ok(());
        }
        std::fs::write(&self.attenuation_path, format!("{}\n", steps))?;
        self.last_attenuation = Some(steps);
        Ok(())
    }

    fn set_mute(&mut self, left: bool, right: bool) -> anyhow::Result<()> {
        if self.mute == (left, right) {
            return Ok(());
        }
        if self.mute_path.as_os_str().is_empty() {
            warn!("mute requested but no mute path configured");
        } else {
            std::fs::write(&self.mute_path, format!("{} {}\n", left as u8, right as u8))?;
        }
        self.mute = (left, right);
        Ok(())
    }

    fn mute(&self) -> (bool, bool) {
        self.mute
    }
}

/// No hardware present: track state, touch nothing.
#[derive(Default)]
pub struct NullCodec {
    mute: (bool, bool),
}

impl HardwareCodec for NullCodec {
    fn set_attenuation(&mut self, _steps: u8) -> anyhow::Result<()> {
        Ok(())
    }

    fn set_mute(&mut self, left: bool, right: bool) -> anyhow::Result<()> {
        self.mute = (left, right);
        Ok(())
    }

    fn mute(&self) -> (bool, bool) {
        self.mute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_codec_skips_redundant_writes() {
        let dir = std::env::temp_dir();
        let att = dir.join(format!("wavebox-att-{}", std::process::id()));
        let mute = dir.join(format!("wavebox-mute-{}", std::process::id()));
        let mut codec = SysfsCodec::new(att.clone(), mute.clone());

        codec.set_attenuation(7).unwrap();
        assert_eq!(std::fs::read_to_string(&att).unwrap(), "7\n");

        // Same value: the file is not rewritten.
        std::fs::remove_file(&att).unwrap();
        codec.set_attenuation(7).unwrap();
        assert!(!att.exists());

        codec.set_attenuation(8).unwrap();
        assert_eq!(std::fs::read_to_string(&att).unwrap(), "8\n");

        codec.set_mute(true, true).unwrap();
        assert_eq!(std::fs::read_to_string(&mute).unwrap(), "1 1\n");
        assert_eq!(codec.mute(), (true, true));

        let _ = std::fs::remove_file(&att);
        let _ = std::fs::remove_file(&mute);
    }
}
