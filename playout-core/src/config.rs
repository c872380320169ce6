//! JSON configuration file.
//!
//! Every field has a default, so a file only needs the keys it changes:
//!
//! ```json
//! { "session": { "channels": 1, "flow": { "silenceTimeoutMs": 3000 } } }
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    codec::PayloadFormat,
    error::{PlayoutError, Result},
    session::{SessionConfig, MAX_CHANNELS},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PlayoutConfig {
    /// Defaults applied to every session opened from this config.
    pub session: SessionConfig,
    /// Wire format accepted by `submit_packet`.
    pub payload: PayloadFormat,
    /// `tracing-subscriber` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            payload: PayloadFormat::default(),
            log_filter: "info".into(),
        }
    }
}

impl PlayoutConfig {
    /// Strict load: missing file, bad JSON or invalid values are errors.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| PlayoutError::invalid(format!("{}: {e}", path.display())))?;
        config.session.validate()?;
        Ok(config)
    }

    /// Lenient load: anything unreadable falls back to defaults, and
    /// out-of-range values are pulled back into range.
    pub fn load_or_default(path: &Path) -> Self {
        let mut config = fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Self>(&raw).ok())
            .unwrap_or_default();
        config.normalize();
        config
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn normalize(&mut self) {
        let defaults = SessionConfig::default();
        let session = &mut self.session;
        if session.sample_rate == 0 {
            session.sample_rate = defaults.sample_rate;
        }
        session.channels = session.channels.clamp(1, MAX_CHANNELS);
        session.burst_multiplier = session.burst_multiplier.max(1);
        if session.initial_capacity_frames == 0 {
            session.initial_capacity_frames = defaults.initial_capacity_frames;
        }

        let flow = &mut session.flow;
        for ratio in [
            &mut flow.overrun_drop_ratio,
            &mut flow.high_water_ratio,
            &mut flow.target_depth_ratio,
        ] {
            if !ratio.is_finite() {
                *ratio = 0.0;
            }
            *ratio = ratio.clamp(0.0, 1.0);
        }
        flow.event_capacity = flow.event_capacity.max(1);

        if self.log_filter.trim().is_empty() {
            warn!("empty log filter in config, using \"info\"");
            self.log_filter = "info".into();
        }
    }
}

/// `$XDG_CONFIG_HOME/playout/config.json`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("playout")
        .join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("playout-config-{}-{name}", std::process::id()))
            .join("config.json")
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: PlayoutConfig =
            serde_json::from_str(r#"{"session":{"channels":1}}"#).unwrap();
        assert_eq!(config.session.channels, 1);
        assert_eq!(config.session.sample_rate, 48_000);
        assert_eq!(config.session.flow.overrun_drop_ratio, 0.25);
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.payload, PayloadFormat::default());
    }

    #[test]
    fn payload_format_is_read_from_json() {
        let config: PlayoutConfig =
            serde_json::from_str(r#"{"payload":{"encoding":"pcm16"}}"#).unwrap();
        assert_eq!(config.payload.encoding, crate::codec::SampleEncoding::Pcm16);
        assert_eq!(config.payload.byte_order, crate::codec::ByteOrder::Big);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let path = scratch("roundtrip");
        let mut config = PlayoutConfig::default();
        config.session.burst_multiplier = 3;
        config.session.flow.reset_cooldown_ms = 2_500;
        config.save(&path).unwrap();

        assert_eq!(PlayoutConfig::load(&path).unwrap(), config);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn strict_load_rejects_invalid_values() {
        let path = scratch("invalid");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"session":{"channels":64}}"#).unwrap();

        assert!(matches!(
            PlayoutConfig::load(&path),
            Err(PlayoutError::InvalidConfig(_))
        ));
        let lenient = PlayoutConfig::load_or_default(&path);
        assert_eq!(lenient.session.channels, MAX_CHANNELS);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = scratch("missing");
        assert!(matches!(PlayoutConfig::load(&path), Err(PlayoutError::Io(_))));
        assert_eq!(PlayoutConfig::load_or_default(&path), PlayoutConfig::default());
    }

    #[test]
    fn normalize_clamps_ratios() {
        let mut config = PlayoutConfig::default();
        config.session.flow.overrun_drop_ratio = 4.0;
        config.session.flow.high_water_ratio = f32::NAN;
        config.session.channels = 0;
        config.normalize();
        assert_eq!(config.session.flow.overrun_drop_ratio, 1.0);
        assert_eq!(config.session.flow.high_water_ratio, 0.0);
        assert_eq!(config.session.channels, 1);
    }
}
