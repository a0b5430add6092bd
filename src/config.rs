//! Engine configuration.
//!
//! `MixConfig` is the persisted, user-tunable part (JSON on disk). The
//! submodules hold fixed engine constants.

use crate::catalog::{default_roster, ChannelConfig};
use crate::error::{MixError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const CONFIG_DIR: &str = "signal_mix";
const CONFIG_FILE: &str = "config.json";

/// Analysis tap sizes, in frames.
pub mod taps {
    pub const CHANNEL_TAP_FRAMES: usize = 256;
    pub const MASTER_TAP_FRAMES: usize = 1024;
    pub const AUX_TAP_FRAMES: usize = 512;
}

/// Three-band EQ corner frequencies and limits.
pub mod eq {
    pub const LOW_SHELF_HZ: f32 = 100.0;
    pub const MID_PEAK_HZ: f32 = 1000.0;
    pub const MID_PEAK_Q: f32 = 1.0;
    pub const HIGH_SHELF_HZ: f32 = 8000.0;
    pub const MIN_GAIN_DB: f32 = -12.0;
    pub const MAX_GAIN_DB: f32 = 12.0;
}

/// Control ranges for channel and bus gains.
pub mod ranges {
    pub const TRIM_MIN: f32 = 0.1;
    pub const TRIM_MAX: f32 = 3.0;
    pub const FADER_MAX: f32 = 1.0;
    /// Channels start switched on at this fader position.
    pub const FADER_DEFAULT: f32 = 0.8;
    pub const AUX_SEND_MAX: f32 = 1.2;
    pub const BUS_LEVEL_MAX: f32 = 1.0;
}

/// Master dynamics curves.
pub mod dynamics {
    pub const COMPRESSOR_THRESHOLD_DB: f32 = -18.0;
    pub const COMPRESSOR_RATIO: f32 = 3.0;
    pub const COMPRESSOR_ATTACK_MS: f32 = 10.0;
    pub const COMPRESSOR_RELEASE_MS: f32 = 200.0;
    pub const COMPRESSOR_MAKEUP_DB: f32 = 3.0;

    pub const LIMITER_THRESHOLD_DB: f32 = -6.0;
    pub const LIMITER_RATIO: f32 = 20.0;
    pub const LIMITER_ATTACK_MS: f32 = 1.0;
    pub const LIMITER_RELEASE_MS: f32 = 100.0;

    /// Frames over which the master path crossfades after a rebuild.
    pub const REBUILD_CROSSFADE_FRAMES: usize = 256;
}

/// Network defaults.
pub mod network {
    pub const USER_AGENT: &str = concat!("signal_mix/", env!("CARGO_PKG_VERSION"));
    /// Origin sent with analysis-capable requests.
    pub const ANALYSIS_ORIGIN: &str = "http://localhost";
    pub const READ_TIMEOUT_SECS: u64 = 30;
    pub const MAX_BACKOFF_SECS: u64 = 30;
    pub const MAX_MANIFEST_DEPTH: usize = 5;
}

/// Stream session tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Reconnect attempts after an established stream drops.
    pub max_reconnects: u32,
    /// Decoders stop pushing once this much audio is queued.
    pub high_water_ms: u32,
    /// Hard cap on queued audio; the oldest frames are dropped beyond it.
    pub max_buffer_ms: u32,
    /// Bitrate reported for progressive streams.
    pub nominal_bitrate_kbps: u32,
    pub connect_timeout_secs: u64,
    /// First reconnect delay; doubles per attempt up to a 30 s cap.
    pub retry_base_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            max_reconnects: 2,
            high_water_ms: 1000,
            max_buffer_ms: 4000,
            nominal_bitrate_kbps: 128,
            connect_timeout_secs: 10,
            retry_base_delay_ms: 2000,
        }
    }
}

/// Default output device per bus. `None` = system default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouteConfig {
    pub master: Option<String>,
    pub aux1: Option<String>,
    pub aux2: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixConfig {
    pub sample_rate: u32,
    pub block_frames: usize,
    pub channels: Vec<ChannelConfig>,
    pub master_level: f32,
    pub aux_levels: [f32; 2],
    pub limiter_enabled: bool,
    pub compressor_enabled: bool,
    pub ramp_time_constant_secs: f32,
    pub aux_ramp_time_constant_secs: f32,
    /// RMS on the master tap above which the station is on air.
    pub on_air_threshold: f32,
    pub on_air_interval_ms: u64,
    pub stream: StreamConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_dir: Option<PathBuf>,
    pub ffmpeg_path: PathBuf,
    pub output_routes: RouteConfig,
}

impl Default for MixConfig {
    fn default() -> Self {
        MixConfig {
            sample_rate: 48_000,
            block_frames: 480,
            channels: default_roster(),
            master_level: 0.8,
            aux_levels: [1.0, 1.0],
            limiter_enabled: true,
            compressor_enabled: false,
            ramp_time_constant_secs: 0.05,
            aux_ramp_time_constant_secs: 0.01,
            on_air_threshold: 0.005,
            on_air_interval_ms: 200,
            stream: StreamConfig::default(),
            recording_dir: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            output_routes: RouteConfig::default(),
        }
    }
}

impl MixConfig {
    /// Default location: `<config dir>/signal_mix/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(CONFIG_FILE)
    }

    /// Load from JSON, or fall back to defaults if the file is missing or corrupt.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(config) => return config,
                    Err(e) => warn!("corrupt config {}, using defaults: {}", path.display(), e),
                },
                Err(e) => warn!("could not read config {}: {}", path.display(), e),
            }
        }
        MixConfig::default()
    }

    /// Persist as pretty JSON, creating the parent directory if needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MixError::Config(format!("serialize: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate < 8_000 {
            return Err(MixError::Config(format!(
                "sample rate {} too low",
                self.sample_rate
            )));
        }
        if self.block_frames == 0 {
            return Err(MixError::Config("block_frames must be > 0".into()));
        }
        if self.channels.is_empty() {
            return Err(MixError::Config("channel roster is empty".into()));
        }
        // Channel lookup ignores case, so ids must be unique ignoring case.
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id.to_ascii_uppercase()) {
                return Err(MixError::Config(format!(
                    "duplicate channel id '{}' in roster",
                    channel.id
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn frames_for_ms(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1000) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_console_presets() {
        let config = MixConfig::default();
        assert_eq!(config.master_level, 0.8);
        assert!(config.limiter_enabled);
        assert!(!config.compressor_enabled);
        assert_eq!(config.on_air_threshold, 0.005);
        assert_eq!(config.stream.nominal_bitrate_kbps, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn survives_serialization() {
        let mut config = MixConfig::default();
        config.master_level = 0.5;
        config.output_routes.aux2 = Some("Headphones".into());
        let json = serde_json::to_string(&config).unwrap();
        let loaded: MixConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let json = r#"{"sample_rate":44100}"#;
        let config: MixConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.block_frames, 480);
        assert!(!config.channels.is_empty());
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MixConfig::load_from(&dir.path().join("nope.json"));
        assert_eq!(config, MixConfig::default());
    }

    #[test]
    fn load_from_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(MixConfig::load_from(&path), MixConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = MixConfig::default();
        config.compressor_enabled = true;
        config.save_to(&path).unwrap();
        assert_eq!(MixConfig::load_from(&path), config);
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut config = MixConfig::default();
        let dup = config.channels[1].clone();
        config.channels.push(dup);
        assert!(matches!(config.validate(), Err(MixError::Config(_))));
    }

    #[test]
    fn validate_rejects_ids_differing_only_in_case() {
        let mut config = MixConfig::default();
        let mut lower = config.channels[0].clone();
        lower.id = lower.id.to_ascii_lowercase();
        assert_ne!(lower.id, config.channels[0].id);
        config.channels.push(lower);
        assert!(matches!(config.validate(), Err(MixError::Config(_))));
    }

    #[test]
    fn frames_for_ms_scales_with_rate() {
        let config = MixConfig::default();
        assert_eq!(config.frames_for_ms(1000), 48_000);
        assert_eq!(config.frames_for_ms(10), 480);
    }
}
