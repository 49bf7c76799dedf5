//! Monitor configuration
//!
//! The configuration is read once from TOML and is then an
//! immutable snapshot for the lifetime of the [`Monitor`](crate::Monitor).
//! Every field has a default, so an empty file is a valid
//! configuration for a station at the defaults.
//!
//! ```
//! use fmwatch::MonitorConfig;
//!
//! let cfg = MonitorConfig::from_toml_str(r#"
//!     [radio]
//!     frequency = "88.6M"
//!
//!     [audio]
//!     silence_threshold_db = -35.0
//!     silence_duration_secs = 5
//! "#).expect("bad config");
//!
//! assert_eq!(cfg.radio.frequency, "88.6M");
//! assert_eq!(cfg.audio.silence_threshold_db, -35.0);
//! assert_eq!(cfg.radio.capture_rate, 171000);
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

/// Complete engine configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub radio: RadioConfig,
    pub audio: AudioConfig,
    pub alerts: AlertConfig,
    pub services: ServicesConfig,
    pub pipeline: PipelineConfig,
    pub timing: TimingConfig,
}

/// Tuner settings for the capture stage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Capture frequency, in the capture program's syntax (`88.6M`)
    pub frequency: String,

    /// Tuner gain (dB)
    pub gain: f32,

    /// Frequency correction (ppm)
    pub ppm_error: i32,

    /// Raw PCM sampling rate (Hz)
    ///
    /// RDS decoding needs the full 171 kHz multiplex.
    pub capture_rate: u32,
}

/// Encoded audio and silence detection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Encoded audio sampling rate (Hz)
    pub output_rate: u32,

    /// Encoded audio bitrate (kbit/s)
    pub bitrate_kbps: u32,

    /// Levels below this are silence (dBFS)
    pub silence_threshold_db: f32,

    /// Silence must last this long before an alert (s)
    pub silence_duration_secs: u64,
}

/// Alert dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Master switch for outbound alerts
    pub enabled: bool,

    /// Minimum spacing between two dispatched alerts (min)
    pub cooldown_minutes: u64,

    /// Alert hook program and its arguments
    pub command: Vec<String>,

    /// Also alert when the signal comes back after an alert
    pub notify_recovery: bool,
}

/// Initial state of the service toggles
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub level_analysis: bool,
    pub audio_relay: bool,
    pub watchdog: bool,
    pub metadata_reader: bool,
    pub history: bool,
}

/// External programs of the process chain
///
/// The `*_command` overrides, when non-empty, are used
/// verbatim as argv without any shell interpretation. The
/// engine does not add its own arguments to them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture_program: String,
    pub decoder_program: String,
    pub encoder_program: String,
    pub capture_command: Vec<String>,
    pub decoder_command: Vec<String>,
    pub encoder_command: Vec<String>,
}

/// Cadences and buffer sizes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Raw PCM bytes per level estimate
    pub level_chunk_bytes: usize,

    /// Encoded audio bytes per frame read
    pub audio_read_bytes: usize,

    /// Spacing of level samples sent to history (s)
    pub history_interval_secs: u64,

    /// Signal state machine cadence (ms)
    pub evaluate_interval_ms: u64,

    /// Watchdog liveness check period (s)
    pub watchdog_period_secs: u64,

    /// Pause between killing a dead chain and respawning it (ms)
    pub restart_settle_ms: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency: "88.6M".to_owned(),
            gain: 40.0,
            ppm_error: 0,
            capture_rate: 171000,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_rate: 48000,
            bitrate_kbps: 128,
            silence_threshold_db: -50.0,
            silence_duration_secs: 30,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_minutes: 30,
            command: Vec::new(),
            notify_recovery: false,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            level_analysis: true,
            audio_relay: true,
            watchdog: true,
            metadata_reader: false,
            history: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_program: "rtl_fm".to_owned(),
            decoder_program: "redsea".to_owned(),
            encoder_program: "sox".to_owned(),
            capture_command: Vec::new(),
            decoder_command: Vec::new(),
            encoder_command: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            level_chunk_bytes: 4096,
            audio_read_bytes: 8192,
            history_interval_secs: 5,
            evaluate_interval_ms: 1000,
            watchdog_period_secs: 10,
            restart_settle_ms: 2000,
        }
    }
}

impl MonitorConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let cfg: MonitorConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check all values for sanity
    ///
    /// Returns the first offending key. A configuration which
    /// fails validation must not be used to start the engine.
    pub fn validate(&self) -> Result<()> {
        if self.radio.frequency.trim().is_empty() {
            return Err(MonitorError::invalid("radio.frequency", "must not be empty"));
        }
        if self.radio.capture_rate == 0 {
            return Err(MonitorError::invalid("radio.capture_rate", "must be positive"));
        }
        if self.audio.output_rate == 0 {
            return Err(MonitorError::invalid("audio.output_rate", "must be positive"));
        }
        if !self.audio.silence_threshold_db.is_finite() || self.audio.silence_threshold_db > 0.0 {
            return Err(MonitorError::invalid(
                "audio.silence_threshold_db",
                "must be a finite level no greater than 0 dB",
            ));
        }
        if self.audio.silence_duration_secs == 0 {
            return Err(MonitorError::invalid(
                "audio.silence_duration_secs",
                "must be at least one second",
            ));
        }
        if self.timing.level_chunk_bytes == 0 || self.timing.level_chunk_bytes % 2 != 0 {
            return Err(MonitorError::invalid(
                "timing.level_chunk_bytes",
                "must be a positive, even number of bytes",
            ));
        }
        if self.timing.audio_read_bytes == 0 {
            return Err(MonitorError::invalid("timing.audio_read_bytes", "must be positive"));
        }
        if self.timing.evaluate_interval_ms == 0 {
            return Err(MonitorError::invalid(
                "timing.evaluate_interval_ms",
                "must be positive",
            ));
        }
        if self.timing.watchdog_period_secs == 0 {
            return Err(MonitorError::invalid(
                "timing.watchdog_period_secs",
                "must be positive",
            ));
        }
        if self.alerts.command.first().is_some_and(|c| c.is_empty()) {
            return Err(MonitorError::invalid("alerts.command", "program name is empty"));
        }
        Ok(())
    }

    /// Minimum sub-threshold duration before an alert
    pub fn silence_duration(&self) -> Duration {
        Duration::from_secs(self.audio.silence_duration_secs)
    }

    /// Minimum spacing between dispatched alerts
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.alerts.cooldown_minutes.saturating_mul(60))
    }

    pub(crate) fn evaluate_interval(&self) -> Duration {
        Duration::from_millis(self.timing.evaluate_interval_ms)
    }

    pub(crate) fn watchdog_period(&self) -> Duration {
        Duration::from_secs(self.timing.watchdog_period_secs)
    }

    pub(crate) fn history_interval(&self) -> Duration {
        Duration::from_secs(self.timing.history_interval_secs)
    }

    pub(crate) fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.timing.restart_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = MonitorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.timing.level_chunk_bytes, 4096);
        assert_eq!(cfg.timing.history_interval_secs, 5);
        assert_eq!(cfg.timing.watchdog_period_secs, 10);
        assert!(cfg.services.level_analysis);
        assert!(!cfg.services.metadata_reader);
        assert_eq!(cfg.cooldown(), Duration::from_secs(1800));
        assert_eq!(cfg.pipeline.capture_program, "rtl_fm");
    }

    #[test]
    fn test_partial_toml() {
        let cfg = MonitorConfig::from_toml_str(
            r#"
            [radio]
            frequency = "101.1M"
            gain = 19.7

            [alerts]
            cooldown_minutes = 5
            command = ["/usr/local/bin/page-operator", "--urgent"]

            [services]
            metadata_reader = true
            "#,
        )
        .expect("parse");

        assert_eq!(cfg.radio.frequency, "101.1M");
        assert_eq!(cfg.radio.ppm_error, 0);
        assert_eq!(cfg.cooldown(), Duration::from_secs(300));
        assert_eq!(cfg.alerts.command.len(), 2);
        assert!(cfg.services.metadata_reader);
        assert!(cfg.services.audio_relay);
        assert_eq!(cfg.audio, AudioConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        let err = MonitorConfig::from_toml_str("radio = = 1").unwrap_err();
        assert!(matches!(err, MonitorError::ConfigParse(_)));
    }

    #[test]
    fn test_validation() {
        let mut cfg = MonitorConfig::default();
        cfg.audio.silence_threshold_db = 3.0;
        match cfg.validate() {
            Err(MonitorError::InvalidConfig { key, .. }) => {
                assert_eq!(key, "audio.silence_threshold_db")
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut cfg = MonitorConfig::default();
        cfg.timing.level_chunk_bytes = 4095;
        assert!(cfg.validate().is_err());

        let mut cfg = MonitorConfig::default();
        cfg.radio.frequency = "  ".to_owned();
        assert!(cfg.validate().is_err());

        let mut cfg = MonitorConfig::default();
        cfg.audio.silence_duration_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[audio]\nsilence_threshold_db = -35.0").expect("write");
        let cfg = MonitorConfig::load(file.path()).expect("load");
        assert_eq!(cfg.audio.silence_threshold_db, -35.0);

        let missing = MonitorConfig::load(Path::new("/nonexistent/fmwatch.toml"));
        assert!(matches!(missing, Err(MonitorError::Io(_))));
    }
}
