//! Recording session configuration: structure, validation, and loading from
//! TOML files with environment-variable overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, CaptureResult};

fn default_duration_min() -> f64 {
    60.0
}
fn default_interval_sec() -> f64 {
    5.0
}
fn default_phase_min() -> f64 {
    30.0
}
fn default_true() -> bool {
    true
}
fn default_power() -> u8 {
    50
}
fn default_stabilization_ms() -> u16 {
    1000
}
fn default_trigger_latency_ms() -> u16 {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_telemetry_refresh() -> Duration {
    Duration::from_secs(60)
}
fn default_label() -> String {
    "session".to_string()
}

/// Configuration for one recording session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingConfig {
    /// Session identifier used in logs and metadata.
    #[serde(default = "default_label")]
    pub output_label: String,

    /// Total session length in minutes.
    #[serde(default = "default_duration_min")]
    pub duration_min: f64,

    /// Seconds between scheduled frames.
    #[serde(default = "default_interval_sec")]
    pub interval_sec: f64,

    /// Enable light/dark cycling. When false the session runs continuously
    /// under IR illumination.
    #[serde(default)]
    pub phase_enabled: bool,

    /// Length of the light phase in minutes.
    #[serde(default = "default_phase_min")]
    pub light_duration_min: f64,

    /// Length of the dark phase in minutes.
    #[serde(default = "default_phase_min")]
    pub dark_duration_min: f64,

    /// Whether cycle 1 opens with the light phase.
    #[serde(default = "default_true")]
    pub start_with_light: bool,

    /// Drive both LEDs during light phases instead of white only.
    #[serde(default)]
    pub dual_light_phase: bool,

    /// IR power during dark phases, percent.
    #[serde(default = "default_power")]
    pub dark_phase_ir_power: u8,

    /// IR power during light phases (dual mode only), percent.
    #[serde(default = "default_power")]
    pub light_phase_ir_power: u8,

    /// White power during light phases, percent.
    #[serde(default = "default_power")]
    pub light_phase_white_power: u8,

    /// IR power in continuous mode, percent.
    #[serde(default = "default_power")]
    pub ir_led_power: u8,

    /// White power in continuous mode, percent.
    #[serde(default = "default_power")]
    pub white_led_power: u8,

    /// LED stabilization window before the camera may trigger, milliseconds.
    #[serde(default = "default_stabilization_ms")]
    pub stabilization_ms: u16,

    /// Camera trigger latency added to the firmware's stabilization window
    /// so the LED-on period covers the real trigger-to-exposure delay.
    #[serde(default = "default_trigger_latency_ms")]
    pub camera_trigger_latency_ms: u16,

    /// Capture attempts per scheduled frame before giving up on the slot.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum age of cached LED telemetry before a fresh pulse is forced.
    #[serde(default = "default_telemetry_refresh", with = "humantime_serde")]
    pub telemetry_refresh: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_label: default_label(),
            duration_min: default_duration_min(),
            interval_sec: default_interval_sec(),
            phase_enabled: false,
            light_duration_min: default_phase_min(),
            dark_duration_min: default_phase_min(),
            start_with_light: true,
            dual_light_phase: false,
            dark_phase_ir_power: default_power(),
            light_phase_ir_power: default_power(),
            light_phase_white_power: default_power(),
            ir_led_power: default_power(),
            white_led_power: default_power(),
            stabilization_ms: default_stabilization_ms(),
            camera_trigger_latency_ms: default_trigger_latency_ms(),
            max_retries: default_max_retries(),
            telemetry_refresh: default_telemetry_refresh(),
        }
    }
}

impl RecordingConfig {
    /// Load configuration from a TOML file, letting `TIMELAPSE_`-prefixed
    /// environment variables override individual fields.
    pub fn load(path: &Path) -> CaptureResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("TIMELAPSE"))
            .build()?;
        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check all invariants, naming the offending field on failure.
    pub fn validate(&self) -> CaptureResult<()> {
        fn bad(field: &'static str, message: impl Into<String>) -> CaptureError {
            CaptureError::Configuration {
                field,
                message: message.into(),
            }
        }

        if self.duration_min <= 0.0 {
            return Err(bad("duration_min", "must be positive"));
        }
        if self.interval_sec <= 0.0 {
            return Err(bad("interval_sec", "must be positive"));
        }
        if self.phase_enabled {
            if self.light_duration_min <= 0.0 {
                return Err(bad("light_duration_min", "must be positive"));
            }
            if self.dark_duration_min <= 0.0 {
                return Err(bad("dark_duration_min", "must be positive"));
            }
        }
        for (field, value) in [
            ("dark_phase_ir_power", self.dark_phase_ir_power),
            ("light_phase_ir_power", self.light_phase_ir_power),
            ("light_phase_white_power", self.light_phase_white_power),
            ("ir_led_power", self.ir_led_power),
            ("white_led_power", self.white_led_power),
        ] {
            if value > 100 {
                return Err(bad(field, format!("{value} exceeds 100%")));
            }
        }
        if self.total_frames() == 0 {
            return Err(bad(
                "interval_sec",
                "interval longer than the whole session, no frames would be captured",
            ));
        }
        Ok(())
    }

    /// Number of frames the session will schedule.
    ///
    /// Deliberately `floor` with no `+1`: the final schedule slot lands
    /// strictly inside the session, which keeps light and dark phases
    /// symmetric in frame count.
    pub fn total_frames(&self) -> u64 {
        (self.duration_min * 60.0 / self.interval_sec).floor() as u64
    }

    /// Frame interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        RecordingConfig::default().validate().unwrap();
    }

    #[test]
    fn total_frames_has_no_fencepost() {
        let cfg = RecordingConfig {
            duration_min: 1.0,
            interval_sec: 5.0,
            ..RecordingConfig::default()
        };
        assert_eq!(cfg.total_frames(), 12);

        let cfg = RecordingConfig {
            duration_min: 1.0,
            interval_sec: 7.0,
            ..RecordingConfig::default()
        };
        assert_eq!(cfg.total_frames(), 8);
    }

    #[test]
    fn rejects_nonpositive_interval() {
        let cfg = RecordingConfig {
            interval_sec: 0.0,
            ..RecordingConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("interval_sec"));
    }

    #[test]
    fn rejects_power_above_100() {
        let cfg = RecordingConfig {
            dark_phase_ir_power: 130,
            ..RecordingConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("dark_phase_ir_power"));
    }

    #[test]
    fn phase_durations_checked_only_when_enabled() {
        let cfg = RecordingConfig {
            phase_enabled: false,
            light_duration_min: 0.0,
            ..RecordingConfig::default()
        };
        cfg.validate().unwrap();

        let cfg = RecordingConfig {
            phase_enabled: true,
            light_duration_min: 0.0,
            ..RecordingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            output_label = "nematostella-a"
            duration_min = 720.0
            interval_sec = 10.0
            phase_enabled = true
            light_duration_min = 60.0
            dark_duration_min = 60.0
            dark_phase_ir_power = 80
            telemetry_refresh = "90s"
            "#
        )
        .unwrap();

        let cfg = RecordingConfig::load(file.path()).unwrap();
        assert_eq!(cfg.output_label, "nematostella-a");
        assert_eq!(cfg.total_frames(), 4320);
        assert_eq!(cfg.dark_phase_ir_power, 80);
        assert_eq!(cfg.telemetry_refresh, Duration::from_secs(90));
        // Unspecified fields fall back to defaults.
        assert_eq!(cfg.max_retries, 3);
    }
}
