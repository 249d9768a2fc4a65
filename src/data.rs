//! Core data types shared across the capture engine: frames, LED
//! selections, sensor readings, and per-frame metadata.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::PhaseType;

/// Which physical LED is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedKind {
    /// Infrared illumination (dark-phase imaging).
    Ir,
    /// White illumination (light-phase imaging).
    White,
}

impl LedKind {
    /// Wire identifier used by the controller firmware (0 = IR, 1 = White).
    pub fn wire_id(self) -> u8 {
        match self {
            LedKind::Ir => 0,
            LedKind::White => 1,
        }
    }

    /// Inverse of [`wire_id`](Self::wire_id).
    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(LedKind::Ir),
            1 => Some(LedKind::White),
            _ => None,
        }
    }
}

impl std::fmt::Display for LedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedKind::Ir => write!(f, "ir"),
            LedKind::White => write!(f, "white"),
        }
    }
}

/// The illumination to use for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedSelection {
    /// IR only.
    Ir,
    /// White only.
    White,
    /// Both LEDs simultaneously.
    Dual,
}

impl LedSelection {
    /// The LEDs that are active under this selection.
    pub fn active_leds(self) -> &'static [LedKind] {
        match self {
            LedSelection::Ir => &[LedKind::Ir],
            LedSelection::White => &[LedKind::White],
            LedSelection::Dual => &[LedKind::Ir, LedKind::White],
        }
    }
}

impl std::fmt::Display for LedSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedSelection::Ir => write!(f, "ir"),
            LedSelection::White => write!(f, "white"),
            LedSelection::Dual => write!(f, "dual"),
        }
    }
}

/// A single captured image.
///
/// Pixel data is shared behind an `Arc` so frames can be handed to a sink and
/// inspected by calibration without copies.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row-major pixel data, one `u16` per pixel.
    pub data: Arc<Vec<u16>>,
    /// Wall-clock time the frame was delivered by the camera.
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Mean pixel intensity over the whole frame.
    pub fn mean_intensity(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&p| u64::from(p)).sum();
        sum as f64 / self.data.len() as f64
    }

    /// Mean intensity over a centered square region covering `fraction` of
    /// each dimension. Used by calibration to ignore vignetted borders.
    pub fn mean_intensity_centered(&self, fraction: f64) -> f64 {
        let fraction = fraction.clamp(0.01, 1.0);
        let rw = ((f64::from(self.width) * fraction) as u32).max(1);
        let rh = ((f64::from(self.height) * fraction) as u32).max(1);
        let x0 = (self.width - rw) / 2;
        let y0 = (self.height - rh) / 2;

        let mut sum: u64 = 0;
        let mut count: u64 = 0;
        for y in y0..y0 + rh {
            let row = (y * self.width) as usize;
            for x in x0..x0 + rw {
                if let Some(&p) = self.data.get(row + x as usize) {
                    sum += u64::from(p);
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }
}

/// Environmental telemetry reported by the controller alongside a sync pulse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Temperature in degrees Celsius, calibration offset applied.
    pub temperature_c: f64,
    /// Relative humidity in percent.
    pub humidity_pct: f64,
    /// False when the raw temperature fell outside the sensor's plausible
    /// range and a substitute value was used.
    pub temperature_valid: bool,
    /// False when the raw humidity was clamped into range.
    pub humidity_valid: bool,
}

/// Everything recorded about one frame besides its pixels.
#[derive(Debug, Clone, Serialize)]
pub struct FrameMetadata {
    /// Zero-based scheduled frame index.
    pub frame_index: u64,
    /// Wall-clock time the capture attempt started.
    pub capture_start: DateTime<Utc>,
    /// Wall-clock time the frame was in hand.
    pub capture_complete: DateTime<Utc>,
    /// Illumination used for this frame.
    pub led: LedSelection,
    /// True when this frame required a different LED setup than the previous.
    pub led_config_changed: bool,
    /// True when a still-live LED pulse was reused instead of starting fresh.
    pub led_was_reused: bool,
    /// Stabilization actually waited, in milliseconds (0 on reuse).
    pub stabilization_waited_ms: u64,
    /// Camera exposure used, in milliseconds.
    pub exposure_ms: f64,
    /// Margin between trigger and the LED-off deadline, in milliseconds.
    pub margin_ms: i64,
    /// Whether the LED was still on when the capture completed.
    pub led_was_on_during_capture: bool,
    /// False when the sync-complete frame never arrived, leaving exposure
    /// quality unverified.
    pub sync_verified: bool,
    /// LED-on duration reported by the firmware, milliseconds.
    pub firmware_timing_ms: Option<u16>,
    /// Environmental telemetry from the sync-complete frame, when fresh.
    pub sensors: Option<SensorReading>,
    /// How many attempts this frame took (1 = first try).
    pub attempts: u32,
    /// Active phase, when phase cycling is enabled.
    pub phase: Option<PhaseType>,
    /// Cycle number of the active phase.
    pub cycle: Option<u32>,
}

impl FrameMetadata {
    /// Flatten into a JSON object for sinks that persist key/value metadata.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(w: u32, h: u32, value: u16) -> Frame {
        Frame {
            width: w,
            height: h,
            data: Arc::new(vec![value; (w * h) as usize]),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn mean_intensity_of_solid_frame() {
        let f = solid_frame(64, 48, 1200);
        assert!((f.mean_intensity() - 1200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn centered_roi_ignores_border() {
        // Bright center, dark border.
        let (w, h) = (100u32, 100u32);
        let mut data = vec![0u16; (w * h) as usize];
        for y in 25..75 {
            for x in 25..75 {
                data[(y * w + x) as usize] = 4000;
            }
        }
        let f = Frame {
            width: w,
            height: h,
            data: Arc::new(data),
            timestamp: Utc::now(),
        };
        // Whole-frame mean is diluted; a 40% centered ROI sits fully in the
        // bright region.
        assert!(f.mean_intensity() < 1500.0);
        assert!((f.mean_intensity_centered(0.4) - 4000.0).abs() < 1.0);
    }

    #[test]
    fn led_wire_ids_round_trip() {
        for kind in [LedKind::Ir, LedKind::White] {
            assert_eq!(LedKind::from_wire_id(kind.wire_id()), Some(kind));
        }
        assert_eq!(LedKind::from_wire_id(7), None);
    }

    #[test]
    fn dual_selection_activates_both() {
        assert_eq!(
            LedSelection::Dual.active_leds(),
            &[LedKind::Ir, LedKind::White]
        );
    }
}
