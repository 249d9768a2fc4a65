//! LED power calibration: find the power setting that produces a target
//! frame intensity.
//!
//! Runs before a session, never during one. Frame intensity is assumed to
//! increase monotonically with LED power, so a bounded binary search over
//! the 0–100 range converges in at most seven probes.

use std::sync::Arc;

use serde::Serialize;

use crate::capture::FrameCaptureService;
use crate::data::{LedKind, LedSelection};
use crate::error::CaptureResult;

/// Parameters of one calibration run.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationConfig {
    /// Mean pixel intensity to aim for.
    pub target_intensity: f64,
    /// Acceptable relative deviation from the target (0.05 = 5 %).
    pub tolerance: f64,
    /// Upper bound on probe captures.
    pub max_iterations: u32,
    /// Centered region of the frame measured, as a fraction per dimension.
    pub roi_fraction: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target_intensity: 2000.0,
            tolerance: 0.05,
            max_iterations: 8,
            roi_fraction: 0.5,
        }
    }
}

/// Outcome of a calibration run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CalibrationResult {
    /// The LED that was calibrated.
    pub led: LedKind,
    /// Best power found, percent.
    pub power: u8,
    /// Intensity measured at that power.
    pub achieved_intensity: f64,
    /// Intensity that was aimed for.
    pub target_intensity: f64,
    /// Probe captures performed.
    pub iterations: u32,
    /// Whether the result landed within tolerance.
    pub converged: bool,
}

/// Calibrates LED power against measured frame intensity.
pub struct CalibrationService {
    capture: Arc<FrameCaptureService>,
    config: CalibrationConfig,
}

impl CalibrationService {
    /// Create a service probing through `capture`.
    pub fn new(capture: Arc<FrameCaptureService>, config: CalibrationConfig) -> Self {
        Self { capture, config }
    }

    /// Search for the power that hits the target intensity under `led`.
    ///
    /// Returns the closest power found even without convergence; LEDs are
    /// turned off afterwards either way.
    pub async fn calibrate(&self, led: LedKind) -> CaptureResult<CalibrationResult> {
        let selection = match led {
            LedKind::Ir => LedSelection::Ir,
            LedKind::White => LedSelection::White,
        };
        let target = self.config.target_intensity;
        let sync = self.capture.sync_client();

        let mut lo: u8 = 0;
        let mut hi: u8 = 100;
        let mut iterations = 0;
        let mut best: Option<(u8, f64)> = None;

        while lo <= hi && iterations < self.config.max_iterations {
            let power = lo + (hi - lo) / 2;
            sync.set_led_power(led, power).await?;

            let (frame, _) = self.capture.capture(selection, 0, None).await?;
            let measured = frame.mean_intensity_centered(self.config.roi_fraction);
            iterations += 1;

            tracing::debug!(led = %led, power, measured, target, "calibration probe");

            let better =
                best.map_or(true, |(_, b)| (measured - target).abs() < (b - target).abs());
            if better {
                best = Some((power, measured));
            }

            if (measured - target).abs() <= self.config.tolerance * target {
                break;
            }
            if measured < target {
                let Some(next) = power.checked_add(1) else { break };
                lo = next;
            } else {
                let Some(next) = power.checked_sub(1) else { break };
                hi = next;
            }
        }

        self.capture.leds_off().await?;

        let (power, achieved_intensity) = best.unwrap_or((0, 0.0));
        let converged = (achieved_intensity - target).abs() <= self.config.tolerance * target;
        let result = CalibrationResult {
            led,
            power,
            achieved_intensity,
            target_intensity: target,
            iterations,
            converged,
        };
        tracing::info!(
            led = %led,
            power = result.power,
            achieved = result.achieved_intensity,
            converged = result.converged,
            "calibration finished"
        );
        Ok(result)
    }
}
