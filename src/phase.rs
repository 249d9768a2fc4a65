//! Day/night phase computation.
//!
//! Phase is a pure function of the recording configuration and the session's
//! elapsed time (pauses excluded). There is no phase clock to drift and no
//! transition event to miss: two calls with the same inputs always agree, no
//! matter how irregularly the scheduler polls.

use serde::{Deserialize, Serialize};

use crate::config::RecordingConfig;
use crate::data::LedSelection;

/// Tolerance for landing exactly on a phase boundary, in minutes.
const BOUNDARY_EPS_MIN: f64 = 1e-9;

/// Light or dark half of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    /// Illuminated half of the cycle (white or dual illumination).
    Light,
    /// Dark half of the cycle (IR illumination only).
    Dark,
}

impl std::fmt::Display for PhaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseType::Light => write!(f, "light"),
            PhaseType::Dark => write!(f, "dark"),
        }
    }
}

/// Snapshot of the phase state at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseInfo {
    /// The active phase.
    pub phase: PhaseType,
    /// One-based cycle counter.
    pub cycle_number: u32,
    /// Total cycles the session will run, partial cycles counted.
    pub total_cycles: u32,
    /// Minutes spent inside the active phase.
    pub phase_elapsed_min: f64,
    /// Minutes left in the active phase.
    pub phase_remaining_min: f64,
    /// Illumination the active phase calls for.
    pub led: LedSelection,
}

/// Number of light/dark cycles the configured session spans.
///
/// Partial cycles count as a full cycle; a session shorter than one cycle
/// still counts as 1.
pub fn total_cycles(config: &RecordingConfig) -> u32 {
    let cycle_len = config.light_duration_min + config.dark_duration_min;
    if cycle_len <= 0.0 {
        return 1;
    }
    let cycles = (config.duration_min / cycle_len).ceil() as u32;
    cycles.max(1)
}

/// Resolve the phase at `elapsed_min` minutes into the session.
///
/// Returns `None` when phase cycling is disabled (continuous mode).
///
/// `prevent_transition` is set for the session's final frame: a poll landing
/// exactly on a phase boundary then resolves to the phase that was active
/// going into the boundary, so the last frame is never captured under a
/// freshly flipped illumination.
pub fn phase_at(
    config: &RecordingConfig,
    elapsed_min: f64,
    prevent_transition: bool,
) -> Option<PhaseInfo> {
    if !config.phase_enabled {
        return None;
    }

    let light = config.light_duration_min;
    let dark = config.dark_duration_min;
    let cycle_len = light + dark;
    let first_len = if config.start_with_light { light } else { dark };

    let elapsed_min = elapsed_min.max(0.0);
    let mut position = elapsed_min % cycle_len;
    let mut cycle_number = (elapsed_min / cycle_len).floor() as u32 + 1;

    // On the final frame, an exact boundary hit stays in the outgoing phase.
    let hold = prevent_transition && elapsed_min > BOUNDARY_EPS_MIN;
    if hold && position < BOUNDARY_EPS_MIN {
        position = cycle_len;
        cycle_number = cycle_number.saturating_sub(1).max(1);
    }

    let in_first = if hold {
        position <= first_len + BOUNDARY_EPS_MIN
    } else {
        position < first_len
    };

    let (phase, phase_elapsed, phase_len) = if in_first {
        let phase = if config.start_with_light {
            PhaseType::Light
        } else {
            PhaseType::Dark
        };
        (phase, position, first_len)
    } else {
        let phase = if config.start_with_light {
            PhaseType::Dark
        } else {
            PhaseType::Light
        };
        (phase, position - first_len, cycle_len - first_len)
    };

    let led = match phase {
        PhaseType::Dark => LedSelection::Ir,
        PhaseType::Light if config.dual_light_phase => LedSelection::Dual,
        PhaseType::Light => LedSelection::White,
    };

    Some(PhaseInfo {
        phase,
        cycle_number,
        total_cycles: total_cycles(config),
        phase_elapsed_min: phase_elapsed,
        phase_remaining_min: (phase_len - phase_elapsed).max(0.0),
        led,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(light: f64, dark: f64, duration: f64) -> RecordingConfig {
        RecordingConfig {
            phase_enabled: true,
            light_duration_min: light,
            dark_duration_min: dark,
            duration_min: duration,
            start_with_light: true,
            ..RecordingConfig::default()
        }
    }

    #[test]
    fn continuous_mode_has_no_phase() {
        let c = RecordingConfig {
            phase_enabled: false,
            ..RecordingConfig::default()
        };
        assert!(phase_at(&c, 10.0, false).is_none());
    }

    #[test]
    fn first_cycle_follows_start_phase() {
        let c = cfg(30.0, 30.0, 120.0);
        let info = phase_at(&c, 5.0, false).unwrap();
        assert_eq!(info.phase, PhaseType::Light);
        assert_eq!(info.cycle_number, 1);
        assert_eq!(info.led, LedSelection::White);
        assert!((info.phase_remaining_min - 25.0).abs() < 1e-6);

        let dark_start = RecordingConfig {
            start_with_light: false,
            ..cfg(30.0, 30.0, 120.0)
        };
        let info = phase_at(&dark_start, 5.0, false).unwrap();
        assert_eq!(info.phase, PhaseType::Dark);
        assert_eq!(info.led, LedSelection::Ir);
    }

    #[test]
    fn same_elapsed_always_resolves_identically() {
        let c = cfg(15.0, 45.0, 240.0);
        // Out-of-order polling must not matter.
        let probes = [200.0, 3.0, 61.0, 3.0, 200.0, 61.0];
        let mut seen = std::collections::HashMap::new();
        for &t in &probes {
            let info = phase_at(&c, t, false).unwrap();
            let prev = seen.insert(t.to_bits(), info);
            if let Some(prev) = prev {
                assert_eq!(prev, info);
            }
        }
    }

    #[test]
    fn transitions_at_phase_boundaries() {
        let c = cfg(30.0, 30.0, 120.0);
        assert_eq!(phase_at(&c, 29.9, false).unwrap().phase, PhaseType::Light);
        assert_eq!(phase_at(&c, 30.0, false).unwrap().phase, PhaseType::Dark);
        assert_eq!(phase_at(&c, 59.9, false).unwrap().phase, PhaseType::Dark);
        let next = phase_at(&c, 60.0, false).unwrap();
        assert_eq!(next.phase, PhaseType::Light);
        assert_eq!(next.cycle_number, 2);
    }

    #[test]
    fn final_frame_holds_outgoing_phase_at_boundary() {
        let c = cfg(30.0, 30.0, 60.0);
        // Exactly at the cycle boundary the outgoing phase is Dark, cycle 1.
        let held = phase_at(&c, 60.0, true).unwrap();
        assert_eq!(held.phase, PhaseType::Dark);
        assert_eq!(held.cycle_number, 1);
        // The light->dark boundary mid-cycle is held too.
        let held = phase_at(&c, 30.0, true).unwrap();
        assert_eq!(held.phase, PhaseType::Light);
    }

    #[test]
    fn final_frame_off_boundary_is_unaffected() {
        // 65 minutes into 30/30 cycling sits 5 minutes into cycle 2's light
        // phase; preventing transitions must not distort it.
        let c = cfg(30.0, 30.0, 65.0);
        let info = phase_at(&c, 65.0, true).unwrap();
        assert_eq!(info.phase, PhaseType::Light);
        assert_eq!(info.cycle_number, 2);
        assert_eq!(info, phase_at(&c, 65.0, false).unwrap());
    }

    #[test]
    fn dual_light_phase_selects_both_leds() {
        let c = RecordingConfig {
            dual_light_phase: true,
            ..cfg(30.0, 30.0, 120.0)
        };
        assert_eq!(phase_at(&c, 1.0, false).unwrap().led, LedSelection::Dual);
        assert_eq!(phase_at(&c, 31.0, false).unwrap().led, LedSelection::Ir);
    }

    #[test]
    fn partial_cycles_round_up() {
        assert_eq!(total_cycles(&cfg(30.0, 30.0, 61.0)), 2);
        assert_eq!(total_cycles(&cfg(30.0, 30.0, 60.0)), 1);
        assert_eq!(total_cycles(&cfg(30.0, 30.0, 120.5)), 3);
        // Shorter than one cycle still counts as one.
        assert_eq!(total_cycles(&cfg(30.0, 30.0, 5.0)), 1);
    }
}
