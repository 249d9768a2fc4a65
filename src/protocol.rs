//! Binary wire protocol for the LED controller firmware.
//!
//! Pure encode/decode: no I/O, no timing. Commands are single bytes with
//! optional payloads; multi-byte values are big-endian. Telemetry travels as
//! fixed-point tenths (i16 for temperature, u16 for humidity), so the frames
//! are byte-order safe with no float representation on the wire.
//!
//! Command flow for one synchronized capture:
//! 1. `SELECT_LED_IR`/`SELECT_LED_WHITE` (single-LED mode only)
//! 2. `SYNC_CAPTURE` or `SYNC_CAPTURE_DUAL` — firmware turns the LED(s) on
//!    and answers `LED_ON_ACK` (0xAA)
//! 3. firmware holds the LED for stabilization + exposure, turns it off, and
//!    emits the `SYNC_COMPLETE` frame with timing and telemetry

use crate::data::{LedKind, LedSelection, SensorReading};
use crate::error::{CaptureError, CaptureResult};

/// Turn the selected LED off.
pub const CMD_LED_OFF: u8 = 0x00;
/// Turn the selected LED on.
pub const CMD_LED_ON: u8 = 0x01;
/// Query on/off status.
pub const CMD_STATUS: u8 = 0x02;
/// Start a synchronized capture pulse on the selected LED.
pub const CMD_SYNC_CAPTURE: u8 = 0x0C;
/// Program stabilization and exposure windows.
pub const CMD_SET_TIMING: u8 = 0x11;
/// Select the IR LED.
pub const CMD_SELECT_LED_IR: u8 = 0x20;
/// Select the white LED.
pub const CMD_SELECT_LED_WHITE: u8 = 0x21;
/// Turn both LEDs off.
pub const CMD_LED_DUAL_OFF: u8 = 0x22;
/// Query full LED status.
pub const CMD_GET_LED_STATUS: u8 = 0x23;
/// Set IR LED power.
pub const CMD_SET_IR_POWER: u8 = 0x24;
/// Set white LED power.
pub const CMD_SET_WHITE_POWER: u8 = 0x25;
/// Start a synchronized capture pulse on both LEDs.
pub const CMD_SYNC_CAPTURE_DUAL: u8 = 0x2C;

/// LEDs are on, the camera may trigger.
pub const RESP_LED_ON_ACK: u8 = 0xAA;
/// Header of the sync-complete frame.
pub const RESP_SYNC_COMPLETE: u8 = 0x1B;
/// Timing accepted.
pub const RESP_TIMING_SET: u8 = 0x21;
/// IR LED selected.
pub const RESP_LED_IR_SELECTED: u8 = 0x30;
/// White LED selected.
pub const RESP_LED_WHITE_SELECTED: u8 = 0x31;
/// Header of the LED-status frame.
pub const RESP_LED_STATUS: u8 = 0x32;

/// Short sync-complete frame: header, timing, temperature, humidity.
pub const SYNC_COMPLETE_LEN: usize = 7;
/// Extended sync-complete frame: adds LED type, duration, power, reserved.
pub const SYNC_COMPLETE_EXT_LEN: usize = 15;
/// LED status frame length.
pub const LED_STATUS_LEN: usize = 6;

/// Sensor calibration: the controller's enclosure runs warm, readings are
/// offset by this amount after fixed-point conversion.
pub const TEMPERATURE_OFFSET_C: f64 = -2.0;

/// Substitute reported when the raw temperature is implausible.
const TEMPERATURE_FALLBACK_C: f64 = 25.0;
const TEMPERATURE_MIN_C: f64 = -40.0;
const TEMPERATURE_MAX_C: f64 = 85.0;

/// The command byte that starts a pulse for `sel`.
///
/// Single-LED selections assume the matching `SELECT_LED_*` command was sent
/// beforehand.
pub fn sync_capture_command(sel: LedSelection) -> u8 {
    match sel {
        LedSelection::Dual => CMD_SYNC_CAPTURE_DUAL,
        LedSelection::Ir | LedSelection::White => CMD_SYNC_CAPTURE,
    }
}

/// The command byte selecting `kind`, and the response byte confirming it.
pub fn select_command(kind: LedKind) -> (u8, u8) {
    match kind {
        LedKind::Ir => (CMD_SELECT_LED_IR, RESP_LED_IR_SELECTED),
        LedKind::White => (CMD_SELECT_LED_WHITE, RESP_LED_WHITE_SELECTED),
    }
}

/// Build a `SET_IR_POWER`/`SET_WHITE_POWER` command. Power is clamped to
/// 0–100.
pub fn set_power_command(kind: LedKind, percent: u8) -> [u8; 2] {
    let cmd = match kind {
        LedKind::Ir => CMD_SET_IR_POWER,
        LedKind::White => CMD_SET_WHITE_POWER,
    };
    [cmd, percent.min(100)]
}

/// Build a `SET_TIMING` command: stabilization and exposure as u16 BE.
///
/// Stabilization is clamped to 10–10000 ms, exposure to 0–30000 ms, matching
/// the firmware's accepted ranges.
pub fn set_timing_command(stabilization_ms: u16, exposure_ms: u16) -> [u8; 5] {
    let stab = stabilization_ms.clamp(10, 10_000).to_be_bytes();
    let exp = exposure_ms.min(30_000).to_be_bytes();
    [CMD_SET_TIMING, stab[0], stab[1], exp[0], exp[1]]
}

/// Extended fields of the 15-byte sync-complete frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncExtension {
    /// LED the firmware actually drove.
    pub led_type: Option<LedKind>,
    /// Total LED-on duration, milliseconds.
    pub led_duration_ms: u16,
    /// Power the firmware actually applied, percent.
    pub led_power_actual: u8,
}

/// A decoded sync-complete frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncReport {
    /// Firmware-measured pulse timing, milliseconds.
    pub timing_ms: u16,
    /// Environmental telemetry, calibration applied.
    pub sensors: SensorReading,
    /// Present only in the extended frame.
    pub extension: Option<SyncExtension>,
}

/// Convert raw fixed-point sensor values into a calibrated reading.
///
/// Out-of-range values are recoverable: the reading is flagged, logged, and
/// substituted (temperature) or clamped (humidity) rather than failing the
/// whole frame.
pub fn decode_sensors(temp_raw: i16, humidity_raw: u16) -> SensorReading {
    let temp = f64::from(temp_raw) / 10.0;
    let (temperature_c, temperature_valid) = if (TEMPERATURE_MIN_C..=TEMPERATURE_MAX_C).contains(&temp)
    {
        (temp + TEMPERATURE_OFFSET_C, true)
    } else {
        tracing::warn!(raw = temp_raw, "temperature out of sensor range, substituting nominal");
        (TEMPERATURE_FALLBACK_C, false)
    };

    let humidity = f64::from(humidity_raw) / 10.0;
    let (humidity_pct, humidity_valid) = if (0.0..=100.0).contains(&humidity) {
        (humidity, true)
    } else {
        tracing::warn!(raw = humidity_raw, "humidity out of range, clamping");
        (humidity.clamp(0.0, 100.0), false)
    };

    SensorReading {
        temperature_c,
        humidity_pct,
        temperature_valid,
        humidity_valid,
    }
}

/// Decode a sync-complete frame (7 or 15 bytes).
pub fn decode_sync_complete(data: &[u8]) -> CaptureResult<SyncReport> {
    if data.len() != SYNC_COMPLETE_LEN && data.len() != SYNC_COMPLETE_EXT_LEN {
        return Err(CaptureError::Protocol(format!(
            "sync-complete frame has {} bytes, expected {} or {}",
            data.len(),
            SYNC_COMPLETE_LEN,
            SYNC_COMPLETE_EXT_LEN
        )));
    }
    if data[0] != RESP_SYNC_COMPLETE {
        return Err(CaptureError::Protocol(format!(
            "bad sync-complete header 0x{:02X}",
            data[0]
        )));
    }

    let timing_ms = u16::from_be_bytes([data[1], data[2]]);
    let temp_raw = i16::from_be_bytes([data[3], data[4]]);
    let humidity_raw = u16::from_be_bytes([data[5], data[6]]);
    let sensors = decode_sensors(temp_raw, humidity_raw);

    let extension = if data.len() == SYNC_COMPLETE_EXT_LEN {
        Some(SyncExtension {
            led_type: LedKind::from_wire_id(data[7]),
            led_duration_ms: u16::from_be_bytes([data[8], data[9]]),
            led_power_actual: data[10],
        })
    } else {
        None
    };

    Ok(SyncReport {
        timing_ms,
        sensors,
        extension,
    })
}

/// Encode a sync-complete frame from physical values.
///
/// `temperature_c` is the calibrated value; the raw wire value has the
/// calibration offset removed again. Used by the mock firmware and tests.
pub fn encode_sync_complete(
    timing_ms: u16,
    temperature_c: f64,
    humidity_pct: f64,
    extension: Option<SyncExtension>,
) -> Vec<u8> {
    let temp_raw = (((temperature_c - TEMPERATURE_OFFSET_C) * 10.0).round() as i16).to_be_bytes();
    let hum_raw = ((humidity_pct * 10.0).round() as u16).to_be_bytes();
    let timing = timing_ms.to_be_bytes();

    let mut frame = vec![
        RESP_SYNC_COMPLETE,
        timing[0],
        timing[1],
        temp_raw[0],
        temp_raw[1],
        hum_raw[0],
        hum_raw[1],
    ];
    if let Some(ext) = extension {
        frame.push(ext.led_type.map_or(0xFF, LedKind::wire_id));
        frame.extend_from_slice(&ext.led_duration_ms.to_be_bytes());
        frame.push(ext.led_power_actual);
        frame.extend_from_slice(&[0, 0, 0, 0]);
    }
    frame
}

/// Decoded LED-status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedStatus {
    /// Currently selected LED.
    pub current: Option<LedKind>,
    /// IR LED on/off.
    pub ir_on: bool,
    /// White LED on/off.
    pub white_on: bool,
    /// IR power, percent.
    pub ir_power: u8,
    /// White power, percent.
    pub white_power: u8,
}

/// Decode a 6-byte LED-status frame.
pub fn decode_led_status(data: &[u8]) -> CaptureResult<LedStatus> {
    if data.len() != LED_STATUS_LEN {
        return Err(CaptureError::Protocol(format!(
            "LED status frame has {} bytes, expected {LED_STATUS_LEN}",
            data.len()
        )));
    }
    if data[0] != RESP_LED_STATUS {
        return Err(CaptureError::Protocol(format!(
            "bad LED status header 0x{:02X}",
            data[0]
        )));
    }
    Ok(LedStatus {
        current: LedKind::from_wire_id(data[1]),
        ir_on: data[2] == 1,
        white_on: data[3] == 1,
        ir_power: data[4],
        white_power: data[5],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_timing_encodes_big_endian() {
        assert_eq!(
            set_timing_command(1000, 500),
            [CMD_SET_TIMING, 0x03, 0xE8, 0x01, 0xF4]
        );
    }

    #[test]
    fn set_timing_clamps_to_firmware_range() {
        // Stabilization below 10ms and exposure above 30s are pulled in.
        assert_eq!(set_timing_command(0, 40_000), [CMD_SET_TIMING, 0x00, 0x0A, 0x75, 0x30]);
    }

    #[test]
    fn power_commands_clamp_percent() {
        assert_eq!(set_power_command(LedKind::Ir, 80), [CMD_SET_IR_POWER, 80]);
        assert_eq!(
            set_power_command(LedKind::White, 250),
            [CMD_SET_WHITE_POWER, 100]
        );
    }

    #[test]
    fn dual_selection_uses_dual_command() {
        assert_eq!(sync_capture_command(LedSelection::Dual), CMD_SYNC_CAPTURE_DUAL);
        assert_eq!(sync_capture_command(LedSelection::Ir), CMD_SYNC_CAPTURE);
        assert_eq!(sync_capture_command(LedSelection::White), CMD_SYNC_CAPTURE);
    }

    #[test]
    fn telemetry_survives_encode_decode_within_tenth() {
        let frame = encode_sync_complete(1520, 23.4, 55.2, None);
        assert_eq!(frame.len(), SYNC_COMPLETE_LEN);

        let report = decode_sync_complete(&frame).unwrap();
        assert_eq!(report.timing_ms, 1520);
        assert!((report.sensors.temperature_c - 23.4).abs() < 0.1);
        assert!((report.sensors.humidity_pct - 55.2).abs() < 0.1);
        assert!(report.sensors.temperature_valid);
        assert!(report.sensors.humidity_valid);
        assert!(report.extension.is_none());
    }

    #[test]
    fn negative_temperature_round_trips() {
        let frame = encode_sync_complete(100, -10.5, 30.0, None);
        let report = decode_sync_complete(&frame).unwrap();
        assert!((report.sensors.temperature_c - (-10.5)).abs() < 0.1);
    }

    #[test]
    fn extended_frame_carries_led_fields() {
        let ext = SyncExtension {
            led_type: Some(LedKind::White),
            led_duration_ms: 1710,
            led_power_actual: 60,
        };
        let frame = encode_sync_complete(1710, 22.0, 45.0, Some(ext));
        assert_eq!(frame.len(), SYNC_COMPLETE_EXT_LEN);

        let report = decode_sync_complete(&frame).unwrap();
        assert_eq!(report.extension, Some(ext));
    }

    #[test]
    fn out_of_range_temperature_is_flagged_not_fatal() {
        // Raw 0x7FFF is 3276.7 degrees, clearly a sensor glitch.
        let mut frame = encode_sync_complete(100, 20.0, 50.0, None);
        frame[3] = 0x7F;
        frame[4] = 0xFF;

        let report = decode_sync_complete(&frame).unwrap();
        assert!(!report.sensors.temperature_valid);
        assert!((report.sensors.temperature_c - 25.0).abs() < f64::EPSILON);
        assert!(report.sensors.humidity_valid);
    }

    #[test]
    fn out_of_range_humidity_is_clamped() {
        let mut frame = encode_sync_complete(100, 20.0, 50.0, None);
        // Raw 1200 = 120.0%.
        frame[5] = 0x04;
        frame[6] = 0xB0;

        let report = decode_sync_complete(&frame).unwrap();
        assert!(!report.sensors.humidity_valid);
        assert!((report.sensors.humidity_pct - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_wrong_header_and_length() {
        let mut frame = encode_sync_complete(100, 20.0, 50.0, None);
        frame[0] = 0x99;
        assert!(decode_sync_complete(&frame).is_err());
        assert!(decode_sync_complete(&[RESP_SYNC_COMPLETE, 0, 0]).is_err());
    }

    #[test]
    fn led_status_decodes() {
        let data = [RESP_LED_STATUS, 1, 0, 1, 40, 70];
        let status = decode_led_status(&data).unwrap();
        assert_eq!(status.current, Some(LedKind::White));
        assert!(!status.ir_on);
        assert!(status.white_on);
        assert_eq!(status.ir_power, 40);
        assert_eq!(status.white_power, 70);
    }
}
