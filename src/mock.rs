//! Mock collaborators: a camera, a frame sink, and a firmware endpoint that
//! speaks the controller's wire protocol over a duplex stream.
//!
//! Used by the test suite and for running the engine on a bench with no
//! hardware attached.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::capabilities::{Camera, FrameSink};
use crate::data::{Frame, FrameMetadata, LedKind, LedSelection};
use crate::error::{CaptureError, CaptureResult};
use crate::protocol::{
    encode_sync_complete, SyncExtension, CMD_GET_LED_STATUS, CMD_LED_DUAL_OFF, CMD_LED_OFF,
    CMD_LED_ON, CMD_SELECT_LED_IR, CMD_SELECT_LED_WHITE, CMD_SET_IR_POWER, CMD_SET_TIMING,
    CMD_SET_WHITE_POWER, CMD_STATUS, CMD_SYNC_CAPTURE, CMD_SYNC_CAPTURE_DUAL, RESP_LED_IR_SELECTED,
    RESP_LED_ON_ACK, RESP_LED_STATUS, RESP_LED_WHITE_SELECTED, RESP_TIMING_SET,
};

/// A camera that synthesizes flat frames with a little noise.
pub struct MockCamera {
    width: u32,
    height: u32,
    exposure_ms: StdMutex<f64>,
    intensity: AtomicU32,
    capture_delay: StdMutex<Duration>,
    fail_remaining: AtomicU32,
    calls: AtomicU32,
}

impl MockCamera {
    /// Create a camera producing `width`×`height` frames at the given
    /// exposure.
    pub fn new(width: u32, height: u32, exposure_ms: f64) -> Self {
        Self {
            width,
            height,
            exposure_ms: StdMutex::new(exposure_ms),
            intensity: AtomicU32::new(1000),
            capture_delay: StdMutex::new(Duration::ZERO),
            fail_remaining: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` capture attempts.
    pub fn fail_captures(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// How often `capture_frame` was called, failures included.
    pub fn capture_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Set the base pixel intensity of synthesized frames.
    pub fn set_intensity(&self, value: u16) {
        self.intensity.store(u32::from(value), Ordering::SeqCst);
    }

    /// Add a fixed latency to each capture.
    pub fn set_capture_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.capture_delay.lock() {
            *guard = delay;
        }
    }

    /// Change the reported exposure.
    pub fn set_exposure_ms(&self, exposure_ms: f64) {
        if let Ok(mut guard) = self.exposure_ms.lock() {
            *guard = exposure_ms;
        }
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn capture_frame(&self) -> CaptureResult<Option<Frame>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CaptureError::Camera("simulated capture failure".into()));
        }

        let delay = self.capture_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let base = self.intensity.load(Ordering::SeqCst).min(u32::from(u16::MAX)) as u16;
        let mut rng = rand::thread_rng();
        let data: Vec<u16> = (0..self.width * self.height)
            .map(|_| base.saturating_add(rng.gen_range(0..8)))
            .collect();

        Ok(Some(Frame {
            width: self.width,
            height: self.height,
            data: Arc::new(data),
            timestamp: Utc::now(),
        }))
    }

    async fn exposure_ms(&self) -> CaptureResult<f64> {
        Ok(self.exposure_ms.lock().map(|e| *e).unwrap_or(10.0))
    }
}

/// A sink recording which frames were saved.
#[derive(Default)]
pub struct MockSink {
    saved: StdMutex<Vec<(u64, LedSelection)>>,
    fail_remaining: AtomicU32,
    reject_remaining: AtomicU32,
    flushed: AtomicBool,
}

impl MockSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` saves with a persistence error.
    pub fn fail_saves(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` saves with `Ok(false)`.
    pub fn reject_saves(&self, n: u32) {
        self.reject_remaining.store(n, Ordering::SeqCst);
    }

    /// Indices of successfully saved frames, in save order.
    pub fn saved_frames(&self) -> Vec<u64> {
        self.saved
            .lock()
            .map(|s| s.iter().map(|(idx, _)| *idx).collect())
            .unwrap_or_default()
    }

    /// Saved frames with the illumination each was captured under.
    pub fn saved_leds(&self) -> Vec<(u64, LedSelection)> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Whether `flush` has been called.
    pub fn flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSink for MockSink {
    async fn save_frame(&self, _frame: &Frame, metadata: &FrameMetadata) -> CaptureResult<bool> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CaptureError::Persistence("simulated save failure".into()));
        }
        if self
            .reject_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }
        if let Ok(mut saved) = self.saved.lock() {
            saved.push((metadata.frame_index, metadata.led));
        }
        Ok(true)
    }

    async fn flush(&self) -> CaptureResult<()> {
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Observable state of the mock firmware.
#[derive(Debug, Clone, Default)]
pub struct FirmwareState {
    /// Sync pulses started (single + dual).
    pub pulses: u32,
    /// Of those, dual-LED pulses.
    pub dual_pulses: u32,
    /// Currently selected LED.
    pub selected: Option<LedKind>,
    /// Last programmed (stabilization_ms, exposure_ms).
    pub timing: Option<(u16, u16)>,
    /// Last programmed IR power.
    pub ir_power: Option<u8>,
    /// Last programmed white power.
    pub white_power: Option<u8>,
    /// How often both LEDs were turned off.
    pub dual_off_count: u32,
    /// Illumination of the most recent pulse.
    pub lit: Option<LedSelection>,
    /// When that pulse's LED window ends.
    pub led_off_at: Option<Instant>,
}

impl FirmwareState {
    /// Illumination currently on, `None` once the pulse window has lapsed
    /// or both LEDs were commanded off.
    pub fn lit_now(&self) -> Option<LedSelection> {
        let off_at = self.led_off_at?;
        (Instant::now() < off_at).then_some(self.lit).flatten()
    }
}

/// Running mock firmware; dropping the handle shuts it down.
pub struct FirmwareHandle {
    state: Arc<StdMutex<FirmwareState>>,
    task: JoinHandle<()>,
}

impl FirmwareHandle {
    /// Snapshot of the firmware's observable state.
    pub fn state(&self) -> FirmwareState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Drop for FirmwareHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Behavior knobs for the mock firmware endpoint.
#[derive(Debug, Clone)]
pub struct MockFirmware {
    /// Delay before the LED-on acknowledgement.
    pub ack_delay: Duration,
    /// Never send the sync-complete frame.
    pub drop_sync_complete: bool,
    /// Reported ambient temperature, degrees Celsius.
    pub temperature_c: f64,
    /// Reported relative humidity, percent.
    pub humidity_pct: f64,
    /// Emit the 15-byte extended sync-complete frame.
    pub extended: bool,
}

impl Default for MockFirmware {
    fn default() -> Self {
        Self {
            ack_delay: Duration::ZERO,
            drop_sync_complete: false,
            temperature_c: 23.4,
            humidity_pct: 55.2,
            extended: false,
        }
    }
}

impl MockFirmware {
    /// Run the endpoint on `io` until the stream closes.
    pub fn spawn(self, io: DuplexStream) -> FirmwareHandle {
        let state = Arc::new(StdMutex::new(FirmwareState::default()));
        let task = tokio::spawn(self.run(io, Arc::clone(&state)));
        FirmwareHandle { state, task }
    }

    async fn run(self, mut io: DuplexStream, state: Arc<StdMutex<FirmwareState>>) {
        let mut cmd = [0u8; 1];
        loop {
            if io.read_exact(&mut cmd).await.is_err() {
                break;
            }
            let ok = match cmd[0] {
                CMD_SELECT_LED_IR => {
                    Self::with_state(&state, |s| s.selected = Some(LedKind::Ir));
                    io.write_all(&[RESP_LED_IR_SELECTED]).await.is_ok()
                }
                CMD_SELECT_LED_WHITE => {
                    Self::with_state(&state, |s| s.selected = Some(LedKind::White));
                    io.write_all(&[RESP_LED_WHITE_SELECTED]).await.is_ok()
                }
                CMD_SYNC_CAPTURE | CMD_SYNC_CAPTURE_DUAL => {
                    self.handle_pulse(cmd[0], &mut io, &state).await
                }
                CMD_SET_TIMING => {
                    let mut payload = [0u8; 4];
                    if io.read_exact(&mut payload).await.is_err() {
                        break;
                    }
                    let stab = u16::from_be_bytes([payload[0], payload[1]]);
                    let exp = u16::from_be_bytes([payload[2], payload[3]]);
                    Self::with_state(&state, |s| s.timing = Some((stab, exp)));
                    io.write_all(&[RESP_TIMING_SET]).await.is_ok()
                }
                CMD_SET_IR_POWER => {
                    let mut p = [0u8; 1];
                    if io.read_exact(&mut p).await.is_err() {
                        break;
                    }
                    Self::with_state(&state, |s| s.ir_power = Some(p[0]));
                    true
                }
                CMD_SET_WHITE_POWER => {
                    let mut p = [0u8; 1];
                    if io.read_exact(&mut p).await.is_err() {
                        break;
                    }
                    Self::with_state(&state, |s| s.white_power = Some(p[0]));
                    true
                }
                CMD_LED_DUAL_OFF => {
                    Self::with_state(&state, |s| {
                        s.dual_off_count += 1;
                        s.lit = None;
                        s.led_off_at = None;
                    });
                    true
                }
                CMD_GET_LED_STATUS => {
                    let snap = state.lock().map(|s| s.clone()).unwrap_or_default();
                    let lit = snap.lit_now();
                    let on =
                        |kind| u8::from(lit.is_some_and(|sel| sel.active_leds().contains(&kind)));
                    let frame = [
                        RESP_LED_STATUS,
                        snap.selected.map_or(0, LedKind::wire_id),
                        on(LedKind::Ir),
                        on(LedKind::White),
                        snap.ir_power.unwrap_or(0),
                        snap.white_power.unwrap_or(0),
                    ];
                    io.write_all(&frame).await.is_ok()
                }
                CMD_LED_ON | CMD_LED_OFF | CMD_STATUS => true,
                _ => true, // unknown bytes are ignored, like real firmware
            };
            if !ok {
                break;
            }
        }
    }

    async fn handle_pulse(
        &self,
        cmd: u8,
        io: &mut DuplexStream,
        state: &Arc<StdMutex<FirmwareState>>,
    ) -> bool {
        if !self.ack_delay.is_zero() {
            sleep(self.ack_delay).await;
        }
        if io.write_all(&[RESP_LED_ON_ACK]).await.is_err() {
            return false;
        }

        let dual = cmd == CMD_SYNC_CAPTURE_DUAL;
        let timing = state
            .lock()
            .ok()
            .and_then(|s| s.timing)
            .map_or(1510, |(stab, exp)| stab.saturating_add(exp));
        Self::with_state(state, |s| {
            s.pulses += 1;
            if dual {
                s.dual_pulses += 1;
            }
            s.lit = Some(if dual {
                LedSelection::Dual
            } else if s.selected == Some(LedKind::White) {
                LedSelection::White
            } else {
                LedSelection::Ir
            });
            s.led_off_at = Some(Instant::now() + Duration::from_millis(u64::from(timing)));
        });

        if self.drop_sync_complete {
            return true;
        }
        let extension = self.extended.then(|| {
            let snap = state.lock().map(|s| s.clone()).unwrap_or_default();
            SyncExtension {
                led_type: snap.selected,
                led_duration_ms: timing,
                led_power_actual: snap.ir_power.or(snap.white_power).unwrap_or(0),
            }
        });
        io.write_all(&encode_sync_complete(
            timing,
            self.temperature_c,
            self.humidity_pct,
            extension,
        ))
        .await
        .is_ok()
    }

    fn with_state(state: &Arc<StdMutex<FirmwareState>>, f: impl FnOnce(&mut FirmwareState)) {
        if let Ok(mut guard) = state.lock() {
            f(&mut guard);
        }
    }
}
