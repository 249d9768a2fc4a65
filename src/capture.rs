//! Single-frame capture: LED pulse, stabilization, margin guard, camera
//! trigger, telemetry, and the retry wrapper around all of it.
//!
//! The hard rule lives in step 3: the camera is only triggered while enough
//! of the LED-on window remains. A frame that would race the LED turning off
//! is aborted *before* the trigger, so compromised exposures are never
//! produced, only cleanly retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::capabilities::Camera;
use crate::config::RecordingConfig;
use crate::data::{Frame, FrameMetadata, LedSelection};
use crate::error::{CaptureError, CaptureResult};
use crate::phase::PhaseInfo;
use crate::protocol::SyncReport;
use crate::sync_client::LedSyncClient;

/// Timing policy for one capture.
#[derive(Debug, Clone, Copy)]
pub struct CaptureTiming {
    /// LED stabilization before the camera may trigger, milliseconds.
    pub stabilization_ms: u16,
    /// Extra LED-on time past the exposure end, milliseconds.
    pub safety_buffer_ms: u64,
    /// Minimum margin between trigger and LED-off, milliseconds.
    pub min_capture_margin_ms: u64,
    /// Fixed pause between capture attempts.
    pub retry_backoff: Duration,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            stabilization_ms: 1000,
            safety_buffer_ms: 500,
            min_capture_margin_ms: 100,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl CaptureTiming {
    /// Timing policy derived from a session configuration.
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            stabilization_ms: config.stabilization_ms,
            ..Self::default()
        }
    }
}

/// Captures frames under synchronized illumination.
pub struct FrameCaptureService {
    sync: Arc<LedSyncClient>,
    camera: Arc<dyn Camera>,
    timing: CaptureTiming,
    /// Telemetry from the most recent completed pulse, reported on reused
    /// pulses where no fresh sync-complete frame arrives.
    last_report: Mutex<Option<SyncReport>>,
    /// Selection of the previous frame, for the `led_config_changed` flag.
    last_selection: Mutex<Option<LedSelection>>,
}

impl FrameCaptureService {
    /// Build a capture service over a sync client and a camera.
    pub fn new(sync: Arc<LedSyncClient>, camera: Arc<dyn Camera>, timing: CaptureTiming) -> Self {
        Self {
            sync,
            camera,
            timing,
            last_report: Mutex::new(None),
            last_selection: Mutex::new(None),
        }
    }

    /// The sync client this service drives.
    pub fn sync_client(&self) -> &Arc<LedSyncClient> {
        &self.sync
    }

    /// Capture one frame under `sel`, retrying on retryable failures.
    ///
    /// Each attempt restarts the full pulse/stabilize/trigger sequence, with
    /// a fixed backoff between attempts. After `max_retries` failed attempts
    /// the slot is given up with [`CaptureError::RetriesExhausted`].
    pub async fn capture_with_retry(
        &self,
        sel: LedSelection,
        frame_index: u64,
        phase: Option<&PhaseInfo>,
        max_retries: u32,
    ) -> CaptureResult<(Frame, FrameMetadata)> {
        let max_retries = max_retries.max(1);
        let mut last_err: Option<CaptureError> = None;

        for attempt in 1..=max_retries {
            match self.capture(sel, frame_index, phase).await {
                Ok((frame, mut metadata)) => {
                    metadata.attempts = attempt;
                    return Ok((frame, metadata));
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        frame = frame_index,
                        attempt,
                        max_retries,
                        error = %e,
                        "capture attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < max_retries {
                        sleep(self.timing.retry_backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(CaptureError::RetriesExhausted {
            attempts: max_retries,
            last: Box::new(
                last_err.unwrap_or_else(|| CaptureError::Camera("no attempt executed".into())),
            ),
        })
    }

    /// Capture one frame under `sel`: a single attempt.
    pub async fn capture(
        &self,
        sel: LedSelection,
        frame_index: u64,
        phase: Option<&PhaseInfo>,
    ) -> CaptureResult<(Frame, FrameMetadata)> {
        let capture_start = Utc::now();
        let exposure_ms = self.camera.exposure_ms().await?;
        let led_window = Duration::from_millis(
            u64::from(self.timing.stabilization_ms)
                + exposure_ms.ceil() as u64
                + self.timing.safety_buffer_ms,
        );

        let led_config_changed = {
            let mut last = self.last_selection.lock().await;
            let changed = *last != Some(sel);
            *last = Some(sel);
            changed
        };

        // Reuse a live pulse when the LED is already on in the right
        // configuration; otherwise start fresh and sit out stabilization.
        let (ticket, stabilization_waited_ms) = match self.sync.cached_pulse(sel).await {
            Some(ticket) => {
                tracing::debug!(frame = frame_index, led = %sel, "reusing live LED pulse");
                (ticket, 0)
            }
            None => {
                let ticket = self.sync.begin_pulse(sel, led_window).await?;
                sleep(Duration::from_millis(u64::from(self.timing.stabilization_ms))).await;
                (ticket, u64::from(self.timing.stabilization_ms))
            }
        };

        // Margin guard: never trigger into a closing LED window.
        let now = Instant::now();
        let margin_ms = if ticket.led_off_deadline >= now {
            ticket.led_off_deadline.duration_since(now).as_millis() as i64
        } else {
            -(now.duration_since(ticket.led_off_deadline).as_millis() as i64)
        };
        if margin_ms < self.timing.min_capture_margin_ms as i64 {
            self.sync.invalidate_cache().await;
            return Err(CaptureError::SyncTiming {
                margin_ms,
                required_ms: self.timing.min_capture_margin_ms,
            });
        }

        let frame = self
            .camera
            .capture_frame()
            .await?
            .ok_or_else(|| CaptureError::Camera("camera delivered no frame".into()))?;
        let completion = Instant::now();
        let capture_complete = Utc::now();

        let led_was_on_during_capture = completion < ticket.led_off_deadline;
        if !led_was_on_during_capture {
            tracing::warn!(
                frame = frame_index,
                overrun_ms = completion.duration_since(ticket.led_off_deadline).as_millis() as u64,
                "capture completed after the LED-off deadline"
            );
        }

        // Fresh pulses close with a sync-complete frame; losing it leaves
        // the exposure unverified but does not fail the capture.
        let (sync_verified, report) = if ticket.reused {
            (true, *self.last_report.lock().await)
        } else {
            match self.sync.wait_complete(&ticket).await {
                Ok(report) => {
                    *self.last_report.lock().await = Some(report);
                    (true, Some(report))
                }
                Err(e) => {
                    tracing::warn!(frame = frame_index, error = %e, "sync-complete frame lost, exposure unverified");
                    (false, None)
                }
            }
        };

        let metadata = FrameMetadata {
            frame_index,
            capture_start,
            capture_complete,
            led: sel,
            led_config_changed,
            led_was_reused: ticket.reused,
            stabilization_waited_ms,
            exposure_ms,
            margin_ms,
            led_was_on_during_capture,
            sync_verified,
            firmware_timing_ms: report.map(|r| r.timing_ms),
            sensors: report.map(|r| r.sensors),
            attempts: 1,
            phase: phase.map(|p| p.phase),
            cycle: phase.map(|p| p.cycle_number),
        };
        Ok((frame, metadata))
    }

    /// Program the firmware's pulse timing from the camera's exposure.
    ///
    /// `extra_stabilization_ms` covers the camera's trigger latency so the
    /// LED window spans the real trigger-to-exposure delay.
    pub async fn configure_firmware(&self, extra_stabilization_ms: u16) -> CaptureResult<()> {
        let exposure_ms = self.camera.exposure_ms().await?;
        let stabilization = self
            .timing
            .stabilization_ms
            .saturating_add(extra_stabilization_ms);
        self.sync
            .set_timing(stabilization, exposure_ms.ceil().min(30_000.0) as u16)
            .await
    }

    /// Turn all LEDs off and forget any cached pulse.
    pub async fn leds_off(&self) -> CaptureResult<()> {
        *self.last_selection.lock().await = None;
        self.sync.all_leds_off().await
    }
}
