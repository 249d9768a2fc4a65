//! Session orchestration: the loop that turns a configuration into a
//! schedule of illuminated captures.
//!
//! One spawned task owns the session. Control (pause, resume, stop) flows
//! through [`RecordingState`]; observers subscribe to a broadcast channel of
//! [`StatusSnapshot`]s. Waits are chunked so control requests take effect
//! within half a second even on long intervals.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::capabilities::FrameSink;
use crate::capture::FrameCaptureService;
use crate::config::RecordingConfig;
use crate::data::LedSelection;
use crate::error::{CaptureResult, SessionError};
use crate::phase::{self, PhaseInfo, PhaseType};
use crate::state::{RecordingState, RecordingStatus, StateSnapshot, TimingInfo};

/// Poll interval while paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);
/// Longest uninterrupted sleep while waiting for the next frame.
const WAIT_CHUNK: Duration = Duration::from_millis(500);
/// Pause before re-attempting a slot whose save failed.
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Capture failures on frames below this index abort the session: if the
/// rig cannot produce its first frames, hours of scheduled captures would
/// fail the same way.
const EARLY_FRAME_FATAL_THRESHOLD: u64 = 3;

/// One status report, emitted per frame and on control transitions.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Session label from the configuration.
    pub label: String,
    /// Frame counters, progress, and lifecycle status.
    pub state: StateSnapshot,
    /// Active phase, when cycling is enabled.
    pub phase: Option<PhaseInfo>,
    /// Schedule drift diagnostics.
    pub timing: TimingInfo,
}

struct Inner {
    config: RecordingConfig,
    state: RecordingState,
    capture: Arc<FrameCaptureService>,
    sink: Arc<dyn FrameSink>,
    status_tx: broadcast::Sender<StatusSnapshot>,
    /// Last powers sent to the controller (ir, white), to skip redundant
    /// commands that would invalidate the pulse cache.
    applied_powers: Mutex<(Option<u8>, Option<u8>)>,
}

/// Drives one recording session at a time.
pub struct RecordingScheduler {
    inner: Arc<Inner>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl RecordingScheduler {
    /// Create a scheduler. The configuration is validated here, not at
    /// start, so a bad config fails fast.
    pub fn new(
        config: RecordingConfig,
        capture: Arc<FrameCaptureService>,
        sink: Arc<dyn FrameSink>,
    ) -> CaptureResult<Self> {
        config.validate()?;
        let (status_tx, _) = broadcast::channel(64);
        let state = RecordingState::new(config.interval());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state,
                capture,
                sink,
                status_tx,
                applied_powers: Mutex::new((None, None)),
            }),
            task: StdMutex::new(None),
        })
    }

    /// Start the session: program the controller, stamp the schedule, and
    /// spawn the capture loop.
    pub async fn start(&self) -> CaptureResult<()> {
        let inner = &self.inner;
        let total_frames = inner.config.total_frames();
        inner.state.start(total_frames)?;

        if let Err(e) = inner
            .capture
            .configure_firmware(inner.config.camera_trigger_latency_ms)
            .await
        {
            inner.state.finish();
            return Err(e);
        }

        tracing::info!(
            session = %inner.config.output_label,
            total_frames,
            interval_sec = inner.config.interval_sec,
            phase_enabled = inner.config.phase_enabled,
            total_cycles = inner
                .config
                .phase_enabled
                .then(|| phase::total_cycles(&inner.config)),
            "recording session starting"
        );

        let loop_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            run_session(loop_inner).await;
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        self.inner.emit_status(None);
        Ok(())
    }

    /// Freeze the schedule.
    pub fn pause(&self) -> CaptureResult<()> {
        self.inner.state.pause()?;
        tracing::info!(session = %self.inner.config.output_label, "recording paused");
        self.inner.emit_status(None);
        Ok(())
    }

    /// Continue a paused schedule.
    pub fn resume(&self) -> CaptureResult<()> {
        self.inner.state.resume()?;
        tracing::info!(session = %self.inner.config.output_label, "recording resumed");
        self.inner.emit_status(None);
        Ok(())
    }

    /// Request the session to stop after the current frame.
    pub fn stop(&self) -> CaptureResult<()> {
        self.inner.state.request_stop()?;
        tracing::info!(session = %self.inner.config.output_label, "stop requested");
        Ok(())
    }

    /// Current status.
    pub fn status(&self) -> StatusSnapshot {
        self.inner.status_snapshot(None)
    }

    /// Subscribe to per-frame status reports.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Wait for the session task to finish.
    pub async fn wait(&self) {
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Inner {
    fn status_snapshot(&self, phase: Option<PhaseInfo>) -> StatusSnapshot {
        let phase = phase.or_else(|| {
            phase::phase_at(
                &self.config,
                self.state.elapsed().as_secs_f64() / 60.0,
                false,
            )
        });
        StatusSnapshot {
            label: self.config.output_label.clone(),
            state: self.state.snapshot(),
            phase,
            timing: self.state.timing_info(),
        }
    }

    fn emit_status(&self, phase: Option<PhaseInfo>) {
        // Send errors only mean nobody is listening.
        let _ = self.status_tx.send(self.status_snapshot(phase));
    }

    /// Program LED powers for the resolved phase, skipping commands whose
    /// target power is already applied.
    async fn program_led_powers(&self, phase: Option<&PhaseInfo>) -> CaptureResult<()> {
        let cfg = &self.config;
        let (ir, white) = match phase {
            Some(info) => match info.phase {
                PhaseType::Dark => (Some(cfg.dark_phase_ir_power), None),
                PhaseType::Light if cfg.dual_light_phase => (
                    Some(cfg.light_phase_ir_power),
                    Some(cfg.light_phase_white_power),
                ),
                PhaseType::Light => (None, Some(cfg.light_phase_white_power)),
            },
            // Continuous mode images under IR.
            None => (Some(cfg.ir_led_power), None),
        };

        let mut applied = self.applied_powers.lock().await;
        let sync = self.capture.sync_client();
        if let Some(power) = ir {
            if applied.0 != Some(power) {
                sync.set_led_power(crate::data::LedKind::Ir, power).await?;
                applied.0 = Some(power);
            }
        }
        if let Some(power) = white {
            if applied.1 != Some(power) {
                sync.set_led_power(crate::data::LedKind::White, power).await?;
                applied.1 = Some(power);
            }
        }
        Ok(())
    }
}

/// The session loop. Runs until complete, stopped, or fatally failed.
async fn run_session(inner: Arc<Inner>) {
    let total_frames = inner.state.total_frames();

    'session: loop {
        match inner.state.status() {
            RecordingStatus::Recording => {}
            RecordingStatus::Paused => {
                sleep(PAUSE_POLL).await;
                continue;
            }
            RecordingStatus::Stopping | RecordingStatus::Idle => break,
        }
        if inner.state.is_complete() {
            break;
        }

        // Wait out the absolute deadline in bounded chunks so pause/stop
        // requests are honored promptly.
        loop {
            if inner.state.status() != RecordingStatus::Recording {
                continue 'session;
            }
            let wait = inner.state.time_until_next_frame();
            if wait.is_zero() {
                break;
            }
            sleep(wait.min(WAIT_CHUNK)).await;
        }

        let frame_index = inner.state.current_frame();
        let is_last_frame = frame_index + 1 >= total_frames;
        let elapsed_min = inner.state.elapsed().as_secs_f64() / 60.0;
        let phase = phase::phase_at(&inner.config, elapsed_min, is_last_frame);
        let selection = phase.map_or(LedSelection::Ir, |p| p.led);

        if let Err(e) = inner.program_led_powers(phase.as_ref()).await {
            // The capture itself will retry communication; stale powers are
            // preferable to losing the slot here.
            tracing::warn!(frame = frame_index, error = %e, "LED power programming failed");
        }

        match inner
            .capture
            .capture_with_retry(selection, frame_index, phase.as_ref(), inner.config.max_retries)
            .await
        {
            Ok((frame, metadata)) => match inner.sink.save_frame(&frame, &metadata).await {
                Ok(true) => {
                    inner.state.increment_frame();
                    tracing::debug!(
                        frame = frame_index,
                        led = %selection,
                        attempts = metadata.attempts,
                        "frame saved"
                    );
                }
                Ok(false) => {
                    // The slot stays unconsumed and is re-attempted.
                    tracing::warn!(frame = frame_index, "sink rejected frame, slot will be re-attempted");
                    inner.state.record_error(format!("frame {frame_index}: sink rejected save"));
                    sleep(SAVE_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::warn!(frame = frame_index, error = %e, "frame save failed, slot will be re-attempted");
                    inner.state.record_error(format!("frame {frame_index}: {e}"));
                    sleep(SAVE_RETRY_DELAY).await;
                }
            },
            Err(e) => {
                let err = SessionError {
                    frame_index,
                    elapsed_sec: inner.state.elapsed().as_secs_f64(),
                    phase: phase.map(|p| p.phase),
                    source: e,
                };
                inner.state.record_error(err.to_string());
                if frame_index < EARLY_FRAME_FATAL_THRESHOLD {
                    tracing::error!(error = %err, "capture failed in the session's opening frames, aborting");
                    inner.state.request_stop().ok();
                } else {
                    tracing::warn!(error = %err, "capture failed, skipping slot");
                    inner.state.increment_frame();
                }
            }
        }
        inner.emit_status(phase);
    }

    finalize(&inner).await;
}

async fn finalize(inner: &Inner) {
    if let Err(e) = inner.capture.leds_off().await {
        tracing::warn!(error = %e, "failed to turn LEDs off during finalize");
    }
    if let Err(e) = inner.sink.flush().await {
        tracing::warn!(error = %e, "sink flush failed during finalize");
    }

    let timing = inner.state.timing_info();
    tracing::info!(
        session = %inner.config.output_label,
        frames = inner.state.current_frame(),
        total_frames = inner.state.total_frames(),
        drift_sec = timing.drift_sec,
        "recording session finished"
    );
    inner.state.finish();
    inner.emit_status(None);
}
