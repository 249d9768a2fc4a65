//! Recording session state: status transitions, frame counting, and the
//! absolute-clock frame schedule.
//!
//! Every frame's deadline derives from the session start instant, never from
//! the previous frame, so per-frame latency (capture time, serial waits,
//! delayed polls) cannot accumulate into schedule drift. Pauses are excluded
//! from elapsed time by accounting them separately.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{CaptureError, CaptureResult};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    /// No session active.
    Idle,
    /// Capturing on schedule.
    Recording,
    /// Schedule frozen, session clock stopped.
    Paused,
    /// Stop requested, finalization in progress.
    Stopping,
}

impl std::fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingStatus::Idle => write!(f, "idle"),
            RecordingStatus::Recording => write!(f, "recording"),
            RecordingStatus::Paused => write!(f, "paused"),
            RecordingStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Schedule health diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimingInfo {
    /// Where the clock should be given the frames completed, seconds.
    pub expected_elapsed_sec: f64,
    /// Where the clock actually is, seconds.
    pub actual_elapsed_sec: f64,
    /// Positive when the session runs late.
    pub drift_sec: f64,
    /// True while the session runs less than a second late. Negative drift
    /// just means the next deadline is still ahead.
    pub on_schedule: bool,
}

/// Read-only view of the session state at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    /// Lifecycle status.
    pub status: RecordingStatus,
    /// Frames completed so far.
    pub current_frame: u64,
    /// Frames the session will schedule in total.
    pub total_frames: u64,
    /// Completion percentage.
    pub progress_percent: f64,
    /// Session elapsed time, pauses excluded, seconds.
    pub elapsed_sec: f64,
    /// Estimated seconds of capturing left.
    pub remaining_sec: f64,
    /// Message of the most recent reported error, if any.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    status: RecordingStatus,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    total_pause: Duration,
    current_frame: u64,
    total_frames: u64,
    last_error: Option<String>,
}

/// Thread-safe session state. All methods take `&self`; the single mutex is
/// held only for arithmetic, never across an await.
#[derive(Debug)]
pub struct RecordingState {
    interval: Duration,
    inner: Mutex<Inner>,
}

impl RecordingState {
    /// Create an idle state for a session with the given frame interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(Inner {
                status: RecordingStatus::Idle,
                started_at: None,
                paused_at: None,
                total_pause: Duration::ZERO,
                current_frame: 0,
                total_frames: 0,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned state mutex means a panic mid-arithmetic; the data is
        // still structurally sound, so recording continues.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Begin a session of `total_frames` frames, stamping the start instant.
    pub fn start(&self, total_frames: u64) -> CaptureResult<()> {
        let mut inner = self.lock();
        if inner.status != RecordingStatus::Idle {
            return Err(CaptureError::InvalidState(format!(
                "cannot start while {}",
                inner.status
            )));
        }
        inner.status = RecordingStatus::Recording;
        inner.started_at = Some(Instant::now());
        inner.paused_at = None;
        inner.total_pause = Duration::ZERO;
        inner.current_frame = 0;
        inner.total_frames = total_frames;
        inner.last_error = None;
        Ok(())
    }

    /// Current lifecycle status.
    pub fn status(&self) -> RecordingStatus {
        self.lock().status
    }

    /// Session elapsed time with pauses excluded. While paused, frozen at
    /// the pause instant.
    pub fn elapsed(&self) -> Duration {
        let inner = self.lock();
        Self::elapsed_locked(&inner)
    }

    fn elapsed_locked(inner: &Inner) -> Duration {
        let Some(started) = inner.started_at else {
            return Duration::ZERO;
        };
        let reference = inner.paused_at.unwrap_or_else(Instant::now);
        reference
            .duration_since(started)
            .saturating_sub(inner.total_pause)
    }

    /// Time until the next scheduled frame is due.
    ///
    /// The deadline is absolute: `current_frame * interval` past the session
    /// start. Returns zero when that instant has already passed, logging a
    /// warning once the deficit exceeds a full interval.
    pub fn time_until_next_frame(&self) -> Duration {
        let inner = self.lock();
        let expected = self.interval.mul_f64(inner.current_frame as f64);
        let elapsed = Self::elapsed_locked(&inner);

        if elapsed >= expected {
            let deficit = elapsed - expected;
            if deficit > self.interval {
                tracing::warn!(
                    frame = inner.current_frame,
                    behind_sec = deficit.as_secs_f64(),
                    "capture running behind schedule"
                );
            }
            Duration::ZERO
        } else {
            expected - elapsed
        }
    }

    /// Advance the frame counter. Called only after a successful save.
    pub fn increment_frame(&self) {
        self.lock().current_frame += 1;
    }

    /// Frames completed so far.
    pub fn current_frame(&self) -> u64 {
        self.lock().current_frame
    }

    /// Frames the session schedules in total.
    pub fn total_frames(&self) -> u64 {
        self.lock().total_frames
    }

    /// Whether every scheduled frame has been captured.
    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner.current_frame >= inner.total_frames
    }

    /// Freeze the schedule. Only valid while recording.
    pub fn pause(&self) -> CaptureResult<()> {
        let mut inner = self.lock();
        if inner.status != RecordingStatus::Recording {
            return Err(CaptureError::InvalidState(format!(
                "cannot pause while {}",
                inner.status
            )));
        }
        inner.status = RecordingStatus::Paused;
        inner.paused_at = Some(Instant::now());
        Ok(())
    }

    /// Resume a paused schedule, folding the pause into the accounting.
    pub fn resume(&self) -> CaptureResult<()> {
        let mut inner = self.lock();
        if inner.status != RecordingStatus::Paused {
            return Err(CaptureError::InvalidState(format!(
                "cannot resume while {}",
                inner.status
            )));
        }
        if let Some(paused_at) = inner.paused_at.take() {
            inner.total_pause += paused_at.elapsed();
        }
        inner.status = RecordingStatus::Recording;
        Ok(())
    }

    /// Request the session to stop. Valid from Recording and Paused.
    pub fn request_stop(&self) -> CaptureResult<()> {
        let mut inner = self.lock();
        match inner.status {
            RecordingStatus::Recording | RecordingStatus::Paused => {
                if let Some(paused_at) = inner.paused_at.take() {
                    inner.total_pause += paused_at.elapsed();
                }
                inner.status = RecordingStatus::Stopping;
                Ok(())
            }
            other => Err(CaptureError::InvalidState(format!(
                "cannot stop while {other}"
            ))),
        }
    }

    /// Return to idle after finalization.
    pub fn finish(&self) {
        self.lock().status = RecordingStatus::Idle;
    }

    /// Remember the most recent reportable error for status consumers.
    pub fn record_error(&self, message: impl Into<String>) {
        self.lock().last_error = Some(message.into());
    }

    /// Schedule health: expected vs. actual elapsed time.
    pub fn timing_info(&self) -> TimingInfo {
        let inner = self.lock();
        let expected = self.interval.mul_f64(inner.current_frame as f64).as_secs_f64();
        let actual = Self::elapsed_locked(&inner).as_secs_f64();
        let drift = actual - expected;
        TimingInfo {
            expected_elapsed_sec: expected,
            actual_elapsed_sec: actual,
            drift_sec: drift,
            on_schedule: drift < 1.0,
        }
    }

    /// Read-only snapshot for status reporting.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        let elapsed = Self::elapsed_locked(&inner);
        let progress = if inner.total_frames == 0 {
            0.0
        } else {
            inner.current_frame as f64 / inner.total_frames as f64 * 100.0
        };
        let remaining_frames = inner.total_frames.saturating_sub(inner.current_frame);
        StateSnapshot {
            status: inner.status,
            current_frame: inner.current_frame,
            total_frames: inner.total_frames,
            progress_percent: progress,
            elapsed_sec: elapsed.as_secs_f64(),
            remaining_sec: self.interval.mul_f64(remaining_frames as f64).as_secs_f64(),
            last_error: inner.last_error.clone(),
        }
    }
}
