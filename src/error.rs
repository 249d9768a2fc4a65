//! Centralized error handling for the capture engine.
//!
//! Every fallible operation in the library returns [`CaptureError`]. The
//! variants map to the recovery strategy the scheduler applies: communication
//! and camera failures are retried at the capture level, timing violations
//! abort the current attempt before the camera is ever triggered, and
//! persistence failures are surfaced to the session without automatic retry.

use std::time::Duration;

use crate::phase::PhaseType;

/// A specialized `Result` type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// The error taxonomy of the capture engine.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    /// Serial/transport failure talking to the LED controller: write errors,
    /// missing acknowledgements, malformed response frames.
    #[error("Controller communication error: {0}")]
    Communication(String),

    /// The controller did not answer within the allotted window.
    #[error("Timed out waiting for {what} after {elapsed:?}")]
    Timeout {
        /// What was being awaited (e.g. "sync ack", "sync-complete frame").
        what: &'static str,
        /// How long we waited before giving up.
        elapsed: Duration,
    },

    /// The LED-off deadline leaves too little margin to trigger the camera.
    /// Raised before the trigger, so no compromised frame is ever produced.
    #[error(
        "Sync timing violation: {margin_ms}ms remaining before LED-off, {required_ms}ms required"
    )]
    SyncTiming {
        /// Milliseconds left until the firmware turns the LED off.
        margin_ms: i64,
        /// Minimum acceptable margin.
        required_ms: u64,
    },

    /// The camera failed to deliver a frame.
    #[error("Camera error: {0}")]
    Camera(String),

    /// The frame sink rejected or failed to persist a frame.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A response frame decoded to something the protocol does not allow.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration, named field first.
    #[error("Configuration error: {field}: {message}")]
    Configuration {
        /// The offending configuration field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// An operation was requested in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// All capture attempts for one scheduled slot failed.
    #[error("Capture failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        last: Box<CaptureError>,
    },

    /// Config file loading/parsing failure.
    #[error("Config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// I/O error from the transport layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Whether a fresh capture attempt may succeed where this one failed.
    ///
    /// Timing violations are retryable (the retry starts a new pulse, so the
    /// LED window is fresh); configuration and state errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::Communication(_)
                | CaptureError::Timeout { .. }
                | CaptureError::SyncTiming { .. }
                | CaptureError::Camera(_)
                | CaptureError::Io(_)
        )
    }
}

/// A capture-level error annotated with where in the session it happened.
///
/// The scheduler attaches frame index, elapsed time and the active phase so a
/// failure hours into a multi-day run can be located without log archaeology.
#[derive(thiserror::Error, Debug)]
pub struct SessionError {
    /// Zero-based index of the scheduled frame.
    pub frame_index: u64,
    /// Session elapsed time (pauses excluded) when the error occurred.
    pub elapsed_sec: f64,
    /// Active phase, if phase cycling was enabled.
    pub phase: Option<PhaseType>,
    /// The underlying capture error.
    #[source]
    pub source: CaptureError,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame {} at {:.1}s", self.frame_index, self.elapsed_sec)?;
        if let Some(phase) = self.phase {
            write!(f, " ({phase})")?;
        }
        write!(f, ": {}", self.source)
    }
}
