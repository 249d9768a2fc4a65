//! # LED Timelapse Capture Engine
//!
//! Headless core for long-running timelapse recordings of living specimens,
//! where every frame is captured under a synchronized LED pulse driven by a
//! small controller board over a serial link.
//!
//! The engine guarantees three things end to end:
//!
//! - **A drift-free schedule.** Frame deadlines are absolute offsets from
//!   the session start, never relative to the previous frame, so capture
//!   latency cannot accumulate over multi-day sessions. Pauses freeze the
//!   session clock entirely.
//! - **Deterministic day/night cycling.** The light/dark phase is a pure
//!   function of elapsed time, with the session's final frame pinned to the
//!   outgoing phase at cycle boundaries.
//! - **No compromised exposures.** The camera is only triggered while enough
//!   of the LED-on window remains; a capture that would race the LED
//!   turning off is aborted before the trigger and retried on a fresh pulse.
//!
//! ## Module map
//!
//! - [`config`]: session configuration, validation, TOML/env loading
//! - [`state`]: lifecycle status and the absolute-clock schedule
//! - [`phase`]: pure day/night phase computation
//! - [`protocol`]: binary wire codec for the LED controller
//! - [`transport`] / [`sync_client`]: serial link and the pulse client
//! - [`capture`]: per-frame capture with margin guard and retry
//! - [`scheduler`]: the session loop, control surface, status broadcast
//! - [`calibration`]: LED power search against a target intensity
//! - [`multi`]: independent per-camera units
//! - [`mock`]: mock camera, sink, and firmware endpoint

pub mod calibration;
pub mod capabilities;
pub mod capture;
pub mod config;
pub mod data;
pub mod error;
pub mod mock;
pub mod multi;
pub mod phase;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod sync_client;
pub mod transport;

pub use capabilities::{Camera, FrameSink};
pub use capture::{CaptureTiming, FrameCaptureService};
pub use config::RecordingConfig;
pub use data::{Frame, FrameMetadata, LedKind, LedSelection, SensorReading};
pub use error::{CaptureError, CaptureResult, SessionError};
pub use phase::{PhaseInfo, PhaseType};
pub use scheduler::{RecordingScheduler, StatusSnapshot};
pub use state::{RecordingState, RecordingStatus, StateSnapshot, TimingInfo};
pub use sync_client::LedSyncClient;
