//! Collaborator traits at the engine's seams.
//!
//! The scheduler and capture service are written against these traits so
//! real hardware, mocks, and future backends plug in as `Arc<dyn _>` without
//! touching the engine.

use async_trait::async_trait;

use crate::data::{Frame, FrameMetadata};
use crate::error::CaptureResult;

/// A camera that can deliver single frames on demand.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Trigger one capture. `Ok(None)` means the camera answered but no
    /// frame arrived, which the capture service treats as a camera failure.
    async fn capture_frame(&self) -> CaptureResult<Option<Frame>>;

    /// Currently configured exposure, in milliseconds. Used for the LED-off
    /// deadline and for programming the firmware's timing window.
    async fn exposure_ms(&self) -> CaptureResult<f64>;
}

/// Destination for captured frames and their metadata.
///
/// Storage format and directory layout are the sink's business; the engine
/// only cares whether the save succeeded, because the frame counter advances
/// on success alone.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Persist one frame. Returns `Ok(false)` for a rejected-but-not-broken
    /// save (e.g. duplicate); both `Ok(false)` and `Err` leave the schedule
    /// slot unconsumed.
    async fn save_frame(&self, frame: &Frame, metadata: &FrameMetadata) -> CaptureResult<bool>;

    /// Flush any buffered output. Called once when a session finalizes.
    async fn flush(&self) -> CaptureResult<()> {
        Ok(())
    }
}
