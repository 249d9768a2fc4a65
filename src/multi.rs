//! Multiple cameras recording side by side.
//!
//! Each unit is fully independent: its own transport, camera, sink, and
//! schedule. The controller only fans out control calls and aggregates
//! read-only status; there is no shared mutable state between units, so one
//! rig stalling can never disturb another.

use std::sync::Arc;

use crate::error::CaptureError;
use crate::scheduler::{RecordingScheduler, StatusSnapshot};

/// One camera rig under the controller.
pub struct CameraUnit {
    id: String,
    scheduler: Arc<RecordingScheduler>,
}

impl CameraUnit {
    /// Bundle a scheduler under a unit identifier.
    pub fn new(id: impl Into<String>, scheduler: Arc<RecordingScheduler>) -> Self {
        Self {
            id: id.into(),
            scheduler,
        }
    }

    /// The unit's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The unit's scheduler, for per-unit control.
    pub fn scheduler(&self) -> &Arc<RecordingScheduler> {
        &self.scheduler
    }
}

/// Fans control out to independent camera units.
#[derive(Default)]
pub struct MultiCameraController {
    units: Vec<CameraUnit>,
}

impl MultiCameraController {
    /// Create an empty controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit.
    pub fn add_unit(&mut self, unit: CameraUnit) {
        tracing::info!(unit = %unit.id, "camera unit registered");
        self.units.push(unit);
    }

    /// Registered units.
    pub fn units(&self) -> &[CameraUnit] {
        &self.units
    }

    /// Start every unit. Units that fail to start are reported and do not
    /// keep the others from running.
    pub async fn start_all(&self) -> Vec<(String, CaptureError)> {
        let mut failures = Vec::new();
        for unit in &self.units {
            if let Err(e) = unit.scheduler.start().await {
                tracing::error!(unit = %unit.id, error = %e, "unit failed to start");
                failures.push((unit.id.clone(), e));
            }
        }
        failures
    }

    /// Request every running unit to stop.
    pub fn stop_all(&self) {
        for unit in &self.units {
            if let Err(e) = unit.scheduler.stop() {
                tracing::debug!(unit = %unit.id, error = %e, "unit not stoppable");
            }
        }
    }

    /// Pause every running unit.
    pub fn pause_all(&self) {
        for unit in &self.units {
            if let Err(e) = unit.scheduler.pause() {
                tracing::debug!(unit = %unit.id, error = %e, "unit not pausable");
            }
        }
    }

    /// Resume every paused unit.
    pub fn resume_all(&self) {
        for unit in &self.units {
            if let Err(e) = unit.scheduler.resume() {
                tracing::debug!(unit = %unit.id, error = %e, "unit not resumable");
            }
        }
    }

    /// Wait for every unit's session to finish.
    pub async fn wait_all(&self) {
        for unit in &self.units {
            unit.scheduler.wait().await;
        }
    }

    /// Read-only status of every unit.
    pub fn snapshots(&self) -> Vec<(String, StatusSnapshot)> {
        self.units
            .iter()
            .map(|u| (u.id.clone(), u.scheduler.status()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureTiming, FrameCaptureService};
    use crate::config::RecordingConfig;
    use crate::mock::{FirmwareHandle, MockCamera, MockFirmware, MockSink};
    use crate::state::RecordingStatus;
    use crate::sync_client::LedSyncClient;
    use crate::transport::shared_transport;

    fn unit(id: &str, config: RecordingConfig) -> (CameraUnit, Arc<MockSink>, FirmwareHandle) {
        let (near, far) = tokio::io::duplex(4096);
        let firmware = MockFirmware::default().spawn(far);
        let camera = Arc::new(MockCamera::new(16, 16, 10.0));
        let sink = Arc::new(MockSink::new());
        let sync = Arc::new(LedSyncClient::new(shared_transport(near)));
        let capture = Arc::new(FrameCaptureService::new(
            sync,
            camera,
            CaptureTiming::from_config(&config),
        ));
        let scheduler =
            Arc::new(RecordingScheduler::new(config, capture, sink.clone()).unwrap());
        (CameraUnit::new(id, scheduler), sink, firmware)
    }

    fn short_config() -> RecordingConfig {
        RecordingConfig {
            duration_min: 0.25,
            interval_sec: 5.0,
            ..RecordingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn units_record_independently() {
        let (unit_a, sink_a, _fw_a) = unit("rig-a", short_config());
        let (unit_b, sink_b, _fw_b) = unit("rig-b", short_config());

        let mut controller = MultiCameraController::new();
        controller.add_unit(unit_a);
        controller.add_unit(unit_b);

        assert!(controller.start_all().await.is_empty());
        controller.wait_all().await;

        assert_eq!(sink_a.saved_frames(), vec![0, 1, 2]);
        assert_eq!(sink_b.saved_frames(), vec![0, 1, 2]);

        let snapshots = controller.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots
            .iter()
            .all(|(_, s)| s.state.status == RecordingStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_unit_does_not_stop_the_other() {
        let (unit_a, sink_a, _fw_a) = unit("rig-a", short_config());
        // rig-b's camera refuses every frame, so its session aborts early.
        let (near, far) = tokio::io::duplex(4096);
        let _fw_b = MockFirmware::default().spawn(far);
        let camera_b = Arc::new(MockCamera::new(16, 16, 10.0));
        camera_b.fail_captures(u32::MAX);
        let sink_b = Arc::new(MockSink::new());
        let capture_b = Arc::new(FrameCaptureService::new(
            Arc::new(LedSyncClient::new(shared_transport(near))),
            camera_b,
            CaptureTiming::default(),
        ));
        let unit_b = CameraUnit::new(
            "rig-b",
            Arc::new(RecordingScheduler::new(short_config(), capture_b, sink_b.clone()).unwrap()),
        );

        let mut controller = MultiCameraController::new();
        controller.add_unit(unit_a);
        controller.add_unit(unit_b);

        assert!(controller.start_all().await.is_empty());
        controller.wait_all().await;

        assert_eq!(sink_a.saved_frames(), vec![0, 1, 2]);
        assert!(sink_b.saved_frames().is_empty());

        let snapshots = controller.snapshots();
        let rig_b = &snapshots[1].1;
        assert!(rig_b.state.last_error.is_some());
    }
}
