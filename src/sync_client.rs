//! Client for the LED controller's synchronized-capture protocol.
//!
//! Owns the transport and the LED pulse cache. One pulse is the unit of
//! work: `begin_pulse` turns the LED(s) on and returns when the controller
//! acknowledges, `wait_complete` drains the controller's closing report.
//! Between the two, the caller stabilizes and triggers the camera.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::data::{LedKind, LedSelection};
use crate::error::{CaptureError, CaptureResult};
use crate::protocol::{
    self, LedStatus, SyncReport, LED_STATUS_LEN, RESP_LED_ON_ACK, RESP_SYNC_COMPLETE,
    RESP_TIMING_SET, SYNC_COMPLETE_EXT_LEN, SYNC_COMPLETE_LEN,
};
use crate::transport::{drain_transport, read_exact_timeout, write_all, SharedTransport};

/// How long the controller may take to acknowledge a command.
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a pulse may take to finish after the LED went on.
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(5);
/// Drain window before each command.
const PRE_COMMAND_DRAIN: Duration = Duration::from_millis(50);
/// Wait for the optional extended tail of a sync-complete frame.
const EXTENSION_WAIT: Duration = Duration::from_millis(100);

/// A live LED pulse: the controller has acknowledged, the LED(s) are on.
#[derive(Debug, Clone, Copy)]
pub struct PulseTicket {
    /// Illumination this pulse drives.
    pub selection: LedSelection,
    /// Instant the controller acknowledged (LED-on time).
    pub pulse_start: Instant,
    /// Instant the firmware will turn the LED off.
    pub led_off_deadline: Instant,
    /// True when this ticket reuses an earlier pulse instead of a fresh one.
    pub reused: bool,
}

#[derive(Debug, Clone, Copy)]
struct PulseCache {
    selection: LedSelection,
    pulse_start: Instant,
    led_off_deadline: Instant,
    /// When telemetry last arrived for this configuration.
    telemetry_at: Option<Instant>,
}

/// Async client for the LED controller.
pub struct LedSyncClient {
    port: SharedTransport,
    telemetry_refresh: Duration,
    cache: Mutex<Option<PulseCache>>,
}

impl LedSyncClient {
    /// Create a client over `port` with the default 60 s telemetry refresh.
    pub fn new(port: SharedTransport) -> Self {
        Self::with_telemetry_refresh(port, Duration::from_secs(60))
    }

    /// Create a client with an explicit telemetry refresh interval.
    pub fn with_telemetry_refresh(port: SharedTransport, telemetry_refresh: Duration) -> Self {
        Self {
            port,
            telemetry_refresh,
            cache: Mutex::new(None),
        }
    }

    /// Return the live pulse for `sel`, if one can be reused.
    ///
    /// Reuse requires the same selection, an LED-off deadline still in the
    /// future, and telemetry younger than the refresh interval. Anything
    /// else forces a fresh pulse.
    pub async fn cached_pulse(&self, sel: LedSelection) -> Option<PulseTicket> {
        let cache = self.cache.lock().await;
        let entry = (*cache)?;
        if entry.selection != sel {
            return None;
        }
        let now = Instant::now();
        if now >= entry.led_off_deadline {
            return None;
        }
        let fresh = entry
            .telemetry_at
            .is_some_and(|at| now.duration_since(at) < self.telemetry_refresh);
        if !fresh {
            return None;
        }
        Some(PulseTicket {
            selection: entry.selection,
            pulse_start: entry.pulse_start,
            led_off_deadline: entry.led_off_deadline,
            reused: true,
        })
    }

    /// Forget the cached pulse. Called whenever controller state may have
    /// diverged from what the cache assumes.
    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Start a synchronized LED pulse and wait for the LED-on
    /// acknowledgement.
    ///
    /// `led_window` is how long the firmware will hold the LED on
    /// (stabilization + exposure + safety buffer); it fixes the returned
    /// ticket's LED-off deadline.
    pub async fn begin_pulse(
        &self,
        sel: LedSelection,
        led_window: Duration,
    ) -> CaptureResult<PulseTicket> {
        drain_transport(&self.port, PRE_COMMAND_DRAIN).await;

        // Single-LED pulses address a selected LED; dual drives both without
        // selection.
        if let [kind] = sel.active_leds() {
            self.select_led(*kind).await?;
        }

        write_all(&self.port, &[protocol::sync_capture_command(sel)]).await?;

        let mut ack = [0u8; 1];
        if let Err(e) = read_exact_timeout(&self.port, &mut ack, ACK_TIMEOUT, "sync ack").await {
            self.invalidate_cache().await;
            return Err(e);
        }
        if ack[0] != RESP_LED_ON_ACK {
            self.invalidate_cache().await;
            return Err(CaptureError::Communication(format!(
                "expected LED-on ack 0x{RESP_LED_ON_ACK:02X}, got 0x{:02X}",
                ack[0]
            )));
        }

        let pulse_start = Instant::now();
        let led_off_deadline = pulse_start + led_window;
        *self.cache.lock().await = Some(PulseCache {
            selection: sel,
            pulse_start,
            led_off_deadline,
            telemetry_at: None,
        });

        tracing::debug!(led = %sel, window_ms = led_window.as_millis() as u64, "sync pulse started");
        Ok(PulseTicket {
            selection: sel,
            pulse_start,
            led_off_deadline,
            reused: false,
        })
    }

    /// Wait for the pulse's closing sync-complete frame and decode it.
    ///
    /// A failure here does not mean the capture failed, only that the
    /// exposure could not be verified; the cache is dropped because the
    /// controller's state is unknown.
    pub async fn wait_complete(&self, ticket: &PulseTicket) -> CaptureResult<SyncReport> {
        let mut head = [0u8; SYNC_COMPLETE_LEN];
        if let Err(e) =
            read_exact_timeout(&self.port, &mut head, COMPLETE_TIMEOUT, "sync-complete frame").await
        {
            self.invalidate_cache().await;
            return Err(e);
        }
        if head[0] != RESP_SYNC_COMPLETE {
            self.invalidate_cache().await;
            return Err(CaptureError::Protocol(format!(
                "bad sync-complete header 0x{:02X}",
                head[0]
            )));
        }

        // Newer firmware appends LED diagnostics; older firmware stops at
        // the telemetry head.
        let mut tail = [0u8; SYNC_COMPLETE_EXT_LEN - SYNC_COMPLETE_LEN];
        let report = match read_exact_timeout(&self.port, &mut tail, EXTENSION_WAIT, "sync tail")
            .await
        {
            Ok(()) => {
                let mut frame = head.to_vec();
                frame.extend_from_slice(&tail);
                protocol::decode_sync_complete(&frame)?
            }
            Err(CaptureError::Timeout { .. }) => protocol::decode_sync_complete(&head)?,
            Err(e) => {
                self.invalidate_cache().await;
                return Err(e);
            }
        };

        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_mut() {
            if entry.selection == ticket.selection {
                entry.telemetry_at = Some(Instant::now());
            }
        }

        tracing::debug!(
            timing_ms = report.timing_ms,
            temperature_c = report.sensors.temperature_c,
            humidity_pct = report.sensors.humidity_pct,
            "sync pulse complete"
        );
        Ok(report)
    }

    /// Program the firmware's stabilization and exposure windows.
    pub async fn set_timing(&self, stabilization_ms: u16, exposure_ms: u16) -> CaptureResult<()> {
        self.invalidate_cache().await;
        drain_transport(&self.port, PRE_COMMAND_DRAIN).await;

        write_all(&self.port, &protocol::set_timing_command(stabilization_ms, exposure_ms)).await?;

        let mut resp = [0u8; 1];
        read_exact_timeout(&self.port, &mut resp, ACK_TIMEOUT, "timing ack").await?;
        if resp[0] != RESP_TIMING_SET {
            return Err(CaptureError::Communication(format!(
                "timing not accepted, controller answered 0x{:02X}",
                resp[0]
            )));
        }
        tracing::debug!(stabilization_ms, exposure_ms, "controller timing programmed");
        Ok(())
    }

    /// Set one LED's power. Fire-and-forget on the wire; the cache is
    /// dropped because the illumination changed.
    pub async fn set_led_power(&self, kind: LedKind, percent: u8) -> CaptureResult<()> {
        self.invalidate_cache().await;
        write_all(&self.port, &protocol::set_power_command(kind, percent)).await?;
        tracing::debug!(led = %kind, percent, "LED power set");
        Ok(())
    }

    /// Turn both LEDs off.
    pub async fn all_leds_off(&self) -> CaptureResult<()> {
        self.invalidate_cache().await;
        write_all(&self.port, &[protocol::CMD_LED_DUAL_OFF]).await?;
        Ok(())
    }

    /// Query the controller's LED status.
    pub async fn led_status(&self) -> CaptureResult<LedStatus> {
        drain_transport(&self.port, PRE_COMMAND_DRAIN).await;
        write_all(&self.port, &[protocol::CMD_GET_LED_STATUS]).await?;

        let mut frame = [0u8; LED_STATUS_LEN];
        read_exact_timeout(&self.port, &mut frame, ACK_TIMEOUT, "LED status frame").await?;
        protocol::decode_led_status(&frame)
    }

    async fn select_led(&self, kind: LedKind) -> CaptureResult<()> {
        let (cmd, expect) = protocol::select_command(kind);
        write_all(&self.port, &[cmd]).await?;

        let mut resp = [0u8; 1];
        read_exact_timeout(&self.port, &mut resp, ACK_TIMEOUT, "LED select ack").await?;
        if resp[0] != expect {
            return Err(CaptureError::Communication(format!(
                "LED select for {kind} answered 0x{:02X}, expected 0x{expect:02X}",
                resp[0]
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        encode_sync_complete, CMD_SELECT_LED_IR, CMD_SELECT_LED_WHITE, CMD_SYNC_CAPTURE,
        CMD_SYNC_CAPTURE_DUAL, RESP_LED_IR_SELECTED, RESP_LED_WHITE_SELECTED,
    };
    use crate::transport::shared_transport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn client_pair() -> (LedSyncClient, DuplexStream) {
        let (near, far) = tokio::io::duplex(256);
        (LedSyncClient::new(shared_transport(near)), far)
    }

    /// Answer one single-LED pulse start on the controller side.
    async fn answer_pulse_start(far: &mut DuplexStream, select_cmd: u8, select_resp: u8) {
        let mut buf = [0u8; 1];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], select_cmd);
        far.write_all(&[select_resp]).await.unwrap();

        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], CMD_SYNC_CAPTURE);
        far.write_all(&[RESP_LED_ON_ACK]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_selects_led_then_acks() {
        let (client, mut far) = client_pair();
        let firmware = tokio::spawn(async move {
            answer_pulse_start(&mut far, CMD_SELECT_LED_IR, RESP_LED_IR_SELECTED).await;
            far
        });

        let ticket = client
            .begin_pulse(LedSelection::Ir, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!ticket.reused);
        assert_eq!(ticket.selection, LedSelection::Ir);
        assert_eq!(
            ticket.led_off_deadline.duration_since(ticket.pulse_start),
            Duration::from_secs(2)
        );
        firmware.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dual_pulse_skips_selection() {
        let (client, mut far) = client_pair();
        let firmware = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            far.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], CMD_SYNC_CAPTURE_DUAL);
            far.write_all(&[RESP_LED_ON_ACK]).await.unwrap();
            far
        });

        client
            .begin_pulse(LedSelection::Dual, Duration::from_secs(2))
            .await
            .unwrap();
        firmware.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out() {
        let (client, mut far) = client_pair();
        let firmware = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            far.read_exact(&mut buf).await.unwrap();
            far.write_all(&[RESP_LED_WHITE_SELECTED]).await.unwrap();
            // Swallow the sync command, never ack.
            far.read_exact(&mut buf).await.unwrap();
            far
        });

        let err = client
            .begin_pulse(LedSelection::White, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Timeout { what: "sync ack", .. }));
        // Closing the client side unblocks the endpoint's pending read.
        drop(client);
        firmware.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_ack_byte_is_communication_error() {
        let (client, mut far) = client_pair();
        tokio::spawn(async move {
            let mut buf = [0u8; 1];
            far.read_exact(&mut buf).await.unwrap();
            far.write_all(&[RESP_LED_WHITE_SELECTED]).await.unwrap();
            far.read_exact(&mut buf).await.unwrap();
            far.write_all(&[0x55]).await.unwrap();
            // Hold the stream open until the client is done.
            let _ = far.read(&mut buf).await;
        });

        let err = client
            .begin_pulse(LedSelection::White, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Communication(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_complete_decodes_short_frame_and_arms_cache() {
        let (client, mut far) = client_pair();
        let firmware = tokio::spawn(async move {
            answer_pulse_start(&mut far, CMD_SELECT_LED_IR, RESP_LED_IR_SELECTED).await;
            far.write_all(&encode_sync_complete(1520, 23.4, 55.2, None))
                .await
                .unwrap();
            far
        });

        let ticket = client
            .begin_pulse(LedSelection::Ir, Duration::from_secs(60))
            .await
            .unwrap();

        // No telemetry yet, so the fresh pulse is not reusable.
        assert!(client.cached_pulse(LedSelection::Ir).await.is_none());

        let report = client.wait_complete(&ticket).await.unwrap();
        assert_eq!(report.timing_ms, 1520);
        assert!((report.sensors.temperature_c - 23.4).abs() < 0.1);

        // Telemetry arrived and the LED window is still open: reusable now.
        let cached = client.cached_pulse(LedSelection::Ir).await.unwrap();
        assert!(cached.reused);
        // Wrong selection never reuses.
        assert!(client.cached_pulse(LedSelection::White).await.is_none());
        firmware.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cache_expires_with_led_window() {
        let (client, mut far) = client_pair();
        let firmware = tokio::spawn(async move {
            answer_pulse_start(&mut far, CMD_SELECT_LED_IR, RESP_LED_IR_SELECTED).await;
            far.write_all(&encode_sync_complete(100, 22.0, 50.0, None))
                .await
                .unwrap();
            far
        });

        let ticket = client
            .begin_pulse(LedSelection::Ir, Duration::from_secs(2))
            .await
            .unwrap();
        client.wait_complete(&ticket).await.unwrap();
        assert!(client.cached_pulse(LedSelection::Ir).await.is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(client.cached_pulse(LedSelection::Ir).await.is_none());
        firmware.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn set_timing_round_trip() {
        let (client, mut far) = client_pair();
        let firmware = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            far.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, protocol::set_timing_command(1050, 500));
            far.write_all(&[RESP_TIMING_SET]).await.unwrap();
            far
        });

        client.set_timing(1050, 500).await.unwrap();
        firmware.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn power_change_invalidates_cache() {
        let (client, mut far) = client_pair();
        let firmware = tokio::spawn(async move {
            answer_pulse_start(&mut far, CMD_SELECT_LED_WHITE, RESP_LED_WHITE_SELECTED).await;
            far.write_all(&encode_sync_complete(100, 22.0, 50.0, None))
                .await
                .unwrap();
            // Swallow the power command.
            let mut buf = [0u8; 2];
            far.read_exact(&mut buf).await.unwrap();
            far
        });

        let ticket = client
            .begin_pulse(LedSelection::White, Duration::from_secs(60))
            .await
            .unwrap();
        client.wait_complete(&ticket).await.unwrap();
        assert!(client.cached_pulse(LedSelection::White).await.is_some());

        client.set_led_power(LedKind::White, 75).await.unwrap();
        assert!(client.cached_pulse(LedSelection::White).await.is_none());
        firmware.await.unwrap();
    }
}
