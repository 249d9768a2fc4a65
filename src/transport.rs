//! Async byte transport to the LED controller.
//!
//! The sync client works against boxed `AsyncRead + AsyncWrite` trait
//! objects, so production code hands it a serial port (behind the `serial`
//! feature) and tests hand it one end of `tokio::io::duplex`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

use crate::error::{CaptureError, CaptureResult};

/// Default controller baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Quiet window that ends a drain: no byte for this long means the line is
/// clean.
const DRAIN_QUIET: Duration = Duration::from_millis(20);

/// Marker trait for anything usable as the controller link.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed transport trait object.
pub type DynTransport = Box<dyn SerialPortIO>;

/// Transport shared between the sync client and status queries.
pub type SharedTransport = Arc<Mutex<DynTransport>>;

/// Wrap a concrete stream into a [`SharedTransport`].
pub fn shared_transport(io: impl SerialPortIO + 'static) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(io)))
}

/// Discard stale bytes sitting in the receive path.
///
/// Reads until the line has been quiet for a short window or `window` has
/// elapsed, returning the number of bytes discarded. Run before every
/// command so a late response from a previous exchange cannot be mistaken
/// for the new one.
pub async fn drain_transport(port: &SharedTransport, window: Duration) -> usize {
    let mut guard = port.lock().await;
    let deadline = Instant::now() + window;
    let mut drained = 0usize;
    let mut buf = [0u8; 64];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining.min(DRAIN_QUIET), guard.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => drained += n,
            // Read error or quiet line both end the drain.
            Ok(Err(_)) | Err(_) => break,
        }
    }

    if drained > 0 {
        tracing::debug!(drained, "discarded stale transport bytes");
    }
    drained
}

/// Write `data` and flush.
pub async fn write_all(port: &SharedTransport, data: &[u8]) -> CaptureResult<()> {
    let mut guard = port.lock().await;
    guard.write_all(data).await?;
    guard.flush().await?;
    Ok(())
}

/// Read exactly `buf.len()` bytes within `limit`.
///
/// `what` names the awaited response for the timeout error.
pub async fn read_exact_timeout(
    port: &SharedTransport,
    buf: &mut [u8],
    limit: Duration,
    what: &'static str,
) -> CaptureResult<()> {
    let mut guard = port.lock().await;
    match timeout(limit, guard.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(CaptureError::Io(e)),
        Err(_) => Err(CaptureError::Timeout {
            what,
            elapsed: limit,
        }),
    }
}

/// Open a real serial port to the controller (8 data bits, no parity, one
/// stop bit). Port enumeration can block, so the open runs on the blocking
/// pool.
#[cfg(feature = "serial")]
pub async fn open_serial_async(path: &str, baud: u32) -> CaptureResult<SharedTransport> {
    use tokio_serial::SerialPortBuilderExt;

    let display_path = path.to_string();
    let path = path.to_string();
    let port = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(Duration::from_millis(100))
            .open_native_async()
    })
    .await
    .map_err(|e| CaptureError::Communication(format!("serial open task failed: {e}")))?
    .map_err(|e| CaptureError::Communication(format!("cannot open {display_path}: {e}")))?;

    tracing::info!(port = %display_path, baud, "serial transport open");
    Ok(shared_transport(port))
}
