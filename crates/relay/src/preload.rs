//! Preload buffer fill
//!
//! Masks pipeline startup latency: for a fixed warmup duration the daemon
//! accumulates the transcoder's earliest output, then publishes it once as a
//! frozen snapshot. Every new connection replays the snapshot before joining
//! the live stream.

use crate::pipeline::CHUNK_SIZE;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Frozen warmup snapshot shared between the fill routine and the relay.
///
/// Written exactly once, on publish. Connections clone the contents under
/// the lock and never hold it across I/O.
pub type PreloadBuffer = Arc<Mutex<Vec<u8>>>;

/// Create an empty, unpublished preload buffer.
pub fn new_preload_buffer() -> PreloadBuffer {
    Arc::new(Mutex::new(Vec::new()))
}

/// Read from the transcoder's output for `warmup`, appending in order.
///
/// Returns the accumulated bytes; the caller publishes them. A pending read
/// is never end-of-stream (the transcoder emits in irregular bursts), so
/// only the deadline, the shutdown signal, or a zero-byte read (upstream
/// closed) ends the fill.
pub async fn fill<R: AsyncRead + Unpin>(
    reader: &mut R,
    warmup: Duration,
    shutdown: &CancellationToken,
) -> std::io::Result<Vec<u8>> {
    let deadline = Instant::now() + warmup;
    let mut accumulated = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            read = reader.read(&mut chunk) => {
                match read? {
                    0 => break,
                    n => accumulated.extend_from_slice(&chunk[..n]),
                }
            }
        }
    }

    Ok(accumulated)
}

/// Publish the accumulated warmup bytes as the frozen snapshot.
///
/// Single copy-on-publish under the lock; readers never observe a partially
/// written buffer. The buffer is not mutated again after this.
pub fn publish(buffer: &PreloadBuffer, accumulated: Vec<u8>) {
    let len = accumulated.len();
    *buffer.lock().unwrap_or_else(PoisonError::into_inner) = accumulated;
    info!(bytes = len, "preload complete");
}

/// Copy the current snapshot out from under the lock.
pub fn snapshot(buffer: &PreloadBuffer) -> Vec<u8> {
    buffer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}
