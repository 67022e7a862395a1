//! Byte copying for file streams.

use crate::job::ByteCounter;
use crate::{Result, SyncError};
use core_async::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use core_async::sync::CancellationToken;
use core_async::time::{Duration, Instant};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Limits how often progress is reported for one job.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            last: None,
        }
    }

    /// True when enough time has passed since the last report.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Copy everything from `reader` to `writer`, adding to `counter` as bytes
/// move. `on_progress` receives the running total, throttled.
///
/// Returns the number of bytes copied. Fails with `SessionClosed` as soon as
/// `cancel` fires.
pub async fn copy_counted<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    counter: &ByteCounter,
    cancel: &CancellationToken,
    throttle: &mut ProgressThrottle,
    mut on_progress: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            read = reader.read(&mut buffer) => read?,
        };
        if read == 0 {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            written = writer.write_all(&buffer[..read]) => written?,
        }

        copied += read as u64;
        let total = counter.add(read as u64);
        if throttle.ready() {
            on_progress(total);
        }
    }

    writer.flush().await?;
    Ok(copied)
}

fn cancelled() -> SyncError {
    SyncError::SessionClosed(crate::job::CANCELLED.to_string())
}
