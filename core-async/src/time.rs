//! Time-related operations.
//!
//! Re-exports tokio's timers alongside the std duration types, plus a couple
//! of wall-clock helpers used for timestamps.
//!
//! # Examples
//!
//! ```rust
//! use core_async::time::{sleep, timeout, Duration};
//!
//! async fn example() {
//!     sleep(Duration::from_millis(5)).await;
//!     let value = timeout(Duration::from_secs(1), async { 7 }).await.unwrap();
//!     assert_eq!(value, 7);
//! }
//! ```

pub use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
pub use tokio::time::error::Elapsed;
pub use tokio::time::{interval, sleep, sleep_until, timeout, Interval, MissedTickBehavior, Sleep};

/// Milliseconds since the Unix epoch, saturating to zero for clocks set before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch, saturating to zero for clocks set before it.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
