//! Task spawning and execution abstractions.
//!
//! - `spawn`: Returns a `JoinHandle<T>` that can be awaited
//! - `spawn_blocking`: For CPU-intensive operations, uses the blocking pool
//! - `TaskTracker`: Waits for a group of detached tasks during shutdown
//! - `JoinSet`: Owns a dynamic set of tasks and yields results as they finish
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//!
//! async fn example() {
//!     let handle = task::spawn(async { 42 });
//!     assert_eq!(handle.await.unwrap(), 42);
//!
//!     task::spawn_blocking(|| {
//!         // CPU-intensive work
//!     });
//! }
//! ```

pub use tokio::task::{spawn_blocking, yield_now, AbortHandle, JoinError, JoinHandle, JoinSet};
pub use tokio_util::task::TaskTracker;

/// Spawns a new asynchronous task using the Tokio runtime.
///
/// The spawned task may run on a different thread.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::task::spawn(future)
}

/// Result type for task operations.
pub type Result<T> = std::result::Result<T, JoinError>;
