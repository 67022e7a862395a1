//! Async runtime facade for the Musync core.
//!
//! All core-* crates depend on this crate instead of reaching into tokio
//! directly, so the runtime surface the sync engine relies on stays in one
//! place.
//!
//! # Modules
//!
//! - `task`: Task spawning, task tracking and join sets
//! - `time`: Time-related operations (sleep, timeout, interval)
//! - `sync`: Synchronization primitives (Mutex, RwLock, channels, cancellation)
//! - `io`: Async read/write traits and helpers
//! - `codec`: Length-delimited framing used by the peer protocol
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example() {
//!     let handle = task::spawn(async {
//!         sleep(Duration::from_millis(10)).await;
//!         42
//!     });
//!     assert_eq!(handle.await.unwrap(), 42);
//! }
//! ```

pub mod codec;
pub mod io;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use task::spawn;
pub use time::{sleep, Duration, Instant};
