//! Synchronization primitives.
//!
//! All primitives are `Send + Sync` and async-aware, so holding a lock across
//! an `.await` never blocks the executor.
//!
//! # Examples
//!
//! ```rust
//! use core_async::sync::{Mutex, RwLock};
//!
//! async fn example() {
//!     let mutex = Mutex::new(42);
//!     let mut guard = mutex.lock().await;
//!     *guard += 1;
//!     drop(guard);
//!
//!     let rwlock = RwLock::new(vec![1, 2, 3]);
//!     let read_guard = rwlock.read().await;
//!     assert_eq!(read_guard.len(), 3);
//! }
//! ```

pub use tokio::sync::{
    broadcast, mpsc, oneshot, watch, AcquireError, Barrier, Mutex, MutexGuard, Notify,
    OwnedSemaphorePermit, RwLock, RwLockReadGuard, RwLockWriteGuard, Semaphore, SemaphorePermit,
    TryAcquireError,
};

pub use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
