//! Latest-value publication for owner-facing state.
//!
//! The event bus carries every change; observers that only care about the
//! current state subscribe here instead. Writers must publish in the order
//! they read state, and each publish replaces the whole value, so a reader
//! never sees half of an update.

use std::sync::Arc;
use tokio::sync::watch;

/// Single-writer channel holding the most recent snapshot.
pub struct SnapshotChannel<T> {
    sender: watch::Sender<Arc<T>>,
}

impl<T: Send + Sync + 'static> SnapshotChannel<T> {
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(Arc::new(initial));
        Self { sender }
    }

    /// Replace the current snapshot.
    ///
    /// Returns `true` if the value differed from the previous one and
    /// subscribers were notified.
    pub fn publish(&self, snapshot: T) -> bool
    where
        T: PartialEq,
    {
        self.sender.send_if_modified(|current| {
            if **current == snapshot {
                false
            } else {
                *current = Arc::new(snapshot);
                true
            }
        })
    }

    /// Current snapshot.
    pub fn latest(&self) -> Arc<T> {
        self.sender.borrow().clone()
    }

    /// New subscriber positioned at the current snapshot.
    pub fn subscribe(&self) -> SnapshotReceiver<T> {
        SnapshotReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Read side of a [`SnapshotChannel`].
#[derive(Clone)]
pub struct SnapshotReceiver<T> {
    receiver: watch::Receiver<Arc<T>>,
}

impl<T> SnapshotReceiver<T> {
    /// Current snapshot, marking it as seen.
    pub fn current(&mut self) -> Arc<T> {
        self.receiver.borrow_and_update().clone()
    }

    /// Wait until a snapshot newer than the last one seen is published.
    ///
    /// Returns `None` once the publisher has gone away.
    pub async fn changed(&mut self) -> Option<Arc<T>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

impl<T> std::fmt::Debug for SnapshotReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotReceiver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_sees_latest_value() {
        let channel = SnapshotChannel::new(0u32);
        let mut rx = channel.subscribe();
        assert_eq!(*rx.current(), 0);

        channel.publish(1);
        channel.publish(2);
        channel.publish(3);

        // Intermediate values are coalesced.
        assert_eq!(*rx.changed().await.unwrap(), 3);
        assert_eq!(*channel.latest(), 3);
    }

    #[tokio::test]
    async fn test_identical_publish_does_not_notify() {
        let channel = SnapshotChannel::new(String::from("a"));
        let mut rx = channel.subscribe();
        rx.current();

        assert!(!channel.publish("a".to_string()));
        assert!(channel.publish("b".to_string()));
        assert_eq!(rx.changed().await.unwrap().as_str(), "b");
    }

    #[tokio::test]
    async fn test_changed_ends_when_publisher_dropped() {
        let channel = SnapshotChannel::new(1u8);
        let mut rx = channel.subscribe();
        rx.current();
        drop(channel);
        assert!(rx.changed().await.is_none());
    }
}
