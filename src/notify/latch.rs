//! Single-fire latch
//!
//! A `Latch` settles once and remembers the value. Listeners that subscribe
//! after it fired still get the stored value; later `trigger` calls are
//! ignored. Compare [`Broadcaster`](super::Broadcaster), which never replays.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use super::ListenerHandle;

/// Settle-once notification primitive.
///
/// Cloning a `Latch` yields another handle to the same latch.
pub struct Latch<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Latch<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Latch<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Latch<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Store `value` if this is the first trigger.
    ///
    /// Returns false (and drops `value`) when the latch had already fired.
    pub fn trigger(&self, value: T) -> bool {
        self.slot.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn has_fired(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Snapshot of the stored value, if any.
    pub fn value(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Future that completes with the stored value.
    ///
    /// The returned future does not borrow the latch, so it can be moved into
    /// a `select!` or a spawned task.
    pub fn wait(&self) -> impl Future<Output = T> + Send + 'static {
        let fired = fired(self.slot.subscribe());
        async move {
            match fired.await {
                Some(value) => value,
                // Every handle was dropped without firing.
                None => std::future::pending().await,
            }
        }
    }

    /// Deliver the value to `listener` exactly once.
    ///
    /// Delivery always happens on a spawned task, even when the latch has
    /// already fired, so the listener never runs inside the caller.
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: FnOnce(T) + Send + 'static,
    {
        let fired = fired(self.slot.subscribe());
        ListenerHandle::spawn(async move {
            if let Some(value) = fired.await {
                listener(value);
            }
        })
    }
}

async fn fired<T: Clone>(mut rx: watch::Receiver<Option<T>>) -> Option<T> {
    loop {
        let current = rx.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}
