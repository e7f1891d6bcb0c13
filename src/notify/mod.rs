//! Notification primitives
//!
//! Two kinds of notification:
//!
//! | Primitive     | Fires   | Late subscriber sees          |
//! |---------------|---------|-------------------------------|
//! | `Latch`       | once    | the stored value              |
//! | `Broadcaster` | many    | only emissions after it joined |
//!
//! `StatusCell` pairs a current value with a `Broadcaster` of changes and is
//! what every layer uses to publish its status.
//!
//! Delivery always happens on the listener's own task. A component that
//! mutates its status inside an event handler never runs listener code
//! in the middle of that handler.

mod broadcaster;
mod latch;

pub use broadcaster::{as_sequence, next, Broadcaster, Subscription};
pub use latch::Latch;

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Capability to detach a callback-style listener.
///
/// Dropping the handle leaves the listener attached; call
/// [`unsubscribe`](ListenerHandle::unsubscribe) to stop it.
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            task: tokio::spawn(fut),
        }
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

/// Current status plus a stream of changes.
pub struct StatusCell<S> {
    current: watch::Sender<S>,
    changes: Broadcaster<S>,
}

impl<S> StatusCell<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(initial: S) -> Self {
        let (current, _) = watch::channel(initial);
        Self {
            current,
            changes: Broadcaster::new(),
        }
    }

    pub fn get(&self) -> S {
        self.current.borrow().clone()
    }

    /// Replace the status and queue the change for listeners.
    pub fn set(&self, status: S) {
        self.current.send_replace(status.clone());
        self.changes.emit(status);
    }

    /// Every change, in order.
    pub fn changes(&self) -> &Broadcaster<S> {
        &self.changes
    }

    /// Latest-value receiver for code that only cares about where things stand.
    pub fn watch(&self) -> watch::Receiver<S> {
        self.current.subscribe()
    }
}
