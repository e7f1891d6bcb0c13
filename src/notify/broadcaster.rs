//! Multicast broadcaster
//!
//! Each emission reaches exactly the listeners registered at the moment of
//! the call. Late listeners never see earlier values.
//!
//! Every subscription owns an unbounded queue, so a slow listener is never
//! skipped ahead; it drains everything emitted after it joined, in order.

use futures_util::stream::{self, Stream};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Repeat-fire notification primitive.
///
/// Cloning a `Broadcaster` yields another handle to the same listener list.
/// Subscriptions end once every handle is dropped.
pub struct Broadcaster<T> {
    listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> Default for Broadcaster<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `value` to every current listener, in registration order.
    ///
    /// Returns how many listeners it reached. Dropped subscriptions are
    /// pruned here.
    pub fn emit(&self, value: T) -> usize {
        let mut listeners = self.listeners();
        listeners.retain(|tx| tx.send(value.clone()).is_ok());
        listeners.len()
    }

    /// Register a listener. Dropping the subscription unregisters it.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners().push(tx);
        Subscription { rx }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().iter().filter(|tx| !tx.is_closed()).count()
    }
}

/// One registration against a [`Broadcaster`].
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T>
where
    T: Clone + Send + 'static,
{
    /// Wait for the next emission.
    ///
    /// Returns `None` once the broadcaster is gone and everything queued has
    /// been read. Cancel safe.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}

    /// Turn this subscription into a stream of every later emission.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let value = sub.recv().await?;
            Some((value, sub))
        })
    }
}

/// Resolve with the first value `broadcaster` emits after this call.
///
/// The subscription is taken synchronously, so an emission racing with the
/// first poll is not lost. Resolves to `None` only if the broadcaster is
/// dropped first.
pub fn next<T>(broadcaster: &Broadcaster<T>) -> impl Future<Output = Option<T>> + Send + 'static
where
    T: Clone + Send + 'static,
{
    let mut sub = broadcaster.subscribe();
    async move { sub.recv().await }
}

/// Expose `broadcaster` as a lazy sequence starting now.
///
/// Each call opens its own subscription window; values emitted before the
/// call are not part of the sequence.
pub fn as_sequence<T>(broadcaster: &Broadcaster<T>) -> impl Stream<Item = T> + Send + 'static
where
    T: Clone + Send + 'static,
{
    broadcaster.subscribe().into_stream()
}
