//! Lifecycle and message notifications.
//!
//! Collaborators implement [`ConnectionObserver`] (every method has a no-op
//! default) and subscribe it to a listener or client. Each notification is
//! fanned out to every subscriber, in subscription order, on whatever task
//! raised it:
//!
//! - `on_connected` - a handshake finished and the connection is open
//! - `on_disconnected` - a connection ended; `None` when an admission attempt
//!   failed before a connection existed, so connect/disconnect stay paired
//! - `on_message` - one decoded message, in arrival order per connection
//! - `on_error` - a suppressed transport, decode or handshake error
//!
//! [`notification_channel`] adapts the callbacks into an mpsc stream of
//! [`Notification`] values for code that prefers to `recv().await`.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::IpcError;

/// Callback interface for connection events.
pub trait ConnectionObserver<T>: Send + Sync {
    /// A connection finished its handshake.
    fn on_connected(&self, _connection: &Arc<Connection<T>>) {}

    /// A connection ended, or an admission attempt failed (`None`).
    fn on_disconnected(&self, _connection: Option<&Arc<Connection<T>>>) {}

    /// A message arrived on `connection`.
    fn on_message(&self, _connection: &Arc<Connection<T>>, _message: &T) {}

    /// An error was contained instead of propagated.
    fn on_error(&self, _error: &IpcError) {}
}

/// Shared observer handle.
pub type SharedObserver<T> = Arc<dyn ConnectionObserver<T>>;

/// Fan-out list of observers.
pub struct Observers<T> {
    subscribers: RwLock<Vec<SharedObserver<T>>>,
}

impl<T> Observers<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Add a subscriber.
    pub fn subscribe(&self, observer: SharedObserver<T>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Number of subscribers.
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Callbacks run on a snapshot so a subscriber may subscribe others.
    fn snapshot(&self) -> Vec<SharedObserver<T>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionObserver<T> for Observers<T> {
    fn on_connected(&self, connection: &Arc<Connection<T>>) {
        for observer in self.snapshot() {
            observer.on_connected(connection);
        }
    }

    fn on_disconnected(&self, connection: Option<&Arc<Connection<T>>>) {
        for observer in self.snapshot() {
            observer.on_disconnected(connection);
        }
    }

    fn on_message(&self, connection: &Arc<Connection<T>>, message: &T) {
        for observer in self.snapshot() {
            observer.on_message(connection, message);
        }
    }

    fn on_error(&self, error: &IpcError) {
        for observer in self.snapshot() {
            observer.on_error(error);
        }
    }
}

/// One notification, as delivered by [`notification_channel`].
pub enum Notification<T> {
    /// See [`ConnectionObserver::on_connected`].
    Connected(Arc<Connection<T>>),
    /// See [`ConnectionObserver::on_disconnected`].
    Disconnected(Option<Arc<Connection<T>>>),
    /// See [`ConnectionObserver::on_message`].
    Message(Arc<Connection<T>>, T),
    /// See [`ConnectionObserver::on_error`]; carries the error's display text.
    Error(String),
}

impl<T> std::fmt::Debug for Notification<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::Connected(c) => write!(f, "Connected({})", c.id()),
            Notification::Disconnected(Some(c)) => write!(f, "Disconnected({})", c.id()),
            Notification::Disconnected(None) => write!(f, "Disconnected(None)"),
            Notification::Message(c, _) => write!(f, "Message({})", c.id()),
            Notification::Error(e) => write!(f, "Error({})", e),
        }
    }
}

/// Observer that forwards every callback into an unbounded channel.
pub struct ChannelObserver<T> {
    tx: mpsc::UnboundedSender<Notification<T>>,
}

impl<T> ConnectionObserver<T> for ChannelObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_connected(&self, connection: &Arc<Connection<T>>) {
        let _ = self.tx.send(Notification::Connected(connection.clone()));
    }

    fn on_disconnected(&self, connection: Option<&Arc<Connection<T>>>) {
        let _ = self.tx.send(Notification::Disconnected(connection.cloned()));
    }

    fn on_message(&self, connection: &Arc<Connection<T>>, message: &T) {
        let _ = self
            .tx
            .send(Notification::Message(connection.clone(), message.clone()));
    }

    fn on_error(&self, error: &IpcError) {
        let _ = self.tx.send(Notification::Error(error.to_string()));
    }
}

/// Create a [`ChannelObserver`] and the receiver it feeds.
pub fn notification_channel<T>() -> (
    Arc<ChannelObserver<T>>,
    mpsc::UnboundedReceiver<Notification<T>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelObserver { tx }), rx)
}
