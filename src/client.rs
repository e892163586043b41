//! Client builder and endpoint state machine.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the endpoint.
//! The [`ClientEndpoint`] manages the lifecycle:
//!
//! ```text
//! Idle ──start()──► Handshaking ──ok──► Connected
//!                        │                  │ peer close / error / stop()
//!                        └──failed──► Disconnected ◄┘
//!                                        │
//!          auto-reconnect, not stopped ──┴──► Handshaking
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pipelink::ClientEndpoint;
//! use std::time::Duration;
//!
//! let client = ClientEndpoint::<String>::builder("chat")
//!     .auto_reconnect(true)
//!     .build();
//! client.start();
//! client.wait_for_connected(Some(Duration::from_secs(5))).await;
//! client.push(&"hi".to_string()).await?;
//! client.stop();
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::codec::{Codec, CodecFns, Message, MsgPackCodec};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{IpcError, Result};
use crate::events::{ConnectionObserver, Observers, SharedObserver};
use crate::handshake::connect_private;
use crate::reconnect::{ReconnectPolicy, ReconnectSchedule};
use crate::writer::WriterConfig;

/// Default bound for one complete client handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`ClientEndpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Never started.
    Idle,
    /// Rendezvous in progress.
    Handshaking,
    /// A connection is open.
    Connected,
    /// The last session ended or the last handshake failed.
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ClientState,
    /// Id of the connection the state refers to.
    active: Option<u64>,
    /// Bumped on every transition into `Disconnected`.
    disconnects: u64,
}

/// Builder for a [`ClientEndpoint`].
pub struct ClientBuilder<T> {
    name: String,
    directory: PathBuf,
    connect_timeout: Duration,
    config: ConnectionConfig,
    codec: CodecFns<T>,
    name_codec: CodecFns<String>,
    auto_reconnect: bool,
    policy: ReconnectPolicy,
    observers: Vec<SharedObserver<T>>,
}

impl<T: Message> ClientBuilder<T> {
    /// Start configuring a client of the listener named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: std::env::temp_dir(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            config: ConnectionConfig::default(),
            codec: CodecFns::of::<MsgPackCodec>(),
            name_codec: CodecFns::of::<MsgPackCodec>(),
            auto_reconnect: false,
            policy: ReconnectPolicy::default(),
            observers: Vec::new(),
        }
    }

    /// Directory holding the socket files (Unix only).
    ///
    /// Default: the system temp directory
    pub fn directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.directory = directory.as_ref().to_path_buf();
        self
    }

    /// Bound for one complete handshake, including waiting for a busy or
    /// absent listener.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Writer settings for the connection.
    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.config.writer = config;
        self
    }

    /// Largest accepted frame payload.
    ///
    /// Default: 16 MiB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Message codec; must match the listener's.
    ///
    /// Default: [`MsgPackCodec`]
    pub fn codec<C: Codec>(mut self) -> Self {
        self.codec = CodecFns::of::<C>();
        self.name_codec = CodecFns::of::<C>();
        self
    }

    /// Re-run the handshake after an unplanned disconnect.
    ///
    /// Default: false
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Pacing of automatic reconnects.
    ///
    /// Default: [`ReconnectPolicy::Immediate`]
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Subscribe an observer before the endpoint starts.
    pub fn observer(mut self, observer: SharedObserver<T>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the endpoint in the `Idle` state.
    pub fn build(self) -> ClientEndpoint<T> {
        let observers = Observers::new();
        for observer in self.observers {
            observers.subscribe(observer);
        }
        let (status, _) = watch::channel(Status {
            state: ClientState::Idle,
            active: None,
            disconnects: 0,
        });

        ClientEndpoint {
            inner: Arc::new(ClientInner {
                schedule: Mutex::new(self.policy.schedule()),
                name: self.name,
                directory: self.directory,
                connect_timeout: self.connect_timeout,
                config: self.config,
                codec: self.codec,
                name_codec: self.name_codec,
                auto_reconnect: self.auto_reconnect,
                observers,
                status,
                connection: Mutex::new(None),
                stopped: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

/// Client side of a listener: one connection at a time, optionally
/// reconnecting on its own.
///
/// Dropping the endpoint stops it.
pub struct ClientEndpoint<T> {
    inner: Arc<ClientInner<T>>,
}

struct ClientInner<T> {
    name: String,
    directory: PathBuf,
    connect_timeout: Duration,
    config: ConnectionConfig,
    codec: CodecFns<T>,
    name_codec: CodecFns<String>,
    auto_reconnect: bool,
    schedule: Mutex<ReconnectSchedule>,
    observers: Observers<T>,
    status: watch::Sender<Status>,
    connection: Mutex<Option<Arc<Connection<T>>>>,
    /// Set by `stop()`; suppresses reconnects until the next `start()`.
    stopped: AtomicBool,
    /// Bumped by every handshake start and every `stop()`; only the handshake
    /// holding the current value may install or fail.
    generation: AtomicU64,
}

impl<T: Message> ClientEndpoint<T> {
    /// Start configuring a client.
    pub fn builder(name: impl Into<String>) -> ClientBuilder<T> {
        ClientBuilder::new(name)
    }

    /// Begin a handshake in the background.
    ///
    /// Returns immediately. Only acts from `Idle` or `Disconnected`; must be
    /// called inside a tokio runtime.
    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);
        self.inner.begin_handshake();
    }

    /// Close the active connection and stay disconnected.
    ///
    /// The closed connection reports its disconnect once; no reconnect
    /// follows until [`start`](Self::start) is called again.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Send one message over the active connection and wait for the drain.
    ///
    /// # Errors
    ///
    /// [`IpcError::NotConnected`] when there is no active connection,
    /// otherwise whatever [`Connection::push`] returns.
    pub async fn push(&self, message: &T) -> Result<()> {
        match self.connection() {
            Some(connection) => connection.push(message).await,
            None => Err(IpcError::NotConnected),
        }
    }

    /// Add an observer.
    pub fn subscribe(&self, observer: SharedObserver<T>) {
        self.inner.observers.subscribe(observer);
    }

    /// Wait until the endpoint is connected.
    ///
    /// Returns `true` once connected (immediately if it already is), `false`
    /// if `timeout` elapsed first. A timeout is not an error; re-check
    /// [`state`](Self::state) before acting.
    pub async fn wait_for_connected(&self, timeout: Option<Duration>) -> bool {
        let mut status = self.inner.status.subscribe();
        let wait = async move {
            status
                .wait_for(|s| s.state == ClientState::Connected)
                .await
                .is_ok()
        };
        bounded(wait, timeout).await
    }

    /// Wait until the current session or handshake ends.
    ///
    /// Returns `true` immediately when neither is in progress, `true` on the
    /// next disconnect otherwise, and `false` if `timeout` elapsed first.
    pub async fn wait_for_disconnected(&self, timeout: Option<Duration>) -> bool {
        let mut status = self.inner.status.subscribe();
        let seen = *status.borrow_and_update();
        if !matches!(
            seen.state,
            ClientState::Connected | ClientState::Handshaking
        ) {
            return true;
        }

        let wait = async move {
            status
                .wait_for(|s| s.disconnects > seen.disconnects)
                .await
                .is_ok()
        };
        bounded(wait, timeout).await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.inner.status.borrow().state
    }

    /// Whether a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// The active connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection<T>>> {
        self.inner
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Well-known name of the listener this client talks to.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<T> Drop for ClientEndpoint<T> {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl<T> fmt::Debug for ClientEndpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = *self.inner.status.borrow();
        f.debug_struct("ClientEndpoint")
            .field("name", &self.inner.name)
            .field("state", &status.state)
            .finish()
    }
}

async fn bounded<F: std::future::Future<Output = bool>>(wait: F, timeout: Option<Duration>) -> bool {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(false),
        None => wait.await,
    }
}

impl<T> ClientInner<T> {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);

        let active = {
            let mut slot = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.status.send_if_modified(|s| match s.state {
                ClientState::Connected | ClientState::Handshaking => {
                    s.state = ClientState::Disconnected;
                    s.active = None;
                    s.disconnects += 1;
                    true
                }
                _ => false,
            });
            slot.take()
        };

        if let Some(connection) = active {
            tracing::info!(id = connection.id(), "client stopping");
            connection.close();
        }
    }
}

impl<T: Message> ClientInner<T> {
    /// Idle/Disconnected → Handshaking, then run the handshake on a task.
    fn begin_handshake(self: &Arc<Self>) {
        let generation = {
            let _slot = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let began = self.status.send_if_modified(|s| match s.state {
                ClientState::Idle | ClientState::Disconnected => {
                    s.state = ClientState::Handshaking;
                    true
                }
                _ => false,
            });
            if !began {
                return;
            }
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        tracing::debug!(name = %self.name, generation, "handshake started");
        tokio::spawn(self.clone().handshake(generation));
    }

    async fn handshake(self: Arc<Self>, generation: u64) {
        let result = connect_private(
            &self.directory,
            &self.name,
            &self.name_codec,
            self.connect_timeout,
            self.config.max_frame_size,
        )
        .await;

        let (private_name, stream) = match result {
            Ok(attached) => attached,
            Err(e) => {
                self.handshake_failed(e, generation);
                return;
            }
        };

        let sink: SharedObserver<T> = Arc::new(ClientSink {
            inner: Arc::downgrade(&self),
        });

        let connection = {
            let mut slot = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.generation.load(Ordering::Acquire) != generation {
                // Superseded by stop() or a newer start(); the stream is
                // dropped unused.
                tracing::debug!(name = %private_name, "discarding stale handshake");
                return;
            }

            let connection = Connection::new(stream, private_name, self.codec, &self.config, sink);
            *slot = Some(connection.clone());
            self.status.send_modify(|s| {
                s.state = ClientState::Connected;
                s.active = Some(connection.id());
            });
            connection
        };

        self.schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();

        tracing::info!(id = connection.id(), name = %connection.name(), "client connected");
        self.observers.on_connected(&connection);
        connection.open();
    }

    fn handshake_failed(self: &Arc<Self>, error: IpcError, generation: u64) {
        {
            let _slot = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.generation.load(Ordering::Acquire) != generation {
                tracing::debug!(name = %self.name, "stale handshake failed: {}", error);
                return;
            }
            self.status.send_modify(|s| {
                s.state = ClientState::Disconnected;
                s.active = None;
                s.disconnects += 1;
            });
        }

        tracing::warn!(name = %self.name, "handshake failed: {}", error);
        self.observers.on_error(&error);
        self.observers.on_disconnected(None);
        self.reconnect();
    }

    fn reconnect(self: &Arc<Self>) {
        if !self.auto_reconnect || self.stopped.load(Ordering::Acquire) {
            return;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let (delay, attempt) = {
            let mut schedule = self
                .schedule
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (schedule.next_delay(), schedule.attempts())
        };

        match delay {
            None => {
                tracing::warn!(name = %self.name, attempts = attempt, "giving up on reconnect");
            }
            Some(delay) if delay.is_zero() => {
                tracing::debug!(attempt, "reconnecting");
                self.begin_handshake();
            }
            Some(delay) => {
                tracing::debug!(attempt, ?delay, "reconnecting after delay");
                let inner = Arc::downgrade(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = inner.upgrade() {
                        // A stop() or a manual start() since then owns the
                        // endpoint now.
                        if inner.generation.load(Ordering::Acquire) == generation {
                            inner.begin_handshake();
                        }
                    }
                });
            }
        }
    }
}

/// Turns the active connection's events into state transitions.
struct ClientSink<T> {
    inner: Weak<ClientInner<T>>,
}

impl<T: Message> ConnectionObserver<T> for ClientSink<T> {
    fn on_disconnected(&self, connection: Option<&Arc<Connection<T>>>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(connection) = connection else {
            return;
        };
        let id = connection.id();

        {
            let mut slot = inner
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().map(|c| c.id()) == Some(id) {
                *slot = None;
            }
        }

        // After stop() the state already moved on; only an unplanned end of
        // the active session transitions here.
        let unplanned = inner.status.send_if_modified(|s| {
            if s.active == Some(id) {
                s.state = ClientState::Disconnected;
                s.active = None;
                s.disconnects += 1;
                true
            } else {
                false
            }
        });

        tracing::info!(id, "client disconnected");
        inner.observers.on_disconnected(Some(connection));

        if unplanned {
            inner.reconnect();
        }
    }

    fn on_message(&self, connection: &Arc<Connection<T>>, message: &T) {
        if let Some(inner) = self.inner.upgrade() {
            inner.observers.on_message(connection, message);
        }
    }

    fn on_error(&self, error: &IpcError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.observers.on_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = ClientBuilder::<String>::new("chat");
        assert_eq!(builder.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(!builder.auto_reconnect);
        assert_eq!(builder.policy, ReconnectPolicy::Immediate);
        assert_eq!(builder.directory, std::env::temp_dir());
    }

    #[test]
    fn test_builder_configuration() {
        let builder = ClientEndpoint::<String>::builder("chat")
            .directory("/run/chat")
            .connect_timeout(Duration::from_secs(1))
            .auto_reconnect(true)
            .reconnect_policy(ReconnectPolicy::backoff())
            .max_frame_size(1024);

        assert_eq!(builder.directory, PathBuf::from("/run/chat"));
        assert_eq!(builder.connect_timeout, Duration::from_secs(1));
        assert!(builder.auto_reconnect);
        assert_eq!(builder.policy, ReconnectPolicy::backoff());
        assert_eq!(builder.config.max_frame_size, 1024);
    }

    #[tokio::test]
    async fn test_push_without_connection() {
        let client = ClientEndpoint::<String>::builder("nobody").build();
        assert_eq!(client.state(), ClientState::Idle);

        let err = client.push(&"x".to_string()).await.unwrap_err();
        assert!(matches!(err, IpcError::NotConnected));
    }

    #[tokio::test]
    async fn test_waits_when_idle() {
        let client = ClientEndpoint::<String>::builder("nobody").build();

        assert!(client.wait_for_disconnected(None).await);
        assert!(
            !client
                .wait_for_connected(Some(Duration::from_millis(20)))
                .await
        );
    }

    #[tokio::test]
    async fn test_failed_handshake_ends_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let client = ClientEndpoint::<String>::builder("absent")
            .directory(dir.path())
            .connect_timeout(Duration::from_millis(50))
            .build();

        client.start();
        assert_eq!(client.state(), ClientState::Handshaking);
        assert!(
            client
                .wait_for_disconnected(Some(Duration::from_secs(5)))
                .await
        );
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_while_handshaking() {
        let dir = tempfile::tempdir().unwrap();
        let client = ClientEndpoint::<String>::builder("absent")
            .directory(dir.path())
            .auto_reconnect(true)
            .build();

        client.start();
        client.stop();
        assert_eq!(client.state(), ClientState::Disconnected);

        // Nothing restarts the handshake behind our back
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_superseded_handshake_failure_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (observer, mut events) = crate::events::notification_channel::<String>();
        let client = ClientEndpoint::<String>::builder("absent")
            .directory(dir.path())
            .connect_timeout(Duration::from_millis(50))
            .observer(observer)
            .build();

        client.start();
        client.stop();
        client.start();
        assert!(
            client
                .wait_for_disconnected(Some(Duration::from_secs(5)))
                .await
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut errors = 0;
        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                crate::events::Notification::Error(_) => errors += 1,
                crate::events::Notification::Disconnected(None) => disconnects += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!((errors, disconnects), (1, 1));
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
