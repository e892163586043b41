//! Server side: admits clients on a well-known name.
//!
//! The accept loop runs on its own task:
//!
//! 1. create the rendezvous instance `N` and wait for a client
//! 2. allocate the next private name `N_k` and pre-create that instance
//! 3. send the name, wait for the client to drain it, close `N`
//! 4. hand `N_k` to a separate task that waits for the client to attach,
//!    registers the [`Connection`] and starts its read loop
//!
//! Step 4 runs concurrently with the next iteration, so a new rendezvous
//! instance is ready while earlier clients are still attaching. A failure in
//! steps 1-4 drops whatever was created, reports the error through
//! `on_error`, emits `on_disconnected(None)` and moves on.
//!
//! [`Listener::stop`] cancels the loop through a shutdown signal that every
//! blocking step selects on, so no loopback connection is needed to unblock
//! a pending accept.
//!
//! # Example
//!
//! ```ignore
//! use pipelink::{Listener, ConnectionObserver};
//!
//! let listener = Listener::<String>::builder("chat").build();
//! listener.subscribe(my_observer);
//! listener.start()?;
//! listener.broadcast(&"hello".to_string()).await?;
//! listener.stop().await;
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::{Codec, CodecFns, Message, MsgPackCodec};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{IpcError, Result};
use crate::events::{ConnectionObserver, Observers, SharedObserver};
use crate::handshake::{send_private_name, NameAllocator};
use crate::registry::ConnectionRegistry;
use crate::transport::{endpoint_path, PipeServer, PipeStream, SharedSecurity};
use crate::writer::WriterConfig;

/// Default bound for each handshake step on the listener side.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before retrying when the rendezvous instance cannot be created.
const RECREATE_DELAY: Duration = Duration::from_millis(100);

/// Builder for a [`Listener`].
pub struct ListenerBuilder<T> {
    name: String,
    directory: PathBuf,
    security: Option<SharedSecurity>,
    handshake_timeout: Duration,
    config: ConnectionConfig,
    codec: CodecFns<T>,
    name_codec: CodecFns<String>,
    observers: Vec<SharedObserver<T>>,
}

impl<T: Message> ListenerBuilder<T> {
    /// Start configuring a listener for the well-known name `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: std::env::temp_dir(),
            security: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            config: ConnectionConfig::default(),
            codec: CodecFns::of::<MsgPackCodec>(),
            name_codec: CodecFns::of::<MsgPackCodec>(),
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

    /// Capability forwarded to every channel the listener creates.
    pub fn security(mut self, security: SharedSecurity) -> Self {
        self.security = Some(security);
        self
    }

    /// Bound for the rendezvous drain and for the client attaching to its
    /// private channel.
    ///
    /// Default: 5 seconds
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Writer settings for every admitted connection.
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

    /// Message codec, also used for the rendezvous name frame.
    ///
    /// Default: [`MsgPackCodec`]
    pub fn codec<C: Codec>(mut self) -> Self {
        self.codec = CodecFns::of::<C>();
        self.name_codec = CodecFns::of::<C>();
        self
    }

    /// Subscribe an observer before the listener starts.
    pub fn observer(mut self, observer: SharedObserver<T>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the listener. Nothing is created until [`Listener::start`].
    pub fn build(self) -> Listener<T> {
        let observers = Observers::new();
        for observer in self.observers {
            observers.subscribe(observer);
        }
        let (shutdown, _) = watch::channel(false);

        Listener {
            inner: Arc::new(ListenerInner {
                names: NameAllocator::new(self.name.clone()),
                name: self.name,
                directory: self.directory,
                security: self.security,
                handshake_timeout: self.handshake_timeout,
                config: self.config,
                codec: self.codec,
                name_codec: self.name_codec,
                registry: ConnectionRegistry::new(self.codec),
                observers,
                shutdown,
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }
}

/// Accepts clients on a well-known name and keeps the live connections.
pub struct Listener<T> {
    inner: Arc<ListenerInner<T>>,
}

struct ListenerInner<T> {
    name: String,
    directory: PathBuf,
    security: Option<SharedSecurity>,
    handshake_timeout: Duration,
    config: ConnectionConfig,
    codec: CodecFns<T>,
    name_codec: CodecFns<String>,
    names: NameAllocator,
    registry: ConnectionRegistry<T>,
    observers: Observers<T>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Message> Listener<T> {
    /// Start configuring a listener.
    pub fn builder(name: impl Into<String>) -> ListenerBuilder<T> {
        ListenerBuilder::new(name)
    }

    /// Create the first rendezvous instance and spawn the accept loop.
    ///
    /// Returns immediately; no-op if already running. Must be called inside a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// If the rendezvous endpoint cannot be created.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let rendezvous = match self.inner.create_rendezvous() {
            Ok(server) => server,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(e);
            }
        };

        self.inner.shutdown.send_replace(false);
        let task = tokio::spawn(accept_loop(self.inner.clone(), rendezvous));
        *self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::info!(name = %self.inner.name, endpoint = %self.endpoint(), "listener started");
        Ok(())
    }

    /// Stop accepting, close every registered connection and wait for the
    /// accept loop to exit. Idempotent.
    pub async fn stop(&self) {
        self.inner.halt();

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Add an observer.
    pub fn subscribe(&self, observer: SharedObserver<T>) {
        self.inner.observers.subscribe(observer);
    }

    /// Push to every connected client. Returns how many received it.
    ///
    /// See [`ConnectionRegistry::broadcast`].
    pub async fn broadcast(&self, message: &T) -> Result<usize> {
        self.inner.registry.broadcast(message).await
    }

    /// Push to the client whose connection carries `name`.
    ///
    /// # Errors
    ///
    /// [`IpcError::UnknownConnection`] if there is none.
    pub async fn push_to(&self, message: &T, name: &str) -> Result<()> {
        self.inner.registry.push_to(message, name).await
    }

    /// Live connections, ordered by id.
    pub fn connections(&self) -> Vec<Arc<Connection<T>>> {
        self.inner.registry.snapshot()
    }

    /// Look up a live connection.
    pub fn connection(&self, id: u64) -> Option<Arc<Connection<T>>> {
        self.inner.registry.get(id)
    }

    /// The connection table.
    pub fn registry(&self) -> &ConnectionRegistry<T> {
        &self.inner.registry
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether no client is connected.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The well-known name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Platform address of the rendezvous endpoint.
    pub fn endpoint(&self) -> String {
        endpoint_path(&self.inner.directory, &self.inner.name)
    }
}

impl<T> Drop for Listener<T> {
    fn drop(&mut self) {
        self.inner.halt();
    }
}

impl<T> ListenerInner<T> {
    fn halt(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.shutdown.send_replace(true);

        self.registry.close_all();

        if was_running {
            tracing::info!(name = %self.name, "listener stopped");
        }
    }
}

impl<T: Message> ListenerInner<T> {
    fn create_rendezvous(&self) -> Result<PipeServer> {
        PipeServer::create(
            &endpoint_path(&self.directory, &self.name),
            self.security.as_ref(),
        )
    }

    fn admission_failed(&self, stage: &str, error: IpcError) {
        let error = match error {
            IpcError::Handshake(_) => error,
            other => IpcError::Handshake(format!("{}: {}", stage, other)),
        };
        tracing::warn!(name = %self.name, "{}", error);
        self.observers.on_error(&error);
        self.observers.on_disconnected(None);
    }

    /// Steps 2 and 3 for one attached rendezvous client. Returns the private
    /// instance, ready to be accepted.
    async fn redirect(&self, rendezvous: PipeStream) -> Result<(String, PipeServer)> {
        let private_name = self.names.next_name();
        let private = PipeServer::create(
            &endpoint_path(&self.directory, &private_name),
            self.security.as_ref(),
        )?;

        tracing::debug!(private = %private_name, "redirecting client");
        send_private_name(
            rendezvous,
            &private_name,
            &self.name_codec,
            self.handshake_timeout,
        )
        .await?;

        Ok((private_name, private))
    }
}

async fn accept_loop<T: Message>(inner: Arc<ListenerInner<T>>, first: PipeServer) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut next_instance = Some(first);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let rendezvous = match next_instance.take() {
            Some(server) => server,
            None => match inner.create_rendezvous() {
                Ok(server) => server,
                Err(e) => {
                    inner.admission_failed("create rendezvous", e);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(RECREATE_DELAY) => continue,
                    }
                }
            },
        };

        let attached = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            attached = rendezvous.accept() => attached,
        };
        let stream = match attached {
            Ok(stream) => stream,
            Err(e) => {
                inner.admission_failed("rendezvous accept", e);
                continue;
            }
        };

        let redirected = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            redirected = inner.redirect(stream) => redirected,
        };
        match redirected {
            Ok((private_name, private)) => {
                tokio::spawn(admit(inner.clone(), private_name, private));
            }
            Err(e) => inner.admission_failed("rendezvous", e),
        }
    }

    tracing::debug!(name = %inner.name, "accept loop exited");
}

/// Step 4: wait for the client on its private channel and register it.
async fn admit<T: Message>(inner: Arc<ListenerInner<T>>, private_name: String, private: PipeServer) {
    let mut shutdown = inner.shutdown.subscribe();
    if *shutdown.borrow() {
        return;
    }

    let attach = tokio::time::timeout(inner.handshake_timeout, private.accept());
    let stream = tokio::select! {
        biased;
        _ = shutdown.changed() => return,
        attached = attach => match attached {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                inner.admission_failed("private accept", e);
                return;
            }
            Err(_) => {
                inner.admission_failed("private accept", IpcError::Timeout("private channel attach"));
                return;
            }
        },
    };

    let sink: SharedObserver<T> = Arc::new(ListenerSink {
        inner: Arc::downgrade(&inner),
    });
    let connection = Connection::new(stream, private_name, inner.codec, &inner.config, sink);
    inner.registry.add(connection.clone());

    // stop() may have drained the registry just before the add. Never
    // opened and never announced, the connection closes silently.
    if !inner.running.load(Ordering::Acquire) {
        inner.registry.remove(connection.id());
        connection.close();
        return;
    }

    tracing::info!(id = connection.id(), name = %connection.name(), "client admitted");
    inner.observers.on_connected(&connection);
    connection.open();
}

/// Routes connection events to the listener's observers and keeps the
/// registry in step with disconnects.
struct ListenerSink<T> {
    inner: Weak<ListenerInner<T>>,
}

impl<T: Message> ConnectionObserver<T> for ListenerSink<T> {
    fn on_disconnected(&self, connection: Option<&Arc<Connection<T>>>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Some(connection) = connection {
            inner.registry.remove(connection.id());
            tracing::info!(id = connection.id(), "client disconnected");
        }
        inner.observers.on_disconnected(connection);
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
    fn test_builder_configuration() {
        let builder = Listener::<String>::builder("chat")
            .directory("/run/chat")
            .handshake_timeout(Duration::from_secs(1))
            .max_frame_size(4096)
            .codec::<crate::codec::JsonCodec>();

        assert_eq!(builder.name, "chat");
        assert_eq!(builder.directory, PathBuf::from("/run/chat"));
        assert_eq!(builder.handshake_timeout, Duration::from_secs(1));
        assert_eq!(builder.config.max_frame_size, 4096);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let listener = Listener::<String>::builder("idem")
            .directory(dir.path())
            .build();

        listener.start().unwrap();
        listener.start().unwrap();
        assert!(listener.is_running());

        listener.stop().await;
        listener.stop().await;
        assert!(!listener.is_running());
        assert!(listener.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_unblocks_pending_accept() {
        let dir = tempfile::tempdir().unwrap();
        let listener = Listener::<String>::builder("idle")
            .directory(dir.path())
            .build();
        listener.start().unwrap();

        let endpoint = listener.endpoint();
        assert!(Path::new(&endpoint).exists());

        tokio::time::timeout(Duration::from_secs(5), listener.stop())
            .await
            .expect("stop blocked on accept");
        assert!(!Path::new(&endpoint).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_fails_on_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let listener = Listener::<String>::builder("nowhere")
            .directory(dir.path().join("missing"))
            .build();

        assert!(listener.start().is_err());
        assert!(!listener.is_running());
    }
}
