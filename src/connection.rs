//! One live duplex session over a private channel.
//!
//! A [`Connection`] owns both halves of its channel:
//!
//! - the write half belongs to a writer task (see [`crate::writer`]); every
//!   [`push`](Connection::push) queues one frame and waits until it is flushed
//! - the read half is driven by a read loop started by
//!   [`open`](Connection::open)
//!
//! The read loop decodes one frame at a time and hands the message to a
//! dispatcher task before reading the next, so a slow observer never stalls
//! the channel. Messages reach observers strictly in arrival order.
//!
//! The loop ends on the end-of-stream sentinel (peer closed cleanly), on any
//! transport or decode error (reported through `on_error`, never propagated),
//! or when the connection is closed locally. Whatever the cause, the owner
//! sees exactly one `on_disconnected` for the connection, after the last
//! message has been dispatched.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::codec::{CodecFns, Message};
use crate::error::{IpcError, Result};
use crate::events::SharedObserver;
use crate::protocol::{FrameReader, DEFAULT_MAX_FRAME_SIZE};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Process-wide connection id source. Ids start at 1 and are never reused.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Per-connection settings shared by listener and client builders.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) writer: WriterConfig,
    pub(crate) max_frame_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// A live session with one peer.
///
/// Always handled as `Arc<Connection<T>>`. Once disconnected a connection is
/// never reopened; a new session gets a new `Connection` with a new id.
pub struct Connection<T> {
    id: u64,
    name: RwLock<String>,
    writer: WriterHandle,
    codec: CodecFns<T>,
    connected: AtomicBool,
    disconnect_notified: AtomicBool,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<BoxedReader>>,
    max_frame_size: u32,
    sink: SharedObserver<T>,
}

impl<T: Message> Connection<T> {
    /// Wrap a freshly attached channel. Spawns the writer task, so this must
    /// run inside a tokio runtime. Nothing is read until [`open`](Self::open).
    pub(crate) fn new<S>(
        stream: S,
        name: String,
        codec: CodecFns<T>,
        config: &ConnectionConfig,
        sink: SharedObserver<T>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, _writer_task) = spawn_writer_task(write_half, config.writer.clone());
        let (shutdown, _) = watch::channel(false);
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(id, name = %name, "connection created");

        Arc::new(Self {
            id,
            name: RwLock::new(name),
            writer,
            codec,
            connected: AtomicBool::new(true),
            disconnect_notified: AtomicBool::new(false),
            shutdown,
            reader: Mutex::new(Some(Box::new(read_half))),
            max_frame_size: config.max_frame_size,
            sink,
        })
    }

    /// Start the read loop. Returns immediately; idempotent.
    ///
    /// A connection closed before it was opened reads nothing; opening it
    /// reports its disconnect instead.
    pub fn open(self: &Arc<Self>) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return;
        };

        if !self.is_connected() {
            self.notify_disconnected();
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(self.clone(), reader, tx));
        tokio::spawn(dispatch_loop(self.clone(), rx));
    }

    /// Encode `message` and wait until it has been written and flushed.
    ///
    /// Concurrent pushes on the same connection are serialized by the writer
    /// task; frames never interleave.
    ///
    /// # Errors
    ///
    /// [`IpcError::ConnectionClosed`] once the connection is down, a codec
    /// error if `message` cannot be encoded, or
    /// [`IpcError::BackpressureTimeout`] if the write queue stays full.
    pub async fn push(&self, message: &T) -> Result<()> {
        let payload = self.encode(message)?;
        self.push_bytes(payload).await
    }

    pub(crate) fn encode(&self, message: &T) -> Result<Bytes> {
        Ok(Bytes::from((self.codec.encode)(message)?))
    }

    /// Push an already encoded payload; lets broadcast encode once.
    pub(crate) async fn push_bytes(&self, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(IpcError::ConnectionClosed);
        }

        let frame = OutboundFrame::new(payload)?;
        let result = self.writer.send(frame).await;

        if result.is_err() && self.writer.is_closed() {
            // The write side is gone; the session cannot continue.
            self.mark_disconnected();
        }

        result
    }
}

impl<T> Connection<T> {
    /// Unique, never reused identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Display name; the private channel name unless renamed.
    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the display name used by name-addressed pushes.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    /// Whether the channel is still usable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Close the channel. Idempotent.
    ///
    /// An open connection stops reading at its next frame boundary: a frame
    /// that has started to arrive is still read and delivered, an idle wait
    /// for the next frame is not. The disconnect is reported once queued
    /// messages have been dispatched. A connection that was never opened
    /// reports nothing until [`open`](Self::open) is called, so an owner
    /// that never announced it can drop it silently.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::debug!(id = self.id, "closing connection");
        }

        self.shutdown.send_replace(true);
        self.writer.close();
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
        self.writer.close();
    }

    fn notify_disconnected(self: &Arc<Self>) {
        if self.disconnect_notified.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(id = self.id, "connection disconnected");
        self.sink.on_disconnected(Some(self));
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn read_loop<T: Message>(
    connection: Arc<Connection<T>>,
    reader: BoxedReader,
    dispatch: mpsc::UnboundedSender<T>,
) {
    let mut frames = FrameReader::with_max_payload(reader, connection.max_frame_size);
    let mut shutdown = connection.shutdown.subscribe();
    let id = connection.id;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if !frames.in_frame() {
                    break;
                }
                // A frame is already arriving; finish it before exiting.
                frames.read_frame().await
            }
            frame = frames.read_frame() => frame,
        };

        let decoded = frame.and_then(|payload| match payload {
            Some(bytes) => (connection.codec.decode)(&bytes).map(Some),
            None => Ok(None),
        });

        match decoded {
            Ok(Some(message)) => {
                tracing::trace!(id, "message received");
                if dispatch.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(id, "peer closed the channel");
                break;
            }
            Err(e) => {
                if connection.is_connected() {
                    tracing::warn!(id, "Read loop error: {}", e);
                    connection.sink.on_error(&e);
                }
                break;
            }
        }
    }

    connection.mark_disconnected();
}

async fn dispatch_loop<T: Message>(
    connection: Arc<Connection<T>>,
    mut incoming: mpsc::UnboundedReceiver<T>,
) {
    while let Some(message) = incoming.recv().await {
        connection.sink.on_message(&connection, &message);
    }

    connection.notify_disconnected();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, MsgPackCodec};
    use crate::events::{notification_channel, Notification};
    use crate::protocol::write_frame;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn pair() -> (
        Arc<Connection<String>>,
        UnboundedReceiver<Notification<String>>,
        Arc<Connection<String>>,
        UnboundedReceiver<Notification<String>>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let codec = CodecFns::of::<MsgPackCodec>();
        let config = ConnectionConfig::default();

        let (obs_a, rx_a) = notification_channel::<String>();
        let (obs_b, rx_b) = notification_channel::<String>();
        let conn_a = Connection::new(a, "test_1".into(), codec, &config, obs_a);
        let conn_b = Connection::new(b, "test_1".into(), codec, &config, obs_b);
        (conn_a, rx_a, conn_b, rx_b)
    }

    async fn next(rx: &mut UnboundedReceiver<Notification<String>>) -> Notification<String> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("notification timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let (a, _ra, b, _rb) = pair();
        assert!(b.id() > a.id());
    }

    #[tokio::test]
    async fn test_push_preserves_order() {
        let (a, _ra, b, mut rb) = pair();
        a.open();
        b.open();

        for i in 0..50 {
            a.push(&format!("m{}", i)).await.unwrap();
        }

        for i in 0..50 {
            match next(&mut rb).await {
                Notification::Message(conn, text) => {
                    assert_eq!(conn.id(), b.id());
                    assert_eq!(text, format!("m{}", i));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_close_is_normal_disconnect() {
        let (a, mut ra, b, mut rb) = pair();
        a.open();
        b.open();

        a.close();

        assert!(matches!(next(&mut ra).await, Notification::Disconnected(Some(_))));
        assert!(matches!(next(&mut rb).await, Notification::Disconnected(Some(_))));
        assert!(!b.is_connected());

        // Clean EOF: no error was reported on either side
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_fires_once_under_racing_closes() {
        let (a, mut ra, b, _rb) = pair();
        a.open();
        b.open();

        let closers: Vec<_> = (0..8)
            .map(|_| {
                let a = a.clone();
                tokio::spawn(async move { a.close() })
            })
            .collect();
        b.close();
        for closer in closers {
            closer.await.unwrap();
        }

        assert!(matches!(next(&mut ra).await, Notification::Disconnected(Some(_))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_before_open_notifies() {
        let (a, mut ra, _b, _rb) = pair();
        a.close();
        a.close();
        a.open();

        assert!(matches!(next(&mut ra).await, Notification::Disconnected(Some(_))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_without_open_is_silent() {
        let (a, mut ra, _b, _rb) = pair();
        a.close();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ra.try_recv().is_err());
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let (a, _ra, _b, _rb) = pair();
        a.open();
        a.close();

        let err = a.push(&"late".to_string()).await.unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_decode_error_surfaces_and_ends_loop() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let (observer, mut rx) = notification_channel::<String>();
        let conn = Connection::new(
            peer,
            "test_1".into(),
            CodecFns::of::<MsgPackCodec>(),
            &ConnectionConfig::default(),
            observer,
        );
        conn.open();

        // 0xc1 is never valid MessagePack
        write_frame(&mut raw, &[0xc1]).await.unwrap();

        match next(&mut rx).await {
            Notification::Error(text) => assert!(text.contains("MsgPack")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next(&mut rx).await, Notification::Disconnected(Some(_))));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let (observer, mut rx) = notification_channel::<String>();
        let config = ConnectionConfig {
            max_frame_size: 8,
            ..Default::default()
        };
        let conn = Connection::new(
            peer,
            "test_1".into(),
            CodecFns::of::<MsgPackCodec>(),
            &config,
            observer,
        );
        conn.open();

        write_frame(&mut raw, &[0u8; 32]).await.unwrap();

        match next(&mut rx).await {
            Notification::Error(text) => assert!(text.contains("exceeds maximum")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next(&mut rx).await, Notification::Disconnected(Some(_))));
    }

    #[tokio::test]
    async fn test_close_finishes_frame_in_flight() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let (observer, mut rx) = notification_channel::<String>();
        let conn = Connection::new(
            peer,
            "test_1".into(),
            CodecFns::of::<MsgPackCodec>(),
            &ConnectionConfig::default(),
            observer,
        );
        conn.open();

        let payload = MsgPackCodec::encode(&"late".to_string()).unwrap();
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);
        let (head, rest) = frame.split_at(3);

        raw.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();
        raw.write_all(rest).await.unwrap();

        match next(&mut rx).await {
            Notification::Message(_, text) => assert_eq!(text, "late"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next(&mut rx).await, Notification::Disconnected(Some(_))));
    }

    #[tokio::test]
    async fn test_set_name() {
        let (a, _ra, _b, _rb) = pair();
        assert_eq!(a.name(), "test_1");
        a.set_name("alice");
        assert_eq!(a.name(), "alice");
    }
}
