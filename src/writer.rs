//! Dedicated writer task, the single writer of a connection's channel.
//!
//! Every producer of a connection hands frames to one writer task over an
//! mpsc channel, so concurrent pushes can never interleave partial writes.
//!
//! # Architecture
//!
//! ```text
//! push (task 1) ─┐
//! push (task 2) ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Pipe
//! broadcast     ─┘               ▲                      │
//!                                └─── oneshot (drained) ┘
//! ```
//!
//! A frame's completion signal fires only after the batch containing it was
//! written and flushed, which is what `push` waits on. Closing the handle
//! drops whatever is still queued and shuts the write side down.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{IpcError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the pipe.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (4 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes.
    pub payload: Bytes,
    /// Fired once the frame has been flushed.
    done: Option<oneshot::Sender<()>>,
}

impl OutboundFrame {
    /// Create a new outbound frame around an encoded payload.
    pub fn new(payload: Bytes) -> Result<Self> {
        let header = Header::for_payload(&payload)?;
        Ok(Self {
            header: header.encode(),
            payload,
            done: None,
        })
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    shutdown: Arc<watch::Sender<bool>>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        shutdown: Arc<watch::Sender<bool>>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            shutdown,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a frame and wait until it has been written and flushed.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    ///
    /// # Errors
    ///
    /// [`IpcError::ConnectionClosed`] if the writer task is gone or failed
    /// before the frame was flushed, [`IpcError::BackpressureTimeout`] if the
    /// queue stayed full.
    pub async fn send(&self, mut frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        let (done_tx, done_rx) = oneshot::channel();
        frame.done = Some(done_tx);

        self.pending.fetch_add(1, Ordering::AcqRel);

        if self.tx.send(frame).await.is_err() {
            self.pending.fetch_sub(1, Ordering::Release);
            return Err(IpcError::ConnectionClosed);
        }

        done_rx.await.map_err(|_| IpcError::ConnectionClosed)
    }

    /// Ask the writer task to shut the write side down and exit.
    ///
    /// Idempotent. Frames still queued are dropped and their senders see
    /// [`IpcError::ConnectionClosed`].
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether the writer task has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(IpcError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The `JoinHandle` resolves when the task exits: cleanly after
/// [`WriterHandle::close`] or once every handle is dropped, with an error if
/// a write failed.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        Arc::new(shutdown_tx),
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, shutdown_rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut shutdown: watch::Receiver<bool>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let first = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let written = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        if let Err(e) = written {
            // Dropping the batch drops its completion senders; waiters see a closed channel.
            tracing::debug!("Writer task stopping after write error: {}", e);
            return Err(e);
        }

        for frame in &mut batch {
            if let Some(done) = frame.done.take() {
                let _ = done.send(());
            }
        }
    }

    rx.close();
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored), then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(IpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        let header_start = skipped;
        let header_end = skipped + HEADER_SIZE;

        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header[start_in_header..]));
        }
        skipped = header_end;

        if !frame.payload.is_empty() {
            let payload_start = skipped;
            let payload_end = skipped + frame.payload.len();

            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(payload_start);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            skipped = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameReader;
    use std::io::Cursor;
    use tokio::io::duplex;

    fn frame(text: &'static str) -> OutboundFrame {
        OutboundFrame::new(Bytes::from_static(text.as_bytes())).unwrap()
    }

    #[test]
    fn test_outbound_frame_size() {
        let f = frame("hello");
        assert_eq!(f.header, [0, 0, 0, 5]);
        assert_eq!(f.size(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_send_returns_after_flush() {
        let (client, server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(frame("hello")).await.unwrap();
        assert_eq!(handle.pending_count(), 0);

        let mut reader = FrameReader::new(server);
        let payload = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (client, server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let payload = Bytes::from(vec![i; 100]);
                    handle.send(OutboundFrame::new(payload).unwrap()).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        handle.close();

        let mut reader = FrameReader::new(server);
        let mut count = 0;
        while let Some(payload) = reader.read_frame().await.unwrap() {
            assert_eq!(payload.len(), 100);
            assert!(payload.iter().all(|b| *b == payload[0]));
            count += 1;
        }
        assert_eq!(count, 160);
    }

    #[tokio::test]
    async fn test_close_shuts_down_write_side() {
        let (client, server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(frame("last")).await.unwrap();
        handle.close();
        assert!(task.await.unwrap().is_ok());

        let mut reader = FrameReader::new(server);
        assert_eq!(&reader.read_frame().await.unwrap().unwrap()[..], b"last");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.close();
        handle.close();
        task.await.unwrap().unwrap();

        let result = handle.send(frame("late")).await;
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_send_fails_when_peer_gone() {
        let (client, server) = duplex(16);
        drop(server);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let result = handle.send(frame("nobody listening")).await;
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_backpressure_timeout() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let (shutdown, _shutdown_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(4));
        let handle = WriterHandle::new(tx, Arc::new(shutdown), pending, 4, Duration::from_millis(5));

        assert!(handle.is_backpressure_active());
        let result = handle.send(frame("blocked")).await;
        assert!(matches!(result, Err(IpcError::BackpressureTimeout)));
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![frame("hello")];

        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 2);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_inside_second_frame() {
        let batch = vec![frame("abc"), frame("defg")];

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 3 + HEADER_SIZE + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(&slices[0][..], b"efg");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| frame("abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }
}
