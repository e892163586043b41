//! Rendezvous handshake.
//!
//! A listener owns one well-known endpoint `N`. Each client that attaches to
//! it is handed a fresh private name `N_k` and then reconnects there:
//!
//! ```text
//! client                         listener
//!   │ connect N ─────────────────► accept N
//!   │                              create N_k (not yet accepted)
//!   │ ◄──────────── frame("N_k") ─ send, shut down write side
//!   │ close N ───────────────────► drained, close N
//!   │ connect N_k ───────────────► accept N_k → Connection
//! ```
//!
//! The name frame is encoded with the listener's message codec.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::codec::CodecFns;
use crate::error::{IpcError, Result};
use crate::protocol::{write_frame, FrameReader};
use crate::transport::{connect, endpoint_path, is_retryable, PipeStream};

const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(5);
const RETRY_MAX_INTERVAL: Duration = Duration::from_millis(200);

/// Hands out `base_1, base_2, ...` in strictly increasing order.
#[derive(Debug)]
pub(crate) struct NameAllocator {
    base: String,
    issued: AtomicU64,
}

impl NameAllocator {
    pub(crate) fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            issued: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_name(&self) -> String {
        let k = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}", self.base, k)
    }
}

/// Listener half: send `private_name` over an attached rendezvous stream and
/// wait until the client has drained it and hung up.
pub(crate) async fn send_private_name(
    mut rendezvous: PipeStream,
    private_name: &str,
    codec: &CodecFns<String>,
    timeout: Duration,
) -> Result<()> {
    let payload = (codec.encode)(&private_name.to_string())?;

    let exchange = async {
        write_frame(&mut rendezvous, &payload).await?;
        rendezvous.shutdown().await?;

        let mut scratch = [0u8; 64];
        loop {
            match rendezvous.read(&mut scratch).await {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                // The client hanging up is exactly what we wait for.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(()),
                Err(e) => return Err(IpcError::from(e)),
            }
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| IpcError::Timeout("rendezvous drain"))?
}

/// Client half: obtain a private name from the rendezvous endpoint `name`
/// and attach to that private channel.
///
/// Retries while the endpoint is absent or busy, and when a rendezvous closes
/// before delivering a name. The whole exchange is bounded by `timeout`.
pub(crate) async fn connect_private(
    directory: &Path,
    name: &str,
    codec: &CodecFns<String>,
    timeout: Duration,
    max_frame_size: u32,
) -> Result<(String, PipeStream)> {
    let rendezvous_path = endpoint_path(directory, name);

    let exchange = async {
        let mut backoff = retry_backoff();

        let private_name = loop {
            match request_name(&rendezvous_path, codec, max_frame_size).await {
                Ok(Some(private_name)) => break private_name,
                Ok(None) => {
                    tracing::trace!(endpoint = %rendezvous_path, "rendezvous unavailable, retrying");
                }
                Err(e) => return Err(e),
            }
            pause(&mut backoff).await;
        };

        tracing::debug!(private = %private_name, "private name received");
        let private_path = endpoint_path(directory, &private_name);

        let mut backoff = retry_backoff();
        let stream = loop {
            match connect(&private_path).await {
                Ok(stream) => break stream,
                Err(e) if is_retryable(&e) => pause(&mut backoff).await,
                Err(e) => return Err(IpcError::from(e)),
            }
        };

        Ok((private_name, stream))
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| IpcError::Timeout("handshake"))?
}

/// One rendezvous attempt. `Ok(None)` means "try again".
async fn request_name(
    rendezvous_path: &str,
    codec: &CodecFns<String>,
    max_frame_size: u32,
) -> Result<Option<String>> {
    let stream = match connect(rendezvous_path).await {
        Ok(stream) => stream,
        Err(e) if is_retryable(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut frames = FrameReader::with_max_payload(stream, max_frame_size);
    let payload = match frames.read_frame().await {
        Ok(Some(payload)) => payload,
        // Instance recycled before it got to us.
        Ok(None) => return Ok(None),
        Err(IpcError::Io(e)) if is_retryable(&e) => return Ok(None),
        Err(e) => return Err(IpcError::Handshake(e.to_string())),
    };

    // Dropping the stream here is the client's hang-up the listener waits on.
    drop(frames);

    let private_name =
        (codec.decode)(&payload).map_err(|e| IpcError::Handshake(e.to_string()))?;
    validate_private_name(&private_name)?;
    Ok(Some(private_name))
}

fn validate_private_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(IpcError::Handshake(format!(
            "invalid private channel name {:?}",
            name
        )));
    }
    Ok(())
}

fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: RETRY_INITIAL_INTERVAL,
        initial_interval: RETRY_INITIAL_INTERVAL,
        max_interval: RETRY_MAX_INTERVAL,
        // The caller's timeout bounds the retries.
        max_elapsed_time: None,
        ..Default::default()
    }
}

async fn pause(backoff: &mut ExponentialBackoff) {
    let delay = backoff.next_backoff().unwrap_or(RETRY_MAX_INTERVAL);
    tokio::time::sleep(delay).await;
}
