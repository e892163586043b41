//! Frame reading and single-frame writes.
//!
//! [`FrameReader`] pulls exactly one frame per call. A clean close on a frame
//! boundary is the end-of-stream sentinel (`Ok(None)`); a close in the middle
//! of a frame is an `UnexpectedEof` I/O error.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use crate::error::{IpcError, Result};

/// Reads length-prefixed frames from an async byte stream.
///
/// Progress on a partially received frame is kept across calls, so a
/// `read_frame` future may be dropped and the next call resumes where it
/// stopped.
pub struct FrameReader<R> {
    reader: R,
    max_payload_size: u32,
    header: [u8; HEADER_SIZE],
    header_filled: usize,
    payload: Option<BytesMut>,
    payload_filled: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default frame limit.
    pub fn new(reader: R) -> Self {
        Self::with_max_payload(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a reader with a custom frame limit.
    pub fn with_max_payload(reader: R, max_payload_size: u32) -> Self {
        Self {
            reader,
            max_payload_size,
            header: [0u8; HEADER_SIZE],
            header_filled: 0,
            payload: None,
            payload_filled: 0,
        }
    }

    /// Whether some bytes of the next frame have already arrived.
    pub fn in_frame(&self) -> bool {
        self.header_filled > 0
    }

    /// Read one complete frame payload.
    ///
    /// Returns `Ok(None)` when the peer closed between frames. Cancel safe.
    ///
    /// # Errors
    ///
    /// I/O errors, a truncated frame, or a header above the frame limit.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        while self.header_filled < HEADER_SIZE {
            let n = self.reader.read(&mut self.header[self.header_filled..]).await?;
            if n == 0 {
                if self.header_filled == 0 {
                    return Ok(None);
                }
                return Err(truncated("peer closed inside a frame header"));
            }
            self.header_filled += n;
        }

        if self.payload.is_none() {
            let header = Header::decode(&self.header);
            if let Err(e) = header.validate(self.max_payload_size) {
                self.header_filled = 0;
                return Err(e);
            }
            self.payload = Some(BytesMut::zeroed(header.payload_length as usize));
            self.payload_filled = 0;
        }

        if let Some(payload) = self.payload.as_mut() {
            while self.payload_filled < payload.len() {
                let n = self.reader.read(&mut payload[self.payload_filled..]).await?;
                if n == 0 {
                    return Err(truncated("peer closed inside a frame payload"));
                }
                self.payload_filled += n;
            }
        }

        self.header_filled = 0;
        let payload = self.payload.take().unwrap_or_default();
        Ok(Some(payload.freeze()))
    }
}

fn truncated(context: &'static str) -> IpcError {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, context).into()
}

/// Write one frame and flush it.
///
/// Used on the rendezvous channel, where a single frame is written before
/// the channel is closed. Established connections go through the writer task.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let header = Header::for_payload(payload)?;
    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_single_frame() {
        let (mut a, b) = duplex(64);
        write_frame(&mut a, b"chat_1").await.unwrap();

        let mut reader = FrameReader::new(b);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"chat_1");
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut a, b) = duplex(1024);
        for text in ["one", "two", "three"] {
            write_frame(&mut a, text.as_bytes()).await.unwrap();
        }
        drop(a);

        let mut reader = FrameReader::new(b);
        assert_eq!(&reader.read_frame().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&reader.read_frame().await.unwrap().unwrap()[..], b"two");
        assert_eq!(&reader.read_frame().await.unwrap().unwrap()[..], b"three");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_eof_is_sentinel() {
        let (a, b) = duplex(64);
        drop(a);

        let mut reader = FrameReader::new(b);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_error() {
        let (mut a, b) = duplex(64);
        a.write_all(&Header::new(10).encode()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let mut reader = FrameReader::new(b);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, IpcError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, b) = duplex(64);
        a.write_all(&Header::new(1000).encode()).await.unwrap();

        let mut reader = FrameReader::with_max_payload(b, 100);
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.is_decode());
    }

    #[tokio::test]
    async fn test_empty_payload_frame() {
        let (mut a, b) = duplex(64);
        write_frame(&mut a, b"").await.unwrap();

        let mut reader = FrameReader::new(b);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_read_resumes_mid_frame() {
        let (mut a, b) = duplex(64);
        let mut reader = FrameReader::new(b);

        a.write_all(&[0, 0, 0, 5, b'h', b'e']).await.unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), reader.read_frame()).await;
        assert!(pending.is_err());
        assert!(reader.in_frame());

        a.write_all(b"llo").await.unwrap();
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(!reader.in_frame());
    }
}
