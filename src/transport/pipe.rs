//! Platform-specific pipe/socket implementation.
//!
//! - Unix: Unix Domain Socket, one socket file per instance
//! - Windows: Named Pipe, one pipe instance per accept
//!
//! # Example
//!
//! ```ignore
//! use pipelink::transport::{connect, endpoint_path, PipeServer};
//!
//! let path = endpoint_path(&std::env::temp_dir(), "chat");
//! let server = PipeServer::create(&path, None)?;
//! let stream = server.accept().await?;
//! ```

use std::io;
use std::path::Path;

/// Resolve an endpoint name to its platform address.
///
/// Format:
/// - Unix: `{directory}/{name}.sock`
/// - Windows: `\\.\pipe\{name}` (directory is ignored)
pub fn endpoint_path(directory: &Path, name: &str) -> String {
    #[cfg(unix)]
    {
        directory
            .join(format!("{}.sock", name))
            .to_string_lossy()
            .into_owned()
    }

    #[cfg(windows)]
    {
        let _ = directory;
        format!(r"\\.\pipe\{}", name)
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::{UnixListener, UnixStream};

    use crate::error::Result;
    use crate::transport::SharedSecurity;

    /// One listening instance; admits a single client.
    pub struct PipeServer {
        listener: UnixListener,
        path: String,
    }

    /// Connected duplex stream.
    #[derive(Debug)]
    pub struct PipeStream {
        stream: UnixStream,
    }

    impl PipeServer {
        /// Create an instance at `path`.
        ///
        /// Removes any stale socket file at the path before binding.
        pub fn create(path: &str, security: Option<&SharedSecurity>) -> Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;
            let server = Self {
                listener,
                path: path.to_string(),
            };

            // Dropping `server` on error unlinks the socket file.
            if let Some(security) = security {
                security.secure(path)?;
            }

            Ok(server)
        }

        /// Wait for the one client of this instance.
        ///
        /// The instance is consumed; its socket file is removed as soon as the
        /// client is in, so later connectors see the endpoint as absent.
        pub async fn accept(self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(PipeStream { stream })
        }

        /// Get the socket path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeServer {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Open a client connection to an existing instance (single attempt).
    pub async fn connect(path: &str) -> io::Result<PipeStream> {
        let stream = UnixStream::connect(path).await?;
        Ok(PipeStream { stream })
    }

    /// Errors that mean "no free instance right now, try again".
    pub fn is_retryable(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::NotFound
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
        )
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };
    use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

    use crate::error::Result;
    use crate::transport::SharedSecurity;

    /// One named pipe instance; admits a single client.
    pub struct PipeServer {
        pipe: NamedPipeServer,
        path: String,
    }

    /// Connected duplex stream, server or client end.
    pub enum PipeStream {
        /// Server end of an accepted instance.
        Server(NamedPipeServer),
        /// Client end.
        Client(NamedPipeClient),
    }

    impl PipeServer {
        /// Create a pipe instance at `path`.
        ///
        /// Fails if another process already owns an instance with that name.
        pub fn create(path: &str, security: Option<&SharedSecurity>) -> Result<Self> {
            let pipe = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)?;

            if let Some(security) = security {
                security.secure(path)?;
            }

            Ok(Self {
                pipe,
                path: path.to_string(),
            })
        }

        /// Wait for the one client of this instance.
        pub async fn accept(self) -> Result<PipeStream> {
            self.pipe.connect().await?;
            Ok(PipeStream::Server(self.pipe))
        }

        /// Get the pipe path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    /// Open a client connection to an existing instance (single attempt).
    pub async fn connect(path: &str) -> io::Result<PipeStream> {
        let client = ClientOptions::new().open(path)?;
        Ok(PipeStream::Client(client))
    }

    /// Errors that mean "no free instance right now, try again".
    pub fn is_retryable(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::NotFound
            || err.raw_os_error() == Some(ERROR_PIPE_BUSY as i32)
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => std::pin::Pin::new(pipe).poll_read(cx, buf),
                PipeStream::Client(pipe) => std::pin::Pin::new(pipe).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => std::pin::Pin::new(pipe).poll_write(cx, buf),
                PipeStream::Client(pipe) => std::pin::Pin::new(pipe).poll_write(cx, buf),
            }
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => std::pin::Pin::new(pipe).poll_flush(cx),
                PipeStream::Client(pipe) => std::pin::Pin::new(pipe).poll_flush(cx),
            }
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => std::pin::Pin::new(pipe).poll_shutdown(cx),
                PipeStream::Client(pipe) => std::pin::Pin::new(pipe).poll_shutdown(cx),
            }
        }
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{connect, is_retryable, PipeServer, PipeStream};

#[cfg(windows)]
pub use windows_impl::{connect, is_retryable, PipeServer, PipeStream};

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_endpoint_path_format() {
        let path = endpoint_path(Path::new("/tmp"), "chat_3");

        #[cfg(unix)]
        assert_eq!(path, "/tmp/chat_3.sock");

        #[cfg(windows)]
        assert_eq!(path, r"\\.\pipe\chat_3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_client_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = endpoint_path(dir.path(), "solo");

        let server = PipeServer::create(&path, None).unwrap();
        let (accepted, client) = tokio::join!(server.accept(), connect(&path));
        let mut accepted = accepted.unwrap();
        let mut client = client.unwrap();

        // Instance consumed: the endpoint is gone for the next connector
        let err = connect(&path).await.err().unwrap();
        assert!(is_retryable(&err));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = endpoint_path(dir.path(), "gone");

        let server = PipeServer::create(&path, None).unwrap();
        assert!(Path::new(server.path()).exists());
        drop(server);
        assert!(!Path::new(&path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = endpoint_path(dir.path(), "stale");
        std::fs::write(&path, b"leftover").unwrap();

        assert!(PipeServer::create(&path, None).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_security_hook_runs_on_create() {
        use crate::transport::{PipeSecurity, SharedSecurity};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        #[derive(Debug, Default)]
        struct Counting(AtomicUsize);

        impl PipeSecurity for Counting {
            fn secure(&self, _endpoint: &str) -> io::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let counting = Arc::new(Counting::default());
        let security: SharedSecurity = counting.clone();

        let _a = PipeServer::create(&endpoint_path(dir.path(), "a"), Some(&security)).unwrap();
        let _b = PipeServer::create(&endpoint_path(dir.path(), "b"), Some(&security)).unwrap();

        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }
}
