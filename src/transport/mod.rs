//! Transport module - single-client pipe instances.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS), one bound socket file per instance
//! - Named Pipes (Windows), one pipe instance per accept
//!
//! Both behave like the Windows primitive: a [`PipeServer`] admits exactly one
//! client and is consumed by [`PipeServer::accept`].

mod pipe;
mod security;

pub use pipe::{connect, endpoint_path, is_retryable, PipeServer, PipeStream};
pub use security::{PipeSecurity, SharedSecurity};

#[cfg(unix)]
pub use security::UnixPermissions;
