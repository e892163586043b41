//! Opaque access-control capability for pipe creation.
//!
//! The listener carries a [`SharedSecurity`] from the caller down to every
//! channel it creates (rendezvous and private), without looking inside it.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Hook applied to every endpoint right after the transport creates it.
pub trait PipeSecurity: Send + Sync + fmt::Debug {
    /// Secure a freshly created endpoint (socket path or pipe name).
    ///
    /// # Errors
    ///
    /// An error aborts creation of that endpoint.
    fn secure(&self, endpoint: &str) -> io::Result<()>;
}

/// Shared handle to a security capability.
pub type SharedSecurity = Arc<dyn PipeSecurity>;

/// Applies a file mode to the socket file of each endpoint.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixPermissions(pub u32);

#[cfg(unix)]
impl PipeSecurity for UnixPermissions {
    fn secure(&self, endpoint: &str) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(endpoint, std::fs::Permissions::from_mode(self.0))
    }
}
