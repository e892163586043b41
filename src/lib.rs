//! # pipelink
//!
//! Multi-client duplex IPC over single-instance named pipes.
//!
//! A named pipe instance admits exactly one client. pipelink lets any number
//! of clients reach one well-known name anyway: the [`Listener`] hands each
//! client that attaches to `N` a private channel `N_1`, `N_2`, ... and the
//! client reconnects there. Each private channel becomes a [`Connection`]
//! carrying typed messages in both directions.
//!
//! ## Architecture
//!
//! - **Rendezvous** (`N`): one frame, the private channel name, then closed
//! - **Data channel** (`N_k`): length-prefixed frames encoded by a [`Codec`]
//! - **Events**: [`ConnectionObserver`] callbacks for connect, disconnect,
//!   message and contained errors
//!
//! On Unix each channel is a Unix domain socket file in a configurable
//! directory; on Windows it is a named pipe under `\\.\pipe\`.
//!
//! ## Example
//!
//! ```ignore
//! use pipelink::{ClientEndpoint, Listener};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> pipelink::Result<()> {
//!     let listener = Listener::<String>::builder("chat").build();
//!     listener.start()?;
//!
//!     let client = ClientEndpoint::<String>::builder("chat").build();
//!     client.start();
//!     client.wait_for_connected(Some(Duration::from_secs(5))).await;
//!
//!     listener.broadcast(&"hello".to_string()).await?;
//!     client.stop();
//!     listener.stop().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transport;
pub mod writer;

mod client;
mod connection;
mod handshake;
mod listener;
mod reconnect;
mod registry;

pub use client::{ClientBuilder, ClientEndpoint, ClientState, DEFAULT_CONNECT_TIMEOUT};
pub use codec::{Codec, JsonCodec, Message, MsgPackCodec};
pub use connection::Connection;
pub use error::{IpcError, Result};
pub use events::{notification_channel, ConnectionObserver, Notification, SharedObserver};
pub use listener::{Listener, ListenerBuilder, DEFAULT_HANDSHAKE_TIMEOUT};
pub use reconnect::ReconnectPolicy;
pub use registry::ConnectionRegistry;
pub use transport::{PipeSecurity, SharedSecurity};
pub use writer::WriterConfig;
