//! Server-side table of live connections.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;

use crate::codec::{CodecFns, Message};
use crate::connection::Connection;
use crate::error::{IpcError, Result};

/// Map from connection id to connection, safe to use from any task.
///
/// Display names are not required to be unique. Name-addressed pushes pick
/// the lowest id among equal names, which is the earliest admitted one.
pub struct ConnectionRegistry<T> {
    connections: RwLock<HashMap<u64, Arc<Connection<T>>>>,
    codec: CodecFns<T>,
}

impl<T: Message> ConnectionRegistry<T> {
    pub(crate) fn new(codec: CodecFns<T>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            codec,
        }
    }

    /// Push `message` to every connection registered at the time of the call.
    ///
    /// The message is encoded once. Deliveries run concurrently; a failed
    /// push is logged and does not affect the others. Returns the number of
    /// connections that received the message.
    ///
    /// # Errors
    ///
    /// Only if `message` cannot be encoded.
    pub async fn broadcast(&self, message: &T) -> Result<usize> {
        let targets = self.snapshot();
        if targets.is_empty() {
            return Ok(0);
        }

        let payload = bytes::Bytes::from((self.codec.encode)(message)?);
        let results = join_all(
            targets
                .iter()
                .map(|connection| connection.push_bytes(payload.clone())),
        )
        .await;

        let mut delivered = 0;
        for (connection, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(id = connection.id(), "broadcast push failed: {}", e);
                }
            }
        }

        tracing::trace!(delivered, total = targets.len(), "broadcast done");
        Ok(delivered)
    }

    /// Push `message` to the connection whose display name is `name`.
    ///
    /// # Errors
    ///
    /// [`IpcError::UnknownConnection`] if no registered connection carries the
    /// name, otherwise whatever the push itself returns.
    pub async fn push_to(&self, message: &T, name: &str) -> Result<()> {
        let connection = self
            .find_by_name(name)
            .ok_or_else(|| IpcError::UnknownConnection(name.to_string()))?;
        connection.push(message).await
    }
}

impl<T> ConnectionRegistry<T> {
    /// Register a connection under its id.
    pub fn add(&self, connection: Arc<Connection<T>>) {
        self.write().insert(connection.id(), connection);
    }

    /// Unregister a connection. No-op if the id is absent.
    pub fn remove(&self, id: u64) -> Option<Arc<Connection<T>>> {
        self.write().remove(&id)
    }

    /// Look up a connection by id.
    pub fn get(&self, id: u64) -> Option<Arc<Connection<T>>> {
        self.read().get(&id).cloned()
    }

    /// Look up the lowest-id connection carrying `name`.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Connection<T>>> {
        self.read()
            .values()
            .filter(|c| c.name() == name)
            .min_by_key(|c| c.id())
            .cloned()
    }

    /// Snapshot of every registered connection, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Connection<T>>> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by_key(|c| c.id());
        all
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Close and unregister every connection.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.write().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Arc<Connection<T>>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Arc<Connection<T>>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
