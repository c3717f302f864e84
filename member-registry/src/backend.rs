use async_trait::async_trait;

use crate::{ChangeEvent, ConnectionPhase, Result};

/// Callback invoked by the backend on every connection-state transition.
pub type ConnectionListener = Box<dyn Fn(ConnectionPhase) + Send + Sync>;

/// Callback invoked by the backend for every subtree change it observes.
pub type ChangeListener = Box<dyn Fn(ChangeEvent) + Send + Sync>;

/// Client side of a ZooKeeper-style coordination service.
///
/// Implementations own the session: ephemeral nodes live as long as it does,
/// and listeners are called from backend-managed threads. Listeners must
/// return quickly; the registration manager only enqueues from them.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create an ephemeral node named `prefix` plus a backend-assigned
    /// sequence suffix. Returns the committed path.
    async fn create_ephemeral_sequential(&self, prefix: &str, payload: Vec<u8>) -> Result<String>;

    /// Remove the node at `path`. Returns `Error::NoNode` if it does not exist.
    async fn remove_node(&self, path: &str) -> Result<()>;

    fn subscribe_connection_state(&self, listener: ConnectionListener);

    fn subscribe_subtree_changes(&self, listener: ChangeListener);

    /// All nodes beneath `path` (excluding `path` itself), ordered by path.
    async fn fetch_subtree_snapshot(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Tear down the session. Safe to call more than once.
    async fn close_connection(&self);
}
