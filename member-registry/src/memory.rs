//! In-process coordination backend.
//!
//! Models the parts of a ZooKeeper-style tree the registration core relies
//! on: sequential suffixes, session-owned ephemeral nodes, subtree watches
//! and connection-state signals. Connection loss, reconnection and session
//! expiry are driven explicitly so tests can reproduce them.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{ChangeListener, ConnectionListener, CoordinationClient};
use crate::{ChangeEvent, ChangeKind, ConnectionPhase, Error, Result};

type SharedChangeListener = Arc<dyn Fn(ChangeEvent) + Send + Sync>;
type SharedConnectionListener = Arc<dyn Fn(ConnectionPhase) + Send + Sync>;

struct Node {
    payload: Vec<u8>,
    /// Owning session for ephemeral nodes.
    owner: Option<u64>,
}

struct TreeState {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    session: u64,
    connected: bool,
    closed: bool,
}

impl TreeState {
    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if !self.connected {
            return Err(Error::Connection("connection lost".into()));
        }
        Ok(())
    }

    /// Drop every node owned by the current session, returning removal events.
    fn drop_ephemerals(&mut self) -> Vec<ChangeEvent> {
        let session = self.session;
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        owned
            .into_iter()
            .filter_map(|path| {
                self.nodes
                    .remove(&path)
                    .map(|node| ChangeEvent::new(ChangeKind::Removed, path, Some(node.payload)))
            })
            .collect()
    }
}

/// Coordination backend held entirely in memory.
pub struct MemoryBackend {
    state: Mutex<TreeState>,
    change_listeners: Mutex<Vec<SharedChangeListener>>,
    connection_listeners: Mutex<Vec<SharedConnectionListener>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TreeState {
                nodes: BTreeMap::new(),
                sequences: HashMap::new(),
                session: 1,
                connected: true,
                closed: false,
            }),
            change_listeners: Mutex::new(Vec::new()),
            connection_listeners: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a persistent node, as another process sharing the tree would.
    pub fn create_persistent(&self, path: &str, payload: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state();
            state.check_usable()?;
            if state.nodes.contains_key(path) {
                return Err(Error::NodeExists(path.to_string()));
            }
            state.nodes.insert(
                path.to_string(),
                Node {
                    payload: payload.clone(),
                    owner: None,
                },
            );
        }
        self.emit(ChangeEvent::new(ChangeKind::Added, path, Some(payload)));
        Ok(())
    }

    /// Replace the payload of an existing node.
    pub fn set_data(&self, path: &str, payload: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state();
            state.check_usable()?;
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| Error::NoNode(path.to_string()))?;
            node.payload = payload.clone();
        }
        self.emit(ChangeEvent::new(ChangeKind::Updated, path, Some(payload)));
        Ok(())
    }

    pub fn get_data(&self, path: &str) -> Option<Vec<u8>> {
        self.state().nodes.get(path).map(|n| n.payload.clone())
    }

    /// Direct children of `path`, as full paths in sorted order.
    pub fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.state()
            .nodes
            .keys()
            .filter(|p| {
                p.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect()
    }

    pub fn session_id(&self) -> u64 {
        self.state().session
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Deliver a raw change event to every subtree listener.
    pub fn emit(&self, event: ChangeEvent) {
        let listeners: Vec<SharedChangeListener> = self
            .change_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event.clone());
        }
    }

    /// Deliver a connection phase to every connection listener.
    pub fn emit_connection(&self, phase: ConnectionPhase) {
        let listeners: Vec<SharedConnectionListener> = self
            .connection_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(phase);
        }
    }

    /// Mark the connection lost. Mutations fail until
    /// [`simulate_reconnect`](Self::simulate_reconnect).
    pub fn simulate_connection_loss(&self) {
        {
            let mut state = self.state();
            if state.closed || !state.connected {
                return;
            }
            state.connected = false;
        }
        tracing::debug!("Memory backend: connection lost");
        self.emit_connection(ConnectionPhase::Lost);
    }

    /// Restore the connection within the same session.
    pub fn simulate_reconnect(&self) {
        {
            let mut state = self.state();
            if state.closed || state.connected {
                return;
            }
            state.connected = true;
        }
        tracing::debug!("Memory backend: reconnected");
        self.emit_connection(ConnectionPhase::Reconnected);
    }

    /// End the current session: its ephemeral nodes disappear and a new
    /// session begins. Returns the number of nodes removed.
    pub fn expire_session(&self) -> usize {
        let removed = {
            let mut state = self.state();
            if state.closed {
                return 0;
            }
            let removed = state.drop_ephemerals();
            state.session += 1;
            removed
        };
        let count = removed.len();
        tracing::debug!(count, "Memory backend: session expired");
        for event in removed {
            self.emit(event);
        }
        count
    }
}

fn child_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

fn parent_of(prefix: &str) -> &str {
    match prefix.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &prefix[..idx],
    }
}

#[async_trait]
impl CoordinationClient for MemoryBackend {
    async fn create_ephemeral_sequential(&self, prefix: &str, payload: Vec<u8>) -> Result<String> {
        if !prefix.starts_with('/') {
            return Err(Error::InvalidPath(prefix.to_string()));
        }
        let path = {
            let mut state = self.state();
            state.check_usable()?;

            let counter = state
                .sequences
                .entry(parent_of(prefix).to_string())
                .or_insert(0);
            let path = format!("{}{:010}", prefix, *counter);
            *counter += 1;

            let owner = Some(state.session);
            state.nodes.insert(
                path.clone(),
                Node {
                    payload: payload.clone(),
                    owner,
                },
            );
            path
        };
        self.emit(ChangeEvent::new(ChangeKind::Added, path.clone(), Some(payload)));
        Ok(path)
    }

    async fn remove_node(&self, path: &str) -> Result<()> {
        let node = {
            let mut state = self.state();
            state.check_usable()?;
            state
                .nodes
                .remove(path)
                .ok_or_else(|| Error::NoNode(path.to_string()))?
        };
        self.emit(ChangeEvent::new(ChangeKind::Removed, path, Some(node.payload)));
        Ok(())
    }

    fn subscribe_connection_state(&self, listener: ConnectionListener) {
        self.connection_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::from(listener));
    }

    fn subscribe_subtree_changes(&self, listener: ChangeListener) {
        self.change_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::from(listener));
    }

    async fn fetch_subtree_snapshot(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let state = self.state();
        state.check_usable()?;
        let prefix = child_prefix(path);
        Ok(state
            .nodes
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .map(|(p, node)| (p.clone(), node.payload.clone()))
            .collect())
    }

    async fn close_connection(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.drop_ephemerals();
            state.closed = true;
            state.connected = false;
        }
        self.change_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.connection_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("Memory backend closed");
    }
}
