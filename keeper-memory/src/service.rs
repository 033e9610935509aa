//! # In-Memory Coordination Service
//!
//! A single-process stand-in for a ZooKeeper-style ensemble. It keeps the
//! data tree, session table and watch tables behind one lock, so every
//! operation is linearizable and watches fire in commit order.
//!
//! Fault injection hooks (`set_available`, `disconnect_session`,
//! `reconnect_session`, `expire_session`) let tests drive the client through
//! connection loss, suspension and session expiry.

use async_trait::async_trait;
use bytes::Bytes;
use keeper_core::path;
use keeper_core::{
    CoordinationService, CreateMode, EventKind, KeeperError, KeeperResult, Session, SessionEvent,
    SessionId, SessionOptions, Stat, Watcher,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::tree::DataTree;
use crate::watches::WatchManager;

/// Configuration for the in-memory service
#[derive(Debug, Clone)]
pub struct MemoryServiceConfig {
    /// Timeout granted when the client does not request one
    pub default_session_timeout: Duration,
    /// First session id handed out
    pub first_session_id: u64,
}

impl Default for MemoryServiceConfig {
    fn default() -> Self {
        Self {
            default_session_timeout: Duration::from_secs(30),
            first_session_id: 0x100,
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    timeout: Duration,
    connected: bool,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Debug, Default)]
struct ServiceState {
    tree: DataTree,
    watches: WatchManager,
    sessions: HashMap<SessionId, SessionEntry>,
}

/// Statistics about the service
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub operations: u64,
    pub open_sessions: usize,
    pub nodes: usize,
    pub active_watches: usize,
    pub watches_fired: u64,
    pub zxid: u64,
}

/// In-process coordination service.
pub struct MemoryCoordinationService {
    config: MemoryServiceConfig,
    state: Arc<Mutex<ServiceState>>,
    next_session_id: AtomicU64,
    operations: AtomicU64,
    available: AtomicBool,
}

impl MemoryCoordinationService {
    pub fn new() -> Self {
        Self::with_config(MemoryServiceConfig::default())
    }

    pub fn with_config(config: MemoryServiceConfig) -> Self {
        let first_session_id = config.first_session_id;
        Self {
            config,
            state: Arc::new(Mutex::new(ServiceState::default())),
            next_session_id: AtomicU64::new(first_session_id),
            operations: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Number of requests received, failed ones included.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Acquire)
    }

    /// While unavailable every request fails with connection loss.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        info!(available, "memory coordination service availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.state.lock().sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn session_exists(&self, session: SessionId) -> bool {
        self.state.lock().sessions.contains_key(&session)
    }

    /// Owner of an ephemeral node, if the node exists and is ephemeral.
    pub fn ephemeral_owner(&self, path: &str) -> Option<SessionId> {
        let state = self.state.lock();
        state.tree.get(path).and_then(|node| node.stat.ephemeral_owner)
    }

    /// Drops the connection of `session` without expiring it.
    pub fn disconnect_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.connected = false;
            let _ = entry.events_tx.send(SessionEvent::Disconnected);
            warn!(%session, "session disconnected");
        }
    }

    /// Restores the connection of a disconnected, unexpired session.
    pub fn reconnect_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.sessions.get_mut(&session) {
            if !entry.connected {
                entry.connected = true;
                let _ = entry.events_tx.send(SessionEvent::SyncConnected);
                info!(%session, "session reconnected");
            }
        }
    }

    /// Expires `session`: its ephemeral nodes and watches are discarded and
    /// the owner is told through its event channel.
    pub fn expire_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        if let Some(entry) = Self::end_session(&mut state, session) {
            let _ = entry.events_tx.send(SessionEvent::Expired);
            warn!(%session, "session expired");
        }
    }

    pub fn get_stats(&self) -> ServiceStats {
        let state = self.state.lock();
        ServiceStats {
            operations: self.operation_count(),
            open_sessions: state.sessions.len(),
            nodes: state.tree.node_count(),
            active_watches: state.watches.watch_count(),
            watches_fired: state.watches.fired_count(),
            zxid: state.tree.zxid(),
        }
    }

    fn end_session(state: &mut ServiceState, session: SessionId) -> Option<SessionEntry> {
        let entry = state.sessions.remove(&session)?;
        state.watches.remove_session(session);
        for ephemeral in state.tree.ephemerals_of(session) {
            if let Err(err) = Self::apply_delete(state, &ephemeral, None) {
                warn!(%session, path = %ephemeral, error = %err, "failed to remove ephemeral node");
            }
        }
        Some(entry)
    }

    fn apply_delete(state: &mut ServiceState, path: &str, version: Option<i32>) -> KeeperResult<()> {
        let parent = state.tree.delete(path, version)?;
        state.watches.trigger_data(path, EventKind::NodeDeleted);
        state.watches.trigger_child(path, EventKind::NodeDeleted);
        state
            .watches
            .trigger_child(&parent, EventKind::NodeChildrenChanged);
        Ok(())
    }

    /// Counts the request and checks that `session` can issue it.
    fn admit(&self, state: &ServiceState, session: SessionId) -> KeeperResult<()> {
        self.operations.fetch_add(1, Ordering::AcqRel);
        if !self.is_available() {
            return Err(KeeperError::connection_loss("coordination service unavailable"));
        }
        match state.sessions.get(&session) {
            Some(entry) if entry.connected => Ok(()),
            Some(_) => Err(KeeperError::connection_loss(format!(
                "session {session} is disconnected"
            ))),
            None => Err(KeeperError::SessionExpired { session }),
        }
    }
}

impl Default for MemoryCoordinationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationService for MemoryCoordinationService {
    async fn open_session(&self, options: SessionOptions) -> KeeperResult<Session> {
        self.operations.fetch_add(1, Ordering::AcqRel);
        if !self.is_available() {
            return Err(KeeperError::connection_loss("coordination service unavailable"));
        }
        if options.connect_string.trim().is_empty() {
            return Err(KeeperError::Config("connect string cannot be empty".into()));
        }

        let id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::AcqRel));
        let timeout = options
            .session_timeout
            .unwrap_or(self.config.default_session_timeout);
        let (events_tx, events) = mpsc::unbounded_channel();

        self.state.lock().sessions.insert(
            id,
            SessionEntry {
                timeout,
                connected: true,
                events_tx,
            },
        );
        info!(session = %id, timeout_ms = timeout.as_millis() as u64, "session opened");

        Ok(Session {
            id,
            negotiated_timeout: timeout,
            events,
        })
    }

    async fn close_session(&self, session: SessionId) -> KeeperResult<()> {
        let mut state = self.state.lock();
        if let Some(entry) = Self::end_session(&mut state, session) {
            debug!(%session, timeout_ms = entry.timeout.as_millis() as u64, "session closed");
        }
        Ok(())
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> KeeperResult<String> {
        let mut state = self.state.lock();
        self.admit(&state, session)?;

        let created = state.tree.create(path, data, mode, session)?;
        state
            .watches
            .trigger_data(&created.path, EventKind::NodeCreated);
        state
            .watches
            .trigger_child(&created.parent, EventKind::NodeChildrenChanged);
        debug!(path = %created.path, %mode, "node created");
        Ok(created.path)
    }

    async fn set_data(
        &self,
        session: SessionId,
        path: &str,
        data: Bytes,
        version: Option<i32>,
    ) -> KeeperResult<Stat> {
        let mut state = self.state.lock();
        self.admit(&state, session)?;

        let stat = state.tree.set_data(path, data, version)?;
        state.watches.trigger_data(path, EventKind::NodeDataChanged);
        Ok(stat)
    }

    async fn get_data(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<(Bytes, Stat)> {
        let mut state = self.state.lock();
        self.admit(&state, session)?;
        path::validate_path(path)?;

        let (data, stat) = match state.tree.get(path) {
            Some(node) => (node.data.clone(), node.stat()),
            None => return Err(KeeperError::no_node(path)),
        };
        if let Some(watcher) = watcher {
            state.watches.add_data_watch(path, session, watcher);
        }
        Ok((data, stat))
    }

    async fn exists(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<Option<Stat>> {
        let mut state = self.state.lock();
        self.admit(&state, session)?;
        path::validate_path(path)?;

        let stat = state.tree.get(path).map(|node| node.stat());
        if let Some(watcher) = watcher {
            state.watches.add_data_watch(path, session, watcher);
        }
        Ok(stat)
    }

    async fn get_children(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<Vec<String>> {
        let mut state = self.state.lock();
        self.admit(&state, session)?;
        path::validate_path(path)?;

        let children: Vec<String> = match state.tree.get(path) {
            Some(node) => node.children.iter().cloned().collect(),
            None => return Err(KeeperError::no_node(path)),
        };
        if let Some(watcher) = watcher {
            state.watches.add_child_watch(path, session, watcher);
        }
        Ok(children)
    }

    async fn delete(
        &self,
        session: SessionId,
        path: &str,
        version: Option<i32>,
    ) -> KeeperResult<()> {
        let mut state = self.state.lock();
        self.admit(&state, session)?;
        path::validate_path(path)?;

        Self::apply_delete(&mut state, path, version)?;
        debug!(path, "node deleted");
        Ok(())
    }
}
