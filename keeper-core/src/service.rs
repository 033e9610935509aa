//! The coordination service seam.
//!
//! Everything the client needs from a ZooKeeper-style service is expressed by
//! [`CoordinationService`]. Watches are one-shot: a registered [`Watcher`]
//! receives at most one [`WatchedEvent`] and must be registered again to see
//! the next change.

use crate::{CreateMode, KeeperResult, SessionId, Stat};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What changed for a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    NodeChildrenChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::NodeCreated => write!(f, "NodeCreated"),
            EventKind::NodeDataChanged => write!(f, "NodeDataChanged"),
            EventKind::NodeDeleted => write!(f, "NodeDeleted"),
            EventKind::NodeChildrenChanged => write!(f, "NodeChildrenChanged"),
        }
    }
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
}

/// One-shot watch registration handle.
///
/// Registering the same watcher (same id) twice on one path is collapsed by
/// the service into a single registration.
#[derive(Debug, Clone)]
pub struct Watcher {
    id: Uuid,
    tx: mpsc::UnboundedSender<WatchedEvent>,
}

impl Watcher {
    pub fn new(tx: mpsc::UnboundedSender<WatchedEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// Creates a watcher together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Delivers `event`; returns false when the receiver is gone.
    pub fn fire(&self, event: WatchedEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Raw session notifications emitted by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Connection (re-)established, session still valid
    SyncConnected,
    /// Connection dropped; the session may still be resumed
    Disconnected,
    /// The service discarded the session and its ephemeral nodes
    Expired,
}

/// Parameters for opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub connect_string: String,
    /// Requested timeout, `None` for the service default
    pub session_timeout: Option<Duration>,
}

/// An open session.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub negotiated_timeout: Duration,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// A ZooKeeper-style coordination service.
///
/// Implementations provide linearizable writes, strictly increasing sequence
/// numbers for sequential nodes and removal of ephemeral nodes when their
/// session ends.
#[async_trait]
pub trait CoordinationService: Send + Sync + 'static {
    async fn open_session(&self, options: SessionOptions) -> KeeperResult<Session>;

    async fn close_session(&self, session: SessionId) -> KeeperResult<()>;

    /// Creates a node. The parent must exist. Returns the created path, which
    /// for sequential modes includes the generated suffix.
    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> KeeperResult<String>;

    /// Overwrites data; `version` of `None` skips the version check.
    async fn set_data(
        &self,
        session: SessionId,
        path: &str,
        data: Bytes,
        version: Option<i32>,
    ) -> KeeperResult<Stat>;

    /// Reads data. Fails with `NoNode` (leaving no watch) if absent.
    async fn get_data(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<(Bytes, Stat)>;

    /// Checks existence. A watcher is left even when the node is absent, so it
    /// fires on creation.
    async fn exists(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<Option<Stat>>;

    /// Lists immediate children by name. Fails with `NoNode` if absent.
    async fn get_children(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<Vec<String>>;

    /// Deletes a childless node; `version` of `None` skips the check.
    async fn delete(&self, session: SessionId, path: &str, version: Option<i32>)
        -> KeeperResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watcher_fire_and_close() {
        let (watcher, mut rx) = Watcher::channel();
        let event = WatchedEvent {
            kind: EventKind::NodeDataChanged,
            path: "/a".into(),
        };
        assert!(watcher.fire(event.clone()));
        assert_eq!(rx.try_recv().unwrap(), event);

        drop(rx);
        assert!(watcher.is_closed());
        assert!(!watcher.fire(event));
    }

    #[test]
    fn test_watcher_clone_keeps_identity() {
        let (watcher, _rx) = Watcher::channel();
        let copy = watcher.clone();
        assert_eq!(watcher.id(), copy.id());

        let (other, _rx2) = Watcher::channel();
        assert_ne!(watcher.id(), other.id());
    }
}
