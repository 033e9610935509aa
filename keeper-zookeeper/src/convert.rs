//! Mapping between the `zookeeper` crate's types and keeper's.

use keeper_core::{
    CreateMode, EventKind, KeeperError, SessionEvent, SessionId, Stat, WatchedEvent,
};
use zookeeper::{KeeperState, WatchedEventType, ZkError};

pub(crate) fn create_mode(mode: CreateMode) -> zookeeper::CreateMode {
    match mode {
        CreateMode::Persistent => zookeeper::CreateMode::Persistent,
        CreateMode::Ephemeral => zookeeper::CreateMode::Ephemeral,
        CreateMode::PersistentSequential => zookeeper::CreateMode::PersistentSequential,
        CreateMode::EphemeralSequential => zookeeper::CreateMode::EphemeralSequential,
    }
}

/// Converts node metadata. The ephemeral owner is the ensemble's own
/// session id, not the id keeper assigned to the handle.
pub(crate) fn stat(stat: &zookeeper::Stat) -> Stat {
    Stat {
        czxid: stat.czxid as u64,
        mzxid: stat.mzxid as u64,
        pzxid: stat.pzxid as u64,
        ctime: stat.ctime.max(0) as u64,
        mtime: stat.mtime.max(0) as u64,
        version: stat.version,
        cversion: stat.cversion,
        ephemeral_owner: (stat.ephemeral_owner != 0)
            .then(|| SessionId::new(stat.ephemeral_owner as u64)),
        data_length: stat.data_length.max(0) as usize,
        num_children: stat.num_children.max(0) as usize,
    }
}

/// Converts a result code for an operation on `path`.
///
/// The ensemble does not report versions on a conflict, so `BadVersion`
/// carries the expected version only.
pub(crate) fn error(
    err: ZkError,
    path: &str,
    session: SessionId,
    expected_version: Option<i32>,
) -> KeeperError {
    match err {
        ZkError::NoNode => KeeperError::no_node(path),
        ZkError::NodeExists => KeeperError::node_exists(path),
        ZkError::NotEmpty => KeeperError::NotEmpty { path: path.into() },
        ZkError::BadVersion => KeeperError::BadVersion {
            path: path.into(),
            expected: expected_version.unwrap_or(-1),
            actual: -1,
        },
        ZkError::NoChildrenForEphemerals => {
            KeeperError::NoChildrenForEphemerals { path: path.into() }
        }
        ZkError::BadArguments => KeeperError::invalid_path(path, "rejected by the ensemble"),
        ZkError::ConnectionLoss => KeeperError::connection_loss("connection to ensemble lost"),
        ZkError::SessionExpired => KeeperError::SessionExpired { session },
        ZkError::OperationTimeout => KeeperError::timeout(format!("operation on {path}")),
        other => KeeperError::internal(format!("ensemble error on {path}: {other:?}")),
    }
}

/// Node watch notification, or `None` for session-level and
/// watch-removal events.
pub(crate) fn watched_event(event: &zookeeper::WatchedEvent) -> Option<WatchedEvent> {
    let kind = match event.event_type {
        WatchedEventType::NodeCreated => EventKind::NodeCreated,
        WatchedEventType::NodeDataChanged => EventKind::NodeDataChanged,
        WatchedEventType::NodeDeleted => EventKind::NodeDeleted,
        WatchedEventType::NodeChildrenChanged => EventKind::NodeChildrenChanged,
        _ => return None,
    };
    Some(WatchedEvent {
        kind,
        path: event.path.clone()?,
    })
}

pub(crate) fn session_event(event: &zookeeper::WatchedEvent) -> Option<SessionEvent> {
    if !matches!(event.event_type, WatchedEventType::None) {
        return None;
    }
    match event.keeper_state {
        KeeperState::SyncConnected => Some(SessionEvent::SyncConnected),
        KeeperState::Disconnected => Some(SessionEvent::Disconnected),
        KeeperState::Expired => Some(SessionEvent::Expired),
        _ => None,
    }
}
