//! # Core Types
//!
//! Fundamental types shared by the coordination service and the client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a session on the coordination service.
///
/// Assigned by the service when a session is opened. Ephemeral nodes record
/// the id of the session that created them and are removed when it ends.
///
/// # Examples
///
/// ```rust
/// use keeper_core::SessionId;
///
/// let session = SessionId::new(0x1f);
/// assert_eq!(session.to_string(), "0x1f");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a node is created.
///
/// Ephemeral nodes live as long as the creating session. Sequential nodes get
/// a monotonically increasing, zero-padded suffix appended by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CreateMode {
    #[default]
    Persistent,
    Ephemeral,
    EphemeralSequential,
    PersistentSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::EphemeralSequential | CreateMode::PersistentSequential
        )
    }
}

impl fmt::Display for CreateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateMode::Persistent => write!(f, "PERSISTENT"),
            CreateMode::Ephemeral => write!(f, "EPHEMERAL"),
            CreateMode::EphemeralSequential => write!(f, "EPHEMERAL_SEQUENTIAL"),
            CreateMode::PersistentSequential => write!(f, "PERSISTENT_SEQUENTIAL"),
        }
    }
}

/// Metadata the service keeps for every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stat {
    /// Transaction id of the create
    pub czxid: u64,
    /// Transaction id of the last data change
    pub mzxid: u64,
    /// Transaction id of the last child-set change
    pub pzxid: u64,
    /// Creation time, milliseconds since the epoch
    pub ctime: u64,
    /// Last modification time, milliseconds since the epoch
    pub mtime: u64,
    /// Data version, incremented on each write
    pub version: i32,
    /// Child-set version, incremented on each child create/delete
    pub cversion: i32,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<SessionId>,
    pub data_length: usize,
    pub num_children: usize,
}

impl Stat {
    /// True when both stats describe the same write of the same node.
    pub fn same_revision(&self, other: &Stat) -> bool {
        self.czxid == other.czxid && self.mzxid == other.mzxid
    }
}

/// Client-side view of the session's connection state.
///
/// `Connected` is reported once, for the first session. Every later recovery
/// (a resumed connection or a replacement session after `Lost`) is reported as
/// `Reconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Suspended,
    Lost,
    Reconnected,
}

impl ConnectionState {
    /// Returns true if operations can currently reach the service.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Suspended => write!(f, "SUSPENDED"),
            ConnectionState::Lost => write!(f, "LOST"),
            ConnectionState::Reconnected => write!(f, "RECONNECTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_flags() {
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(!CreateMode::PersistentSequential.is_ephemeral());
        assert_eq!(CreateMode::default(), CreateMode::Persistent);
    }

    #[test]
    fn test_connection_state_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Reconnected.is_connected());
        assert!(!ConnectionState::Suspended.is_connected());
        assert!(!ConnectionState::Lost.is_connected());
        assert_eq!(ConnectionState::Reconnected.to_string(), "RECONNECTED");
    }

    #[test]
    fn test_stat_revision() {
        let a = Stat {
            czxid: 3,
            mzxid: 5,
            ..Default::default()
        };
        let mut b = a;
        assert!(a.same_revision(&b));
        b.mzxid = 6;
        assert!(!a.same_revision(&b));
    }
}
