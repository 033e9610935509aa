//! # Error Types
//!
//! Error handling shared by the coordination service and the client layers.

use crate::SessionId;
use thiserror::Error;

/// Errors that can occur while talking to the coordination service.
///
/// The node-level variants mirror the service's own result codes so callers
/// can tell "node absent" apart from "service unreachable". Session and
/// transport failures are grouped by [`KeeperError::is_retryable`], which
/// drives the client's retry loop.
///
/// # Examples
///
/// ```rust
/// use keeper_core::KeeperError;
///
/// let error = KeeperError::connection_loss("socket closed");
/// assert!(error.is_retryable());
///
/// let error = KeeperError::no_node("/missing");
/// assert!(!error.is_retryable());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeeperError {
    /// The addressed node does not exist
    #[error("No node: {path}")]
    NoNode { path: String },

    /// A node already exists at the path
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    /// The node still has children
    #[error("Node not empty: {path}")]
    NotEmpty { path: String },

    /// A conditional write carried a stale version
    #[error("Bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// Ephemeral nodes cannot have children
    #[error("Ephemeral node {path} cannot have children")]
    NoChildrenForEphemerals { path: String },

    /// The path is not a well-formed absolute node path
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The connection dropped before the operation completed
    #[error("Connection loss: {message}")]
    ConnectionLoss { message: String },

    /// The session is no longer valid on the service
    #[error("Session {session} expired")]
    SessionExpired { session: SessionId },

    /// The operation did not complete in time
    #[error("Timeout occurred: {operation}")]
    Timeout { operation: String },

    /// The client has not been initialised yet
    #[error("Client not started")]
    NotStarted,

    /// The client or session was closed
    #[error("Client closed")]
    Closed,

    /// Configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results in the keeper client.
pub type KeeperResult<T> = std::result::Result<T, KeeperError>;

impl KeeperError {
    pub fn no_node(path: impl Into<String>) -> Self {
        Self::NoNode { path: path.into() }
    }

    pub fn node_exists(path: impl Into<String>) -> Self {
        Self::NodeExists { path: path.into() }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn connection_loss(message: impl Into<String>) -> Self {
        Self::ConnectionLoss {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Determines if the operation may succeed when attempted again.
    ///
    /// Connection loss, timeouts and session expiry are transient from the
    /// client's point of view: the session supervisor will establish a new
    /// session and the operation can be replayed on it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss { .. } | Self::Timeout { .. } | Self::SessionExpired { .. }
        )
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::NoNode { .. })
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, Self::NodeExists { .. })
    }
}
