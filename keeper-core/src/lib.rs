//! # Keeper Core
//!
//! Shared building blocks for the keeper coordination client:
//!
//! - **Types**: `SessionId`, `CreateMode`, `Stat`, `ConnectionState`
//! - **Service seam**: the `CoordinationService` trait, one-shot `Watcher`s
//!   and raw session events
//! - **Paths**: validation and parent/child helpers for node paths
//! - **Retry**: the `RetryPolicy` trait and exponential backoff
//! - **Configuration**: `KeeperConfig` with service-default sentinels
//! - **Errors**: `KeeperError` and the `KeeperResult` alias

pub mod config;
pub mod error;
pub mod path;
pub mod retry;
pub mod service;
pub mod types;

pub use config::{KeeperConfig, DEFAULT_CONNECTION_TIMEOUT, USE_SERVICE_DEFAULT};
pub use error::*;
pub use retry::{ExponentialBackoffRetry, RetryPolicy};
pub use service::{
    CoordinationService, EventKind, Session, SessionEvent, SessionOptions, WatchedEvent, Watcher,
};
pub use types::*;
