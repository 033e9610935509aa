//! # Keeper Memory
//!
//! An in-process coordination service implementing
//! [`keeper_core::CoordinationService`]. It provides the guarantees the
//! client relies on (linearizable writes, strictly increasing sequential
//! suffixes, session-scoped ephemeral nodes, one-shot watches) without a
//! running ensemble, plus hooks for injecting connection faults.

pub mod service;
pub mod tree;
pub mod watches;

pub use service::{MemoryCoordinationService, MemoryServiceConfig, ServiceStats};
pub use tree::{DataNode, DataTree};
pub use watches::WatchManager;
