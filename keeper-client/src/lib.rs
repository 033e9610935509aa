//! # Keeper Client
//!
//! A client for ZooKeeper-style coordination services built on
//! [`keeper_core::CoordinationService`]:
//!
//! - **Connection management**: session supervision with exponential backoff
//!   and `CONNECTED`/`SUSPENDED`/`LOST`/`RECONNECTED` transitions
//! - **Node store**: create-if-absent writes, reads, listings and recursive
//!   or guaranteed deletes
//! - **Persistent watches**: node and child-set listeners re-armed after
//!   every delivery and after reconnects
//! - **Leader election**: ephemeral sequential candidacies with automatic
//!   re-queueing after each term
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keeper_client::{KeeperClient, NodeChangeHandler, NodeSnapshot};
//! use keeper_core::KeeperConfig;
//! use keeper_memory::MemoryCoordinationService;
//!
//! struct PrintChanges;
//!
//! #[async_trait::async_trait]
//! impl NodeChangeHandler for PrintChanges {
//!     async fn on_node_changed(&self, snapshot: &NodeSnapshot) {
//!         println!("{} = {:?}", snapshot.path, snapshot.data_utf8());
//!     }
//! }
//!
//! # async fn run() -> keeper_core::KeeperResult<()> {
//! let client = KeeperClient::new(
//!     KeeperConfig::new("127.0.0.1:2181"),
//!     Arc::new(MemoryCoordinationService::new()),
//! )?;
//! client.init()?;
//! client.set("/app/flag", "on").await;
//! client.add_node_listener("/app/flag", Arc::new(PrintChanges)).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod leader;
pub mod store;
pub mod watcher;

pub use client::KeeperClient;
pub use connection::{ActiveSession, ConnectionManager};
pub use dispatcher::{
    ChildChangeHandler, ChildEvent, ChildEventKind, LeadershipTask, NodeChangeHandler,
    NodeSnapshot, SerialDispatcher, SessionStateHandler,
};
pub use leader::{ElectionStats, ElectorState, LeaderElector, LeadershipContext};
pub use store::NodeStore;
pub use watcher::{ListenerId, ListenerKind, NodeWatcher};
