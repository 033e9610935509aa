//! # Keeper ZooKeeper
//!
//! [`keeper_core::CoordinationService`] backed by a ZooKeeper ensemble,
//! so [`keeper_client`]-style clients can run against real servers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keeper_client::KeeperClient;
//! use keeper_core::KeeperConfig;
//! use keeper_zookeeper::ZookeeperCoordinationService;
//!
//! # async fn run() -> keeper_core::KeeperResult<()> {
//! let client = KeeperClient::new(
//!     KeeperConfig::new("zk1:2181,zk2:2181,zk3:2181"),
//!     Arc::new(ZookeeperCoordinationService::new()),
//! )?;
//! client.init()?;
//! client.wait_until_connected(None).await?;
//! client.set("/app/flag", "on").await;
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

mod convert;
pub mod service;

pub use service::{ZookeeperCoordinationService, ZookeeperServiceConfig};
