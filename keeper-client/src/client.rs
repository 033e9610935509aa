//! The client facade.

use bytes::Bytes;
use keeper_core::{
    ConnectionState, CoordinationService, CreateMode, KeeperConfig, KeeperResult, SessionId, Stat,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use crate::connection::ConnectionManager;
use crate::dispatcher::{ChildChangeHandler, LeadershipTask, NodeChangeHandler, SessionStateHandler};
use crate::leader::LeaderElector;
use crate::store::NodeStore;
use crate::watcher::{ListenerId, NodeWatcher};

/// Coordination client: node CRUD, persistent listeners and leader election
/// over one managed session.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use keeper_client::KeeperClient;
/// use keeper_core::KeeperConfig;
/// use keeper_memory::MemoryCoordinationService;
///
/// # async fn run() -> keeper_core::KeeperResult<()> {
/// let service = Arc::new(MemoryCoordinationService::new());
/// let client = KeeperClient::new(KeeperConfig::new("127.0.0.1:2181"), service)?;
/// client.init()?;
///
/// client.set("/app/config", "v1").await;
/// assert_eq!(client.get_string("/app/config").await.as_deref(), Some("v1"));
///
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct KeeperClient {
    connection: Arc<ConnectionManager>,
    store: NodeStore,
    watcher: NodeWatcher,
    electors: Mutex<Vec<LeaderElector>>,
}

impl KeeperClient {
    pub fn new(config: KeeperConfig, service: Arc<dyn CoordinationService>) -> KeeperResult<Self> {
        let connection = Arc::new(ConnectionManager::new(config, service)?);
        Ok(Self {
            store: NodeStore::new(connection.clone()),
            watcher: NodeWatcher::new(connection.clone()),
            connection,
            electors: Mutex::new(Vec::new()),
        })
    }

    /// Starts connecting in the background. Operations issued before the
    /// session is up wait for it, within the connection timeout.
    pub fn init(&self) -> KeeperResult<()> {
        self.connection.init()
    }

    /// Leaves every election, cancels every listener and closes the session.
    pub async fn stop(&self) {
        let electors: Vec<LeaderElector> = self.electors.lock().drain(..).collect();
        for elector in &electors {
            elector.stop();
        }
        self.watcher.remove_all();
        self.connection.stop().await;
        info!(electors = electors.len(), "keeper client stopped");
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn watcher(&self) -> &NodeWatcher {
        &self.watcher
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub async fn wait_until_connected(&self, timeout: Option<Duration>) -> KeeperResult<SessionId> {
        self.connection.wait_until_connected(timeout).await
    }

    pub fn add_state_listener(&self, listener: Arc<dyn SessionStateHandler>) {
        self.connection.add_state_listener(listener);
    }

    pub async fn set_data(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        mode: CreateMode,
    ) -> Option<String> {
        self.store.set_data(path, data, mode).await
    }

    pub async fn set(&self, path: &str, data: impl Into<Bytes>) -> Option<String> {
        self.store.set(path, data).await
    }

    pub async fn get_data(&self, path: &str) -> Option<Bytes> {
        self.store.get_data(path).await
    }

    pub async fn get_string(&self, path: &str) -> Option<String> {
        self.store.get_string(path).await
    }

    pub async fn get_data_with_stat(&self, path: &str) -> Option<(Bytes, Stat)> {
        self.store.get_data_with_stat(path).await
    }

    pub async fn get_children(&self, path: &str) -> Vec<String> {
        self.store.get_children(path).await
    }

    pub async fn exists(&self, path: &str) -> KeeperResult<bool> {
        self.store.exists(path).await
    }

    pub async fn delete(&self, path: &str, guaranteed: bool) -> bool {
        self.store.delete(path, guaranteed).await
    }

    pub async fn add_node_listener(
        &self,
        path: &str,
        handler: Arc<dyn NodeChangeHandler>,
    ) -> Option<ListenerId> {
        self.watcher.add_node_listener(path, handler).await
    }

    pub async fn add_child_node_listener(
        &self,
        path: &str,
        handler: Arc<dyn ChildChangeHandler>,
    ) -> Option<ListenerId> {
        self.watcher.add_child_node_listener(path, handler).await
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.watcher.remove_listener(id)
    }

    /// Joins the election at `election_path` and runs `task` whenever this
    /// client leads, until stopped.
    pub async fn take_leader_and_exec_task<A>(
        &self,
        election_path: &str,
        task: Arc<dyn LeadershipTask<A>>,
        args: A,
    ) -> Option<LeaderElector>
    where
        A: Send + Sync + 'static,
    {
        let elector = LeaderElector::start(self.store.clone(), election_path, task, args).await?;
        self.electors.lock().push(elector.clone());
        Some(elector)
    }
}
