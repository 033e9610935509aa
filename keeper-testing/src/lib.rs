//! Testing utilities for the keeper client.
//!
//! [`TestCluster`] wraps one in-memory coordination service and hands out
//! connected clients with fast timeouts. The recording handlers capture
//! callbacks so tests can assert on exactly what was delivered.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use keeper_client::{
    ChildChangeHandler, ChildEventKind, KeeperClient, NodeChangeHandler, NodeSnapshot,
    SessionStateHandler,
};
use keeper_core::{KeeperConfig, SessionId};
use keeper_memory::MemoryCoordinationService;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default wait used by the integration tests.
pub const WAIT: Duration = Duration::from_secs(3);

/// Initialise logging once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

/// One in-memory service shared by any number of clients.
pub struct TestCluster {
    service: Arc<MemoryCoordinationService>,
    clients: Mutex<Vec<Arc<KeeperClient>>>,
}

impl TestCluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            service: Arc::new(MemoryCoordinationService::new()),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &Arc<MemoryCoordinationService> {
        &self.service
    }

    /// Client settings with short sleeps and a 500ms session timeout.
    pub fn config() -> KeeperConfig {
        KeeperConfig::new("memory-1:2181,memory-2:2181")
            .with_session_timeout(Duration::from_millis(500))
            .with_connection_timeout(Duration::from_secs(2))
            .with_retry(Duration::from_millis(10), 3)
            .with_max_sleep(Duration::from_millis(100))
    }

    /// A client that is initialised and connected.
    pub async fn client(&self) -> anyhow::Result<Arc<KeeperClient>> {
        let client = Arc::new(KeeperClient::new(Self::config(), self.service.clone())?);
        client.init()?;
        client
            .wait_until_connected(Some(WAIT))
            .await
            .context("client did not connect")?;
        self.clients.lock().push(client.clone());
        Ok(client)
    }

    /// Session currently held by `client`.
    pub fn session_of(client: &KeeperClient) -> anyhow::Result<SessionId> {
        client
            .connection()
            .current_session()
            .map(|active| active.id)
            .context("client has no session")
    }

    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.clients.lock().drain(..).collect();
        for client in clients {
            client.stop().await;
        }
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_for<F>(timeout: Duration, what: &str, condition: F) -> anyhow::Result<()>
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Records the payload of every node change, `None` for deletions.
#[derive(Default)]
pub struct RecordingNodeHandler {
    events: Mutex<Vec<Option<String>>>,
}

impl RecordingNodeHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Option<String>> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }
}

#[async_trait]
impl NodeChangeHandler for RecordingNodeHandler {
    async fn on_node_changed(&self, snapshot: &NodeSnapshot) {
        self.events
            .lock()
            .push(snapshot.data_utf8().map(str::to_string));
    }
}

/// Records every child event as `(kind, child, payload)`.
#[derive(Default)]
pub struct RecordingChildHandler {
    events: Mutex<Vec<(ChildEventKind, String, String)>>,
}

impl RecordingChildHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(ChildEventKind, String, String)> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }
}

#[async_trait]
impl ChildChangeHandler for RecordingChildHandler {
    async fn on_child_event(&self, kind: ChildEventKind, child: &str, data: &Bytes) {
        self.events.lock().push((
            kind,
            child.to_string(),
            String::from_utf8_lossy(data).into_owned(),
        ));
    }
}

/// Counts `reconnected` calls.
#[derive(Default)]
pub struct CountingStateHandler {
    reconnects: AtomicUsize,
}

impl CountingStateHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStateHandler for CountingStateHandler {
    async fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}
