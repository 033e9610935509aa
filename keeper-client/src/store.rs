//! # Node Store
//!
//! Direct CRUD access to coordination nodes over the managed session.
//!
//! Reads and writes report failure with `None`, an empty list or `false`
//! and log the cause; only [`NodeStore::exists`] hands the error to the
//! caller, since "absent" and "unknown" must not be confused there.

use bytes::Bytes;
use dashmap::DashMap;
use keeper_core::path::{self, ROOT};
use keeper_core::{CreateMode, KeeperError, KeeperResult, Stat};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connection::{shutdown_signalled, ConnectionManager};

#[derive(Clone)]
pub struct NodeStore {
    connection: Arc<ConnectionManager>,
    pending_deletes: Arc<DashMap<String, Instant>>,
}

impl NodeStore {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            pending_deletes: Arc::new(DashMap::new()),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Writes `data` at `path`, creating the node and any missing ancestors
    /// when absent. Returns the path written, which carries the sequence
    /// suffix for sequential modes.
    pub async fn set_data(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        mode: CreateMode,
    ) -> Option<String> {
        let data = data.into();
        if let Err(err) = check_write(path, &data) {
            error!(path, error = %err, "rejected setData");
            return None;
        }

        match self.write(path, data, mode).await {
            Ok(written) => Some(written),
            Err(err) => {
                error!(path, %mode, error = %err, "setData failed");
                None
            }
        }
    }

    /// `set_data` with [`CreateMode::Persistent`].
    pub async fn set(&self, path: &str, data: impl Into<Bytes>) -> Option<String> {
        self.set_data(path, data, CreateMode::Persistent).await
    }

    async fn write(&self, path: &str, data: Bytes, mode: CreateMode) -> KeeperResult<String> {
        let service = self.connection.service();

        if !mode.is_sequential() {
            let present = self
                .connection
                .with_retry("exists", move |session| service.exists(session, path, None))
                .await?;
            if present.is_some() {
                self.overwrite(path, data).await?;
                return Ok(path.to_string());
            }
        }

        for ancestor in path::ancestors(path) {
            let ancestor = ancestor.as_str();
            let created = self
                .connection
                .with_retry("create", move |session| {
                    service.create(session, ancestor, Bytes::new(), CreateMode::Persistent)
                })
                .await;
            match created {
                Ok(_) => debug!(path = ancestor, "created ancestor"),
                Err(err) if err.is_node_exists() => {}
                Err(err) => return Err(err),
            }
        }

        let payload = data.clone();
        let created = self
            .connection
            .with_retry("create", move |session| {
                service.create(session, path, payload.clone(), mode)
            })
            .await;
        match created {
            Ok(written) => Ok(written),
            Err(err) if err.is_node_exists() && !mode.is_sequential() => {
                debug!(path, "lost create race, overwriting");
                self.overwrite(path, data).await?;
                Ok(path.to_string())
            }
            Err(err) => Err(err),
        }
    }

    async fn overwrite(&self, path: &str, data: Bytes) -> KeeperResult<Stat> {
        let service = self.connection.service();
        self.connection
            .with_retry("setData", move |session| {
                service.set_data(session, path, data.clone(), None)
            })
            .await
    }

    /// Payload of `path`, `None` when absent or unreadable.
    pub async fn get_data(&self, path: &str) -> Option<Bytes> {
        self.get_data_with_stat(path).await.map(|(data, _)| data)
    }

    /// Payload decoded as UTF-8.
    pub async fn get_string(&self, path: &str) -> Option<String> {
        let data = self.get_data(path).await?;
        match String::from_utf8(data.to_vec()) {
            Ok(text) => Some(text),
            Err(err) => {
                error!(path, error = %err, "node payload is not valid UTF-8");
                None
            }
        }
    }

    pub async fn get_data_with_stat(&self, path: &str) -> Option<(Bytes, Stat)> {
        if let Err(err) = path::validate_path(path) {
            error!(path, error = %err, "rejected getData");
            return None;
        }
        let service = self.connection.service();
        match self
            .connection
            .with_retry("getData", move |session| {
                service.get_data(session, path, None)
            })
            .await
        {
            Ok(found) => Some(found),
            Err(err) if err.is_no_node() => {
                debug!(path, "getData on absent node");
                None
            }
            Err(err) => {
                error!(path, error = %err, "getData failed");
                None
            }
        }
    }

    /// Sorted names of the immediate children; empty when absent.
    pub async fn get_children(&self, path: &str) -> Vec<String> {
        if let Err(err) = path::validate_path(path) {
            error!(path, error = %err, "rejected getChildren");
            return Vec::new();
        }
        match self.children(path).await {
            Ok(mut children) => {
                children.sort();
                children
            }
            Err(err) if err.is_no_node() => Vec::new(),
            Err(err) => {
                error!(path, error = %err, "getChildren failed");
                Vec::new()
            }
        }
    }

    async fn children(&self, path: &str) -> KeeperResult<Vec<String>> {
        let service = self.connection.service();
        self.connection
            .with_retry("getChildren", move |session| {
                service.get_children(session, path, None)
            })
            .await
    }

    /// `Ok(false)` when the node is absent; `Err` when the service could not
    /// answer.
    pub async fn exists(&self, path: &str) -> KeeperResult<bool> {
        path::validate_path(path)?;
        let service = self.connection.service();
        let stat = self
            .connection
            .with_retry("exists", move |session| service.exists(session, path, None))
            .await?;
        Ok(stat.is_some())
    }

    /// Deletes `path` and everything below it.
    ///
    /// Best-effort deletes log and swallow failures. A guaranteed delete that
    /// fails keeps retrying in the background, across reconnects, until the
    /// node is confirmed gone. Returns true when the node is gone on return.
    pub async fn delete(&self, path: &str, guaranteed: bool) -> bool {
        if let Err(err) = path::validate_path(path) {
            error!(path, error = %err, "rejected delete");
            return false;
        }
        if path == ROOT {
            error!(path, "refusing to delete the root node");
            return false;
        }

        match self.delete_recursive(path).await {
            Ok(()) => true,
            Err(err) if guaranteed && !matches!(err, KeeperError::NotStarted) => {
                warn!(path, error = %err, "delete failed, retrying in the background");
                self.spawn_guaranteed_delete(path.to_string());
                false
            }
            Err(err) => {
                error!(path, error = %err, "delete failed");
                false
            }
        }
    }

    /// Paths whose guaranteed delete is still being retried.
    pub fn pending_deletes(&self) -> Vec<String> {
        let mut paths: Vec<_> = self
            .pending_deletes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        paths
    }

    fn spawn_guaranteed_delete(&self, path: String) {
        if self
            .pending_deletes
            .insert(path.clone(), Instant::now())
            .is_some()
        {
            return;
        }

        let store = self.clone();
        let mut shutdown = self.connection.shutdown_receiver();
        tokio::spawn(async move {
            let retry = *store.connection.retry_policy();
            let mut round: u32 = 0;
            loop {
                let delay = retry.sleep_for(round.min(retry.max_retries()));
                tokio::select! {
                    _ = shutdown_signalled(&mut shutdown) => {
                        warn!(path = %path, "client stopped before guaranteed delete completed");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                match store.delete_recursive(&path).await {
                    Ok(()) => {
                        info!(path = %path, rounds = round + 1, "guaranteed delete completed");
                        break;
                    }
                    Err(KeeperError::Closed) => break,
                    Err(err) => {
                        debug!(path = %path, error = %err, "guaranteed delete still failing");
                        round = round.saturating_add(1);
                    }
                }
            }
            store.pending_deletes.remove(&path);
        });
    }

    /// Deletes the subtree at `path`, leaves first. An absent node counts as
    /// deleted.
    async fn delete_recursive(&self, path: &str) -> KeeperResult<()> {
        let mut pending = vec![path.to_string()];
        let mut order = Vec::new();
        while let Some(current) = pending.pop() {
            match self.children(&current).await {
                Ok(children) => pending.extend(children.iter().map(|c| path::join(&current, c))),
                Err(err) if err.is_no_node() => continue,
                Err(err) => return Err(err),
            }
            order.push(current);
        }

        let service = self.connection.service();
        for node in order.iter().rev() {
            let node = node.as_str();
            match self
                .connection
                .with_retry("delete", move |session| service.delete(session, node, None))
                .await
            {
                Ok(()) => debug!(path = node, "deleted node"),
                Err(err) if err.is_no_node() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Local precondition checks for writes; nothing is sent when these fail.
fn check_write(path: &str, data: &Bytes) -> KeeperResult<()> {
    path::validate_path(path)?;
    if path == ROOT {
        return Err(KeeperError::invalid_path(path, "the root cannot be written"));
    }
    if data.is_empty() {
        return Err(KeeperError::invalid_path(path, "data cannot be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_core::KeeperConfig;
    use keeper_memory::MemoryCoordinationService;
    use std::time::Duration;

    async fn started() -> (Arc<MemoryCoordinationService>, NodeStore) {
        let service = Arc::new(MemoryCoordinationService::new());
        let config = KeeperConfig::new("memory:2181").with_retry(Duration::from_millis(5), 2);
        let connection = Arc::new(ConnectionManager::new(config, service.clone()).unwrap());
        connection.init().unwrap();
        connection.wait_until_connected(None).await.unwrap();
        (service, NodeStore::new(connection))
    }

    #[tokio::test]
    async fn test_set_creates_ancestors() {
        let (_service, store) = started().await;
        assert_eq!(store.set("/a/b/c", "v1").await.as_deref(), Some("/a/b/c"));
        assert_eq!(store.get_string("/a/b/c").await.as_deref(), Some("v1"));
        assert!(store.exists("/a").await.unwrap());
        assert!(store.exists("/a/b").await.unwrap());
        assert_eq!(store.get_children("/a").await, vec!["b".to_string()]);

        assert_eq!(store.set("/a/b/c", "v2").await.as_deref(), Some("/a/b/c"));
        let (data, stat) = store.get_data_with_stat("/a/b/c").await.unwrap();
        assert_eq!(data, Bytes::from("v2"));
        assert_eq!(stat.version, 1);
    }

    #[tokio::test]
    async fn test_sequential_returns_actual_path() {
        let (_service, store) = started().await;
        let first = store
            .set_data("/jobs/job-", "x", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = store
            .set_data("/jobs/job-", "y", CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(first, "/jobs/job-0000000000");
        assert_eq!(second, "/jobs/job-0000000001");
        assert_eq!(store.get_children("/jobs").await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_writes_do_not_reach_service() {
        let (service, store) = started().await;
        let before = service.operation_count();
        assert!(store.set("", "x").await.is_none());
        assert!(store.set("/a", "").await.is_none());
        assert!(store.set("relative", "x").await.is_none());
        assert_eq!(service.operation_count(), before);
    }

    #[tokio::test]
    async fn test_ephemeral_parent_rejects_children() {
        let (_service, store) = started().await;
        store
            .set_data("/eph", "x", CreateMode::Ephemeral)
            .await
            .unwrap();
        assert!(store.set("/eph/child", "y").await.is_none());
    }

    #[tokio::test]
    async fn test_reads_on_absent_nodes() {
        let (_service, store) = started().await;
        assert!(store.get_data("/missing").await.is_none());
        assert!(store.get_children("/missing").await.is_empty());
        assert!(!store.exists("/missing").await.unwrap());
        assert!(store.exists("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_exists_surfaces_service_errors() {
        let (service, store) = started().await;
        service.set_available(false);
        assert!(store.exists("/").await.is_err());
        assert!(store.get_data("/").await.is_none());
        service.set_available(true);
    }

    #[tokio::test]
    async fn test_delete_is_recursive() {
        let (_service, store) = started().await;
        store.set("/tree/a/x", "1").await.unwrap();
        store.set("/tree/b", "2").await.unwrap();
        assert!(store.delete("/tree", false).await);
        for path in ["/tree", "/tree/a", "/tree/a/x", "/tree/b"] {
            assert!(!store.exists(path).await.unwrap());
        }
        assert!(store.delete("/tree", false).await);
        assert!(!store.delete("/", false).await);
    }

    #[tokio::test]
    async fn test_guaranteed_delete_retries_in_background() {
        let (service, store) = started().await;
        store.set("/doomed", "x").await.unwrap();

        service.set_available(false);
        assert!(!store.delete("/doomed", true).await);
        assert_eq!(store.pending_deletes(), vec!["/doomed".to_string()]);

        service.set_available(true);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !store.pending_deletes().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!store.exists("/doomed").await.unwrap());
    }

    #[tokio::test]
    async fn test_operations_before_init() {
        let service = Arc::new(MemoryCoordinationService::new());
        let connection =
            Arc::new(ConnectionManager::new(KeeperConfig::new("memory:2181"), service).unwrap());
        let store = NodeStore::new(connection);
        assert!(store.set("/a", "x").await.is_none());
        assert!(store.get_data("/a").await.is_none());
        assert!(matches!(store.exists("/a").await, Err(KeeperError::NotStarted)));
    }
}
