//! [`CoordinationService`] over a ZooKeeper ensemble.
//!
//! Each keeper session owns one `zookeeper::ZooKeeper` handle. The handle's
//! calls block on its I/O thread, so they run on Tokio's blocking pool.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use keeper_core::{
    CoordinationService, CreateMode, KeeperError, KeeperResult, Session, SessionId,
    SessionOptions, Stat, Watcher,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zookeeper::{Acl, ZkResult, ZooKeeper};

use crate::convert;

/// Settings for [`ZookeeperCoordinationService`].
#[derive(Debug, Clone)]
pub struct ZookeeperServiceConfig {
    /// Session timeout requested when the client leaves it to the service
    pub default_session_timeout: Duration,
}

impl Default for ZookeeperServiceConfig {
    fn default() -> Self {
        Self {
            default_session_timeout: Duration::from_secs(30),
        }
    }
}

/// Talks to the ensemble named by the client's connect string.
pub struct ZookeeperCoordinationService {
    config: ZookeeperServiceConfig,
    handles: DashMap<SessionId, Arc<ZooKeeper>>,
    next_session_id: AtomicU64,
}

impl ZookeeperCoordinationService {
    pub fn new() -> Self {
        Self::with_config(ZookeeperServiceConfig::default())
    }

    pub fn with_config(config: ZookeeperServiceConfig) -> Self {
        Self {
            config,
            handles: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Number of open ensemble handles.
    pub fn open_sessions(&self) -> usize {
        self.handles.len()
    }

    fn handle(&self, session: SessionId) -> KeeperResult<Arc<ZooKeeper>> {
        self.handles
            .get(&session)
            .map(|entry| entry.value().clone())
            .ok_or(KeeperError::SessionExpired { session })
    }

    /// Runs `call` against the session's handle on the blocking pool.
    async fn call<T, F>(
        &self,
        session: SessionId,
        path: &str,
        expected_version: Option<i32>,
        call: F,
    ) -> KeeperResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ZooKeeper) -> ZkResult<T> + Send + 'static,
    {
        let handle = self.handle(session)?;
        let result = tokio::task::spawn_blocking(move || call(&handle))
            .await
            .map_err(|err| KeeperError::internal(format!("ensemble call failed: {err}")))?;
        result.map_err(|err| convert::error(err, path, session, expected_version))
    }
}

impl Default for ZookeeperCoordinationService {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards a fired ensemble watch to keeper's watcher.
fn forward(watcher: &Watcher, event: &zookeeper::WatchedEvent) {
    match convert::watched_event(event) {
        Some(converted) => {
            if !watcher.fire(converted) {
                debug!(watch = %watcher.id(), "watch receiver dropped");
            }
        }
        None => debug!(event_type = ?event.event_type, "ignoring ensemble watch event"),
    }
}

#[async_trait]
impl CoordinationService for ZookeeperCoordinationService {
    async fn open_session(&self, options: SessionOptions) -> KeeperResult<Session> {
        if options.connect_string.trim().is_empty() {
            return Err(KeeperError::Config("connect string cannot be empty".into()));
        }

        let id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::AcqRel));
        let timeout = options
            .session_timeout
            .unwrap_or(self.config.default_session_timeout);
        let (events_tx, events) = mpsc::unbounded_channel();
        let connect_string = options.connect_string.clone();

        let handle = tokio::task::spawn_blocking(move || {
            ZooKeeper::connect(&connect_string, timeout, move |event: zookeeper::WatchedEvent| {
                if let Some(session_event) = convert::session_event(&event) {
                    let _ = events_tx.send(session_event);
                }
            })
        })
        .await
        .map_err(|err| KeeperError::internal(format!("ensemble connect failed: {err}")))?
        .map_err(|err| {
            warn!(address = %options.connect_string, error = ?err, "cannot reach ensemble");
            KeeperError::connection_loss(format!(
                "cannot reach {}: {err:?}",
                options.connect_string
            ))
        })?;

        self.handles.insert(id, Arc::new(handle));
        info!(
            session = %id,
            address = %options.connect_string,
            timeout_ms = timeout.as_millis() as u64,
            "ensemble session opened"
        );
        Ok(Session {
            id,
            negotiated_timeout: timeout,
            events,
        })
    }

    async fn close_session(&self, session: SessionId) -> KeeperResult<()> {
        let Some((_, handle)) = self.handles.remove(&session) else {
            return Ok(());
        };
        let closed = tokio::task::spawn_blocking(move || handle.close()).await;
        match closed {
            Ok(Ok(())) => debug!(%session, "ensemble session closed"),
            Ok(Err(err)) => debug!(%session, error = ?err, "ensemble session close failed"),
            Err(err) => debug!(%session, error = %err, "ensemble session close task failed"),
        }
        Ok(())
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> KeeperResult<String> {
        let owned = path.to_string();
        self.call(session, path, None, move |zk| {
            zk.create(
                &owned,
                data.to_vec(),
                Acl::open_unsafe().clone(),
                convert::create_mode(mode),
            )
        })
        .await
    }

    async fn set_data(
        &self,
        session: SessionId,
        path: &str,
        data: Bytes,
        version: Option<i32>,
    ) -> KeeperResult<Stat> {
        let owned = path.to_string();
        let stat = self
            .call(session, path, version, move |zk| {
                zk.set_data(&owned, data.to_vec(), version)
            })
            .await?;
        Ok(convert::stat(&stat))
    }

    async fn get_data(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<(Bytes, Stat)> {
        let owned = path.to_string();
        let (data, stat) = self
            .call(session, path, None, move |zk| match watcher {
                Some(watcher) => zk.get_data_w(&owned, move |event: zookeeper::WatchedEvent| {
                    forward(&watcher, &event)
                }),
                None => zk.get_data(&owned, false),
            })
            .await?;
        Ok((Bytes::from(data), convert::stat(&stat)))
    }

    async fn exists(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<Option<Stat>> {
        let owned = path.to_string();
        let stat = self
            .call(session, path, None, move |zk| match watcher {
                Some(watcher) => zk.exists_w(&owned, move |event: zookeeper::WatchedEvent| {
                    forward(&watcher, &event)
                }),
                None => zk.exists(&owned, false),
            })
            .await?;
        Ok(stat.as_ref().map(convert::stat))
    }

    async fn get_children(
        &self,
        session: SessionId,
        path: &str,
        watcher: Option<Watcher>,
    ) -> KeeperResult<Vec<String>> {
        let owned = path.to_string();
        self.call(session, path, None, move |zk| match watcher {
            Some(watcher) => zk.get_children_w(&owned, move |event: zookeeper::WatchedEvent| {
                forward(&watcher, &event)
            }),
            None => zk.get_children(&owned, false),
        })
        .await
    }

    async fn delete(&self, session: SessionId, path: &str, version: Option<i32>) -> KeeperResult<()> {
        let owned = path.to_string();
        self.call(session, path, version, move |zk| zk.delete(&owned, version))
            .await
    }
}
