//! # Persistent Watches
//!
//! The service only offers one-shot watches. A [`NodeWatcher`] listener keeps
//! one armed at all times: every delivery re-reads the node with a fresh
//! watch, compares the result against its cache and hands real changes to
//! the handler through a [`SerialDispatcher`]. After `RECONNECTED` the cache
//! is re-synchronised the same way.
//!
//! Deduplication is by `Stat` revision, so a re-armed watch that fires twice
//! for one write never produces a second handler call.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use keeper_core::path;
use keeper_core::{ConnectionState, KeeperError, KeeperResult, Stat, WatchedEvent, Watcher};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{shutdown_signalled, ConnectionManager};
use crate::dispatcher::{
    ChildChangeHandler, ChildEvent, ChildEventKind, NodeChangeHandler, NodeSnapshot,
    SerialDispatcher,
};

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a listener is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Node,
    Children,
}

struct ListenerEntry {
    path: String,
    kind: ListenerKind,
    cancel: watch::Sender<bool>,
}

/// Registry of persistent node and child-set listeners.
pub struct NodeWatcher {
    connection: Arc<ConnectionManager>,
    listeners: DashMap<ListenerId, ListenerEntry>,
}

impl NodeWatcher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            listeners: DashMap::new(),
        }
    }

    /// Watches the data of an existing node. Returns `None`, leaving no watch
    /// behind, when the node is absent or the service cannot be reached.
    pub async fn add_node_listener(
        &self,
        path: &str,
        handler: Arc<dyn NodeChangeHandler>,
    ) -> Option<ListenerId> {
        if let Err(err) = path::validate_path(path) {
            error!(path, error = %err, "rejected node listener");
            return None;
        }

        let (watcher, events) = Watcher::channel();
        let transitions = self.connection.subscribe_state();
        let service = self.connection.service();
        let arming = watcher.clone();
        let (data, stat) = match self
            .connection
            .with_retry("addNodeListener", move |session| {
                service.get_data(session, path, Some(arming.clone()))
            })
            .await
        {
            Ok(found) => found,
            Err(err) => {
                error!(path, error = %err, "failed to register node listener");
                return None;
            }
        };

        let dispatcher = SerialDispatcher::spawn(format!("node:{path}"), move |snapshot: NodeSnapshot| {
            let handler = handler.clone();
            async move { handler.on_node_changed(&snapshot).await }
        });
        let cache = NodeCache {
            path: path.to_string(),
            connection: self.connection.clone(),
            watcher,
            current: NodeSnapshot::present(path, data, stat),
            dispatcher,
        };

        let id = self.register(path, ListenerKind::Node, cache, events, transitions);
        info!(path, listener = %id, "node listener registered");
        Some(id)
    }

    /// Watches the immediate children of an existing node. Children present
    /// at registration are cached without being reported.
    pub async fn add_child_node_listener(
        &self,
        path: &str,
        handler: Arc<dyn ChildChangeHandler>,
    ) -> Option<ListenerId> {
        if let Err(err) = path::validate_path(path) {
            error!(path, error = %err, "rejected child listener");
            return None;
        }

        let (watcher, events) = Watcher::channel();
        let transitions = self.connection.subscribe_state();
        let service = self.connection.service();
        let arming = watcher.clone();
        let names = match self
            .connection
            .with_retry("addChildNodeListener", move |session| {
                service.get_children(session, path, Some(arming.clone()))
            })
            .await
        {
            Ok(names) => names,
            Err(err) => {
                error!(path, error = %err, "failed to register child listener");
                return None;
            }
        };

        let dispatcher = SerialDispatcher::spawn(format!("children:{path}"), move |event: ChildEvent| {
            let handler = handler.clone();
            async move {
                handler
                    .on_child_event(event.kind, &event.name, &event.data)
                    .await
            }
        });
        let mut cache = ChildCache {
            path: path.to_string(),
            connection: self.connection.clone(),
            watcher,
            children: BTreeMap::new(),
            parent_present: true,
            dispatcher,
        };
        for name in names {
            match cache.read_child(&name).await {
                Ok(Some(entry)) => {
                    cache.children.insert(name, entry);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(path, child = %name, error = %err, "failed to read child");
                }
            }
        }

        let cached = cache.children.len();
        let id = self.register(path, ListenerKind::Children, cache, events, transitions);
        info!(path, listener = %id, cached, "child listener registered");
        Some(id)
    }

    /// Cancels a listener. Events already queued are still delivered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        match self.listeners.remove(&id) {
            Some((_, entry)) => {
                entry.cancel.send_replace(true);
                debug!(path = %entry.path, kind = ?entry.kind, listener = %id, "listener removed");
                true
            }
            None => false,
        }
    }

    /// Cancels every listener.
    pub fn remove_all(&self) {
        let ids: Vec<ListenerId> = self.listeners.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.remove_listener(id);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Path and kind of every registered listener.
    pub fn listeners(&self) -> Vec<(ListenerId, String, ListenerKind)> {
        self.listeners
            .iter()
            .map(|entry| (*entry.key(), entry.path.clone(), entry.kind))
            .collect()
    }

    fn register<C: WatchCache>(
        &self,
        path: &str,
        kind: ListenerKind,
        cache: C,
        events: mpsc::UnboundedReceiver<WatchedEvent>,
        transitions: broadcast::Receiver<ConnectionState>,
    ) -> ListenerId {
        let id = ListenerId::new();
        let (cancel, cancelled) = watch::channel(false);
        self.listeners.insert(
            id,
            ListenerEntry {
                path: path.to_string(),
                kind,
                cancel,
            },
        );
        let shutdown = self.connection.shutdown_receiver();
        tokio::spawn(drive(
            self.connection.clone(),
            cache,
            events,
            transitions,
            cancelled,
            shutdown,
        ));
        id
    }
}

/// Cache behind one listener, driven by [`drive`].
///
/// An `Err` from either method means the watch may not be armed; `drive`
/// keeps calling `resync` until one succeeds.
#[async_trait]
trait WatchCache: Send + 'static {
    /// A one-shot watch fired.
    async fn on_event(&mut self, event: WatchedEvent) -> KeeperResult<()>;

    /// Reconciles with the service and re-arms every watch.
    async fn resync(&mut self) -> KeeperResult<()>;

    fn path(&self) -> &str;

    fn close(self);
}

async fn drive<C: WatchCache>(
    connection: Arc<ConnectionManager>,
    mut cache: C,
    mut events: mpsc::UnboundedReceiver<WatchedEvent>,
    mut transitions: broadcast::Receiver<ConnectionState>,
    mut cancelled: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rearm = Rearm::default();
    loop {
        // only a full resync clears a pending re-arm
        let (outcome, resynced) = tokio::select! {
            _ = shutdown_signalled(&mut cancelled) => break,
            _ = shutdown_signalled(&mut shutdown) => break,
            event = events.recv() => match event {
                Some(event) => {
                    debug!(path = %event.path, kind = %event.kind, "watch fired");
                    (cache.on_event(event).await, false)
                }
                None => break,
            },
            transition = transitions.recv() => match transition {
                Ok(ConnectionState::Reconnected) => (cache.resync().await, true),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(path = cache.path(), skipped, "missed connection transitions");
                    (cache.resync().await, true)
                }
                Err(RecvError::Closed) => break,
            },
            _ = rearm.due() => (cache.resync().await, true),
        };

        match outcome {
            Ok(()) if resynced => rearm.armed(),
            Ok(()) => {}
            Err(KeeperError::Closed) => break,
            Err(err) => {
                let delay = connection.retry_policy().sleep_for(rearm.failures);
                warn!(
                    path = cache.path(),
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "watch not armed, retrying"
                );
                rearm.schedule(delay);
            }
        }
    }
    debug!(path = cache.path(), "listener stopped");
    cache.close();
}

/// Pending re-arm attempt of a listener whose last refresh failed.
#[derive(Default)]
struct Rearm {
    at: Option<Instant>,
    failures: u32,
}

impl Rearm {
    fn schedule(&mut self, delay: std::time::Duration) {
        self.at = Some(Instant::now() + delay);
        self.failures = self.failures.saturating_add(1);
    }

    fn armed(&mut self) {
        self.at = None;
        self.failures = 0;
    }

    /// Resolves when the scheduled attempt is due; never while armed.
    async fn due(&self) {
        match self.at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

struct NodeCache {
    path: String,
    connection: Arc<ConnectionManager>,
    watcher: Watcher,
    current: NodeSnapshot,
    dispatcher: SerialDispatcher<NodeSnapshot>,
}

impl NodeCache {
    /// Reads the node and leaves a watch whether or not it exists.
    async fn read(&self) -> KeeperResult<NodeSnapshot> {
        let service = self.connection.service();
        let path = self.path.as_str();
        let watcher = &self.watcher;

        loop {
            match self
                .connection
                .with_retry("getData", move |session| {
                    service.get_data(session, path, Some(watcher.clone()))
                })
                .await
            {
                Ok((data, stat)) => return Ok(NodeSnapshot::present(path, data, stat)),
                Err(err) if err.is_no_node() => {}
                Err(err) => return Err(err),
            }

            let stat = self
                .connection
                .with_retry("exists", move |session| {
                    service.exists(session, path, Some(watcher.clone()))
                })
                .await?;
            if stat.is_none() {
                return Ok(NodeSnapshot::deleted(path));
            }
            // recreated between the two reads
        }
    }

    async fn refresh(&mut self) -> KeeperResult<()> {
        let snapshot = self.read().await?;
        if snapshot.differs_from(&self.current) {
            self.current = snapshot.clone();
            self.dispatcher.dispatch(snapshot);
        } else {
            debug!(path = %self.path, "node unchanged");
        }
        Ok(())
    }
}

#[async_trait]
impl WatchCache for NodeCache {
    async fn on_event(&mut self, _event: WatchedEvent) -> KeeperResult<()> {
        self.refresh().await
    }

    async fn resync(&mut self) -> KeeperResult<()> {
        self.refresh().await
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn close(self) {
        drop(self.dispatcher.close());
    }
}

struct ChildCache {
    path: String,
    connection: Arc<ConnectionManager>,
    watcher: Watcher,
    children: BTreeMap<String, (Bytes, Stat)>,
    parent_present: bool,
    dispatcher: SerialDispatcher<ChildEvent>,
}

impl ChildCache {
    /// Reads one child and leaves a data watch on it.
    async fn read_child(&self, name: &str) -> KeeperResult<Option<(Bytes, Stat)>> {
        let child = path::join(&self.path, name);
        let child = child.as_str();
        let service = self.connection.service();
        let watcher = &self.watcher;
        match self
            .connection
            .with_retry("getData", move |session| {
                service.get_data(session, child, Some(watcher.clone()))
            })
            .await
        {
            Ok(entry) => Ok(Some(entry)),
            Err(err) if err.is_no_node() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn emit(&self, kind: ChildEventKind, name: String, data: Bytes) {
        debug!(path = %self.path, %kind, child = %name, "child event");
        self.dispatcher.dispatch(ChildEvent { kind, name, data });
    }

    async fn refresh_children(&mut self) -> KeeperResult<()> {
        let service = self.connection.service().clone();
        let path = self.path.clone();
        let watcher = self.watcher.clone();

        loop {
            let listed = self
                .connection
                .with_retry("getChildren", |session| {
                    service.get_children(session, &path, Some(watcher.clone()))
                })
                .await;

            match listed {
                Ok(names) => {
                    self.parent_present = true;
                    return self.reconcile(names).await;
                }
                Err(err) if err.is_no_node() => {
                    if self.parent_present {
                        info!(path = %path, "watched parent deleted");
                        self.parent_present = false;
                    }
                    let removed = std::mem::take(&mut self.children);
                    for (name, (data, _)) in removed {
                        self.emit(ChildEventKind::Removed, name, data);
                    }

                    let parent = self
                        .connection
                        .with_retry("exists", |session| {
                            service.exists(session, &path, Some(watcher.clone()))
                        })
                        .await?;
                    if parent.is_none() {
                        return Ok(());
                    }
                    // recreated meanwhile
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reports membership changes. A child that cannot be read is left out
    /// of the cache so the next resync reports it.
    async fn reconcile(&mut self, names: Vec<String>) -> KeeperResult<()> {
        let listed: BTreeSet<String> = names.into_iter().collect();

        let gone: Vec<String> = self
            .children
            .keys()
            .filter(|name| !listed.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some((data, _)) = self.children.remove(&name) {
                self.emit(ChildEventKind::Removed, name, data);
            }
        }

        let mut failure = None;
        for name in listed {
            if self.children.contains_key(&name) {
                continue;
            }
            match self.read_child(&name).await {
                Ok(Some((data, stat))) => {
                    self.children.insert(name.clone(), (data.clone(), stat));
                    self.emit(ChildEventKind::Added, name, data);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(path = %self.path, child = %name, error = %err, "failed to read child");
                    failure = Some(err);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    async fn refresh_child(&mut self, name: &str) -> KeeperResult<()> {
        if !self.children.contains_key(name) {
            return Ok(());
        }
        // removal is reported from the parent's child watch
        if let Some((data, stat)) = self.read_child(name).await? {
            let changed = match self.children.get_mut(name) {
                Some(entry) if !entry.1.same_revision(&stat) => {
                    *entry = (data.clone(), stat);
                    true
                }
                _ => false,
            };
            if changed {
                self.emit(ChildEventKind::Updated, name.to_string(), data);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WatchCache for ChildCache {
    async fn on_event(&mut self, event: WatchedEvent) -> KeeperResult<()> {
        if event.path == self.path {
            self.refresh_children().await
        } else if path::parent(&event.path) == Some(self.path.as_str()) {
            let name = path::node_name(&event.path).to_string();
            self.refresh_child(&name).await
        } else {
            Ok(())
        }
    }

    async fn resync(&mut self) -> KeeperResult<()> {
        self.refresh_children().await?;
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            self.refresh_child(&name).await?;
        }
        Ok(())
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn close(self) {
        drop(self.dispatcher.close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeStore;
    use keeper_core::KeeperConfig;
    use keeper_memory::MemoryCoordinationService;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNodeHandler {
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl NodeChangeHandler for RecordingNodeHandler {
        async fn on_node_changed(&self, snapshot: &NodeSnapshot) {
            self.seen
                .lock()
                .push(snapshot.data_utf8().map(str::to_string));
        }
    }

    #[derive(Default)]
    struct RecordingChildHandler {
        seen: Mutex<Vec<(ChildEventKind, String, String)>>,
    }

    #[async_trait]
    impl ChildChangeHandler for RecordingChildHandler {
        async fn on_child_event(&self, kind: ChildEventKind, child: &str, data: &Bytes) {
            self.seen.lock().push((
                kind,
                child.to_string(),
                String::from_utf8_lossy(data).into_owned(),
            ));
        }
    }

    async fn setup() -> (Arc<MemoryCoordinationService>, NodeStore, NodeWatcher) {
        let service = Arc::new(MemoryCoordinationService::new());
        let config = KeeperConfig::new("memory:2181").with_retry(Duration::from_millis(5), 2);
        let connection = Arc::new(ConnectionManager::new(config, service.clone()).unwrap());
        connection.init().unwrap();
        connection.wait_until_connected(None).await.unwrap();
        (
            service,
            NodeStore::new(connection.clone()),
            NodeWatcher::new(connection),
        )
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_node_listener_requires_existing_node() {
        let (service, _store, watcher) = setup().await;
        let handler = Arc::new(RecordingNodeHandler::default());
        assert!(watcher.add_node_listener("/missing", handler).await.is_none());
        assert_eq!(service.get_stats().active_watches, 0);
        assert_eq!(watcher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_node_listener_stays_armed() {
        let (_service, store, watcher) = setup().await;
        store.set("/config", "v0").await.unwrap();
        let handler = Arc::new(RecordingNodeHandler::default());
        watcher
            .add_node_listener("/config", handler.clone())
            .await
            .unwrap();

        for value in ["v1", "v2", "v3"] {
            let expected = handler.seen.lock().len() + 1;
            store.set("/config", value).await.unwrap();
            eventually(|| handler.seen.lock().len() == expected).await;
        }
        assert_eq!(
            *handler.seen.lock(),
            vec![Some("v1".into()), Some("v2".into()), Some("v3".into())]
        );
    }

    #[tokio::test]
    async fn test_node_listener_reports_delete_and_recreate() {
        let (_service, store, watcher) = setup().await;
        store.set("/flag", "on").await.unwrap();
        let handler = Arc::new(RecordingNodeHandler::default());
        watcher.add_node_listener("/flag", handler.clone()).await.unwrap();

        assert!(store.delete("/flag", false).await);
        eventually(|| handler.seen.lock().len() == 1).await;
        store.set("/flag", "again").await.unwrap();
        eventually(|| handler.seen.lock().len() == 2).await;
        assert_eq!(*handler.seen.lock(), vec![None, Some("again".into())]);
    }

    #[tokio::test]
    async fn test_removed_listener_is_silent() {
        let (_service, store, watcher) = setup().await;
        store.set("/quiet", "0").await.unwrap();
        let handler = Arc::new(RecordingNodeHandler::default());
        let id = watcher
            .add_node_listener("/quiet", handler.clone())
            .await
            .unwrap();
        assert!(watcher.remove_listener(id));
        assert!(!watcher.remove_listener(id));

        store.set("/quiet", "1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_child_listener_events() {
        let (_service, store, watcher) = setup().await;
        store.set("/services/existing", "e").await.unwrap();
        let handler = Arc::new(RecordingChildHandler::default());
        watcher
            .add_child_node_listener("/services", handler.clone())
            .await
            .unwrap();

        store.set("/services/web", "w1").await.unwrap();
        eventually(|| handler.seen.lock().len() == 1).await;
        store.set("/services/web", "w2").await.unwrap();
        eventually(|| handler.seen.lock().len() == 2).await;
        assert!(store.delete("/services/web", false).await);
        eventually(|| handler.seen.lock().len() == 3).await;

        assert_eq!(
            *handler.seen.lock(),
            vec![
                (ChildEventKind::Added, "web".to_string(), "w1".to_string()),
                (ChildEventKind::Updated, "web".to_string(), "w2".to_string()),
                (ChildEventKind::Removed, "web".to_string(), "w2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_child_listener_parent_deleted() {
        let (_service, store, watcher) = setup().await;
        store.set("/pool/a", "1").await.unwrap();
        let handler = Arc::new(RecordingChildHandler::default());
        watcher
            .add_child_node_listener("/pool", handler.clone())
            .await
            .unwrap();

        assert!(store.delete("/pool", false).await);
        eventually(|| handler.seen.lock().len() == 1).await;
        assert_eq!(handler.seen.lock()[0].0, ChildEventKind::Removed);

        // the listener waits for the parent to come back
        store.set("/pool/b", "2").await.unwrap();
        eventually(|| handler.seen.lock().len() == 2).await;
        assert_eq!(
            handler.seen.lock()[1],
            (ChildEventKind::Added, "b".to_string(), "2".to_string())
        );
    }

    #[tokio::test]
    async fn test_node_listener_rearms_after_outage() {
        use keeper_core::CoordinationService;

        let (service, store, watcher) = setup().await;
        store.set("/n", "0").await.unwrap();
        let handler = Arc::new(RecordingNodeHandler::default());
        watcher.add_node_listener("/n", handler.clone()).await.unwrap();

        // the refresh for this write runs while the service is down
        let session = store.connection().current_session().unwrap().id;
        service
            .set_data(session, "/n", Bytes::from("1"), None)
            .await
            .unwrap();
        service.set_available(false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handler.seen.lock().is_empty());
        assert_eq!(store.connection().state(), ConnectionState::Connected);
        service.set_available(true);

        eventually(|| handler.seen.lock().len() == 1).await;
        for value in ["2", "3"] {
            let expected = handler.seen.lock().len() + 1;
            store.set("/n", value).await.unwrap();
            eventually(|| handler.seen.lock().len() == expected).await;
        }
        assert_eq!(
            *handler.seen.lock(),
            vec![Some("1".into()), Some("2".into()), Some("3".into())]
        );
    }

    #[tokio::test]
    async fn test_child_listener_rearms_after_outage() {
        use keeper_core::{CoordinationService, CreateMode};

        let (service, store, watcher) = setup().await;
        store.set("/pool/a", "1").await.unwrap();
        let handler = Arc::new(RecordingChildHandler::default());
        watcher
            .add_child_node_listener("/pool", handler.clone())
            .await
            .unwrap();

        let session = store.connection().current_session().unwrap().id;
        service
            .create(session, "/pool/b", Bytes::from("2"), CreateMode::Persistent)
            .await
            .unwrap();
        service.set_available(false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handler.seen.lock().is_empty());
        service.set_available(true);

        eventually(|| handler.seen.lock().len() == 1).await;
        store.set("/pool/c", "3").await.unwrap();
        eventually(|| handler.seen.lock().len() == 2).await;
        assert_eq!(
            *handler.seen.lock(),
            vec![
                (ChildEventKind::Added, "b".to_string(), "2".to_string()),
                (ChildEventKind::Added, "c".to_string(), "3".to_string()),
            ]
        );
    }
}
