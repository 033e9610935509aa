//! # Event Dispatch
//!
//! Handler contracts for node, child-set, session and leadership callbacks,
//! plus the serial queue that delivers events for one watched path.
//!
//! Every handler trait ships a default implementation that logs the event,
//! so an application only overrides what it cares about.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use keeper_core::Stat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::leader::LeadershipContext;

/// Latest known state of a watched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub path: String,
    /// Payload, `None` once the node has been deleted
    pub data: Option<Bytes>,
    pub stat: Option<Stat>,
}

impl NodeSnapshot {
    pub fn present(path: impl Into<String>, data: Bytes, stat: Stat) -> Self {
        Self {
            path: path.into(),
            data: Some(data),
            stat: Some(stat),
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: None,
            stat: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }

    /// Payload decoded as UTF-8, if present and valid.
    pub fn data_utf8(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| std::str::from_utf8(data).ok())
    }

    /// True when `other` describes a different revision of the node.
    pub(crate) fn differs_from(&self, other: &NodeSnapshot) -> bool {
        match (&self.stat, &other.stat) {
            (Some(a), Some(b)) => !a.same_revision(b),
            (None, None) => false,
            _ => true,
        }
    }
}

/// Kind of change reported for a child of a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildEventKind {
    Added,
    Updated,
    Removed,
}

impl fmt::Display for ChildEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildEventKind::Added => write!(f, "ADDED"),
            ChildEventKind::Updated => write!(f, "UPDATED"),
            ChildEventKind::Removed => write!(f, "REMOVED"),
        }
    }
}

/// A change to one child of a watched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    /// Child name, relative to the watched node
    pub name: String,
    /// Current payload, or the last known one for `Removed`
    pub data: Bytes,
}

/// Receives data changes of a single node.
#[async_trait]
pub trait NodeChangeHandler: Send + Sync + 'static {
    async fn on_node_changed(&self, snapshot: &NodeSnapshot) {
        info!(
            path = %snapshot.path,
            data = ?snapshot.data_utf8(),
            deleted = snapshot.is_deleted(),
            "node changed"
        );
    }
}

/// Receives changes to the immediate children of a node.
#[async_trait]
pub trait ChildChangeHandler: Send + Sync + 'static {
    async fn on_child_event(&self, kind: ChildEventKind, child: &str, data: &Bytes) {
        info!(%kind, child, data = ?std::str::from_utf8(data).ok(), "child changed");
    }
}

/// Notified after the client recovers its connection.
#[async_trait]
pub trait SessionStateHandler: Send + Sync + 'static {
    async fn reconnected(&self) {
        info!("session reconnected");
    }
}

#[async_trait]
impl<F> SessionStateHandler for F
where
    F: Fn() + Send + Sync + 'static,
{
    async fn reconnected(&self) {
        (self)()
    }
}

/// Work performed while holding leadership.
///
/// `execute` is called once per term. Leadership is relinquished when it
/// returns, so a long-lived leader keeps running until
/// [`LeadershipContext::is_revoked`] turns true.
#[async_trait]
pub trait LeadershipTask<A = ()>: Send + Sync + 'static
where
    A: Send + Sync + 'static,
{
    async fn execute(&self, context: LeadershipContext, args: Arc<A>) {
        let _ = args;
        info!(
            election = %context.election_path(),
            term = context.term(),
            "took leadership"
        );
    }
}

/// Delivers events one at a time, in submission order, on its own task.
///
/// The next event is not handed over until the previous delivery finished.
/// A panicking delivery is logged and the queue carries on.
pub struct SerialDispatcher<E> {
    name: String,
    tx: mpsc::UnboundedSender<E>,
    task: JoinHandle<()>,
}

impl<E: Send + 'static> SerialDispatcher<E> {
    pub fn spawn<F, Fut>(name: impl Into<String>, mut deliver: F) -> Self
    where
        F: FnMut(E) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<E>();
        let queue = name.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if AssertUnwindSafe(deliver(event))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!(dispatcher = %queue, "event handler panicked");
                }
            }
            debug!(dispatcher = %queue, "dispatcher drained");
        });

        Self { name, tx, task }
    }

    /// Queues `event`; false once the dispatcher has shut down.
    pub fn dispatch(&self, event: E) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting events. Already queued events are still delivered;
    /// the returned handle completes after the last one.
    pub fn close(self) -> JoinHandle<()> {
        let Self { tx, task, .. } = self;
        drop(tx);
        task
    }
}

impl<E> fmt::Debug for SerialDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialDispatcher")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_serial_dispatcher_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatcher = SerialDispatcher::spawn("order", move |n: u32| {
            let sink = sink.clone();
            async move {
                // later events must not overtake a slow earlier one
                if n == 0 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                sink.lock().push(n);
            }
        });

        for n in 0..5 {
            assert!(dispatcher.dispatch(n));
        }
        dispatcher.close().await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_serial_dispatcher_survives_panic() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let dispatcher = SerialDispatcher::spawn("panics", move |n: u32| {
            let counter = counter.clone();
            async move {
                if n == 1 {
                    panic!("handler failure");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for n in 0..3 {
            dispatcher.dispatch(n);
        }
        dispatcher.close().await.unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_snapshot_revision_comparison() {
        let stat = Stat {
            czxid: 3,
            mzxid: 3,
            ..Stat::default()
        };
        let a = NodeSnapshot::present("/a", Bytes::from("1"), stat);
        let same = NodeSnapshot::present("/a", Bytes::from("1"), stat);
        let newer = NodeSnapshot::present(
            "/a",
            Bytes::from("2"),
            Stat {
                mzxid: 4,
                version: 1,
                ..stat
            },
        );
        assert!(!a.differs_from(&same));
        assert!(a.differs_from(&newer));
        assert!(a.differs_from(&NodeSnapshot::deleted("/a")));
        assert!(!NodeSnapshot::deleted("/a").differs_from(&NodeSnapshot::deleted("/a")));
        assert_eq!(a.data_utf8(), Some("1"));
    }

    #[tokio::test]
    async fn test_closure_state_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: Arc<dyn SessionStateHandler> = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handler.reconnected().await;
        handler.reconnected().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
