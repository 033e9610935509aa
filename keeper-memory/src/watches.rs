//! One-shot watch tables.
//!
//! Data watches are left by `get_data`/`exists`, child watches by
//! `get_children`. Triggering a table entry fires every registered watcher
//! once and forgets it.

use keeper_core::{EventKind, SessionId, WatchedEvent, Watcher};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

type WatchTable = HashMap<String, HashMap<Uuid, (SessionId, Watcher)>>;

#[derive(Debug, Default)]
pub struct WatchManager {
    data: WatchTable,
    child: WatchTable,
    fired: u64,
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data_watch(&mut self, path: &str, session: SessionId, watcher: Watcher) {
        Self::add(&mut self.data, path, session, watcher);
    }

    pub fn add_child_watch(&mut self, path: &str, session: SessionId, watcher: Watcher) {
        Self::add(&mut self.child, path, session, watcher);
    }

    fn add(table: &mut WatchTable, path: &str, session: SessionId, watcher: Watcher) {
        table
            .entry(path.to_string())
            .or_default()
            .insert(watcher.id(), (session, watcher));
    }

    pub fn trigger_data(&mut self, path: &str, kind: EventKind) -> usize {
        let fired = Self::trigger(&mut self.data, path, kind);
        self.fired += fired as u64;
        fired
    }

    pub fn trigger_child(&mut self, path: &str, kind: EventKind) -> usize {
        let fired = Self::trigger(&mut self.child, path, kind);
        self.fired += fired as u64;
        fired
    }

    fn trigger(table: &mut WatchTable, path: &str, kind: EventKind) -> usize {
        let Some(watchers) = table.remove(path) else {
            return 0;
        };
        let mut delivered = 0;
        for (_, (_, watcher)) in watchers {
            let event = WatchedEvent {
                kind,
                path: path.to_string(),
            };
            if watcher.fire(event) {
                delivered += 1;
            }
        }
        debug!(path, %kind, delivered, "triggered watches");
        delivered
    }

    /// Drops every watch left by `session`.
    pub fn remove_session(&mut self, session: SessionId) {
        for table in [&mut self.data, &mut self.child] {
            table.retain(|_, watchers| {
                watchers.retain(|_, (owner, _)| *owner != session);
                !watchers.is_empty()
            });
        }
    }

    /// Registered watches whose receiver is still alive.
    pub fn watch_count(&self) -> usize {
        self.data
            .values()
            .chain(self.child.values())
            .flat_map(|watchers| watchers.values())
            .filter(|(_, watcher)| !watcher.is_closed())
            .count()
    }

    pub fn fired_count(&self) -> u64 {
        self.fired
    }
}
