//! # Data Tree
//!
//! The hierarchical namespace: nodes keyed by absolute path, each with its
//! payload, `Stat` and child names. Every mutation advances the transaction
//! id (zxid) so stats can be compared for freshness.

use bytes::Bytes;
use keeper_core::path::{self, ROOT};
use keeper_core::{CreateMode, KeeperError, KeeperResult, SessionId, Stat};
use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single node in the tree.
#[derive(Debug, Clone)]
pub struct DataNode {
    pub data: Bytes,
    pub stat: Stat,
    pub children: BTreeSet<String>,
}

impl DataNode {
    fn new(data: Bytes, zxid: u64, owner: Option<SessionId>) -> Self {
        let now = now_millis();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            ctime: now,
            mtime: now,
            version: 0,
            cversion: 0,
            ephemeral_owner: owner,
            data_length: data.len(),
            num_children: 0,
        };
        Self {
            data,
            stat,
            children: BTreeSet::new(),
        }
    }

    pub fn stat(&self) -> Stat {
        Stat {
            num_children: self.children.len(),
            ..self.stat
        }
    }
}

/// Outcome of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub path: String,
    pub parent: String,
}

#[derive(Debug)]
pub struct DataTree {
    nodes: HashMap<String, DataNode>,
    ephemerals: HashMap<SessionId, BTreeSet<String>>,
    zxid: u64,
}

impl DataTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT.to_string(), DataNode::new(Bytes::new(), 0, None));
        Self {
            nodes,
            ephemerals: HashMap::new(),
            zxid: 0,
        }
    }

    pub fn zxid(&self) -> u64 {
        self.zxid
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, path: &str) -> Option<&DataNode> {
        self.nodes.get(path)
    }

    pub fn create(
        &mut self,
        requested: &str,
        data: Bytes,
        mode: CreateMode,
        session: SessionId,
    ) -> KeeperResult<Created> {
        path::validate_path(requested)?;
        let parent_path = match path::parent(requested) {
            Some(parent) => parent.to_string(),
            None => return Err(KeeperError::node_exists(requested)),
        };

        let parent = self
            .nodes
            .get(&parent_path)
            .ok_or_else(|| KeeperError::no_node(requested))?;
        if parent.stat.ephemeral_owner.is_some() {
            return Err(KeeperError::NoChildrenForEphemerals { path: parent_path });
        }

        let actual = if mode.is_sequential() {
            path::sequential_name(requested, parent.stat.cversion as u64)
        } else {
            requested.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(KeeperError::node_exists(actual));
        }

        self.zxid += 1;
        let zxid = self.zxid;
        let owner = mode.is_ephemeral().then_some(session);

        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.insert(path::node_name(&actual).to_string());
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
        }
        self.nodes
            .insert(actual.clone(), DataNode::new(data, zxid, owner));
        if let Some(owner) = owner {
            self.ephemerals
                .entry(owner)
                .or_default()
                .insert(actual.clone());
        }

        Ok(Created {
            path: actual,
            parent: parent_path,
        })
    }

    pub fn set_data(&mut self, path: &str, data: Bytes, version: Option<i32>) -> KeeperResult<Stat> {
        let next_zxid = self.zxid + 1;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| KeeperError::no_node(path))?;
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(KeeperError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }

        node.stat.data_length = data.len();
        node.data = data;
        node.stat.version += 1;
        node.stat.mzxid = next_zxid;
        node.stat.mtime = now_millis();
        let stat = node.stat();
        self.zxid = next_zxid;
        Ok(stat)
    }

    /// Removes a childless node; returns its parent path.
    pub fn delete(&mut self, path: &str, version: Option<i32>) -> KeeperResult<String> {
        if path == ROOT {
            return Err(KeeperError::invalid_path(path, "the root cannot be deleted"));
        }
        let node = self.nodes.get(path).ok_or_else(|| KeeperError::no_node(path))?;
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(KeeperError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }
        if !node.children.is_empty() {
            return Err(KeeperError::NotEmpty {
                path: path.to_string(),
            });
        }

        self.zxid += 1;
        let zxid = self.zxid;
        let removed = self.nodes.remove(path);
        if let Some(owner) = removed.and_then(|n| n.stat.ephemeral_owner) {
            if let Some(owned) = self.ephemerals.get_mut(&owner) {
                owned.remove(path);
                if owned.is_empty() {
                    self.ephemerals.remove(&owner);
                }
            }
        }

        let parent_path = path::parent(path).unwrap_or(ROOT).to_string();
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.remove(path::node_name(path));
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
        }
        Ok(parent_path)
    }

    /// Ephemeral paths owned by `session`.
    pub fn ephemerals_of(&self, session: SessionId) -> Vec<String> {
        self.ephemerals
            .get(&session)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
