//! Node registry: node id to live connection.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::connection::NodeConnection;
use crate::store::NodeId;

/// Registry of live node connections.
///
/// Connections are inserted fully constructed, so a lookup never sees a
/// half-built one.
#[derive(Default)]
pub struct NodeRegistry {
    connections: DashMap<NodeId, Arc<NodeConnection>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the one it replaced.
    pub fn insert(&self, connection: Arc<NodeConnection>) -> Option<Arc<NodeConnection>> {
        let node_id = connection.node_id();
        let previous = self.connections.insert(node_id, connection);
        info!(node_id, replaced = previous.is_some(), "Node registered");
        previous
    }

    pub fn remove(&self, node_id: NodeId) -> Option<Arc<NodeConnection>> {
        let removed = self.connections.remove(&node_id).map(|(_, c)| c);
        if removed.is_some() {
            info!(node_id, "Node unregistered");
        }
        removed
    }

    pub fn get(&self, node_id: NodeId) -> Option<Arc<NodeConnection>> {
        self.connections.get(&node_id).map(|c| c.value().clone())
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.connections.contains_key(&node_id)
    }

    /// Registered node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.connections.iter().map(|c| *c.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<Arc<NodeConnection>> {
        self.node_ids()
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
