//! Connection manager: adds and removes node connections and fans user
//! updates out to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::connection::{ConnectionSettings, NodeConnection, UpdateIntent};
use super::registry::NodeRegistry;
use super::transport::TransportFactory;
use super::NodeError;
use crate::events::SecurityEventSink;
use crate::mtls::ClientIdentity;
use crate::resources::ResourceGuard;
use crate::store::{InboundRef, Node, NodeId, NodeStore, User};

/// Per-node inbound tags for one user.
///
/// Every node in `previous` appears, with an empty list if the user no
/// longer has inbounds there. Tags are de-duplicated in first-seen order.
pub fn plan_node_inbounds(
    desired: &[InboundRef],
    previous: &[InboundRef],
) -> BTreeMap<NodeId, Vec<String>> {
    let mut plan: BTreeMap<NodeId, Vec<String>> = BTreeMap::new();
    for inbound in previous {
        plan.entry(inbound.node_id).or_default();
    }
    for inbound in desired {
        let tags = plan.entry(inbound.node_id).or_default();
        if !tags.contains(&inbound.tag) {
            tags.push(inbound.tag.clone());
        }
    }
    plan
}

pub struct ConnectionManager {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn NodeStore>,
    events: Arc<dyn SecurityEventSink>,
    resources: Arc<dyn ResourceGuard>,
    transports: Arc<dyn TransportFactory>,
    settings: ConnectionSettings,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn NodeStore>,
        events: Arc<dyn SecurityEventSink>,
        resources: Arc<dyn ResourceGuard>,
        transports: Arc<dyn TransportFactory>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            resources,
            transports,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Replace any connection for `node.id` with a fresh one.
    pub async fn add_node(
        &self,
        node: Node,
        identity: Option<&ClientIdentity>,
    ) -> Result<Arc<NodeConnection>, NodeError> {
        self.remove_node(node.id).await;

        let transport = self.transports.create(&node, identity)?;
        info!(node_id = node.id, address = %node.address, port = node.port, "Adding node");
        let connection = NodeConnection::start(
            node,
            transport,
            self.store.clone(),
            self.events.clone(),
            self.settings.clone(),
        );

        // A concurrent add for the same id may have slipped in.
        if let Some(displaced) = self.registry.insert(connection.clone()) {
            displaced.stop().await;
        }
        Ok(connection)
    }

    /// Stop and forget a node. Unknown ids are ignored.
    pub async fn remove_node(&self, node_id: NodeId) {
        if let Some(connection) = self.registry.remove(node_id) {
            connection.stop().await;
        }
    }

    /// Add every enabled node. Nodes that fail to add are logged and
    /// skipped. Returns how many were added.
    pub async fn startup(&self, identity: Option<&ClientIdentity>) -> Result<usize, NodeError> {
        let nodes = self.store.load_enabled_nodes().await?;
        let total = nodes.len();
        let mut added = 0;
        for node in nodes {
            let node_id = node.id;
            match self.add_node(node, identity).await {
                Ok(_) => added += 1,
                Err(e) => warn!(node_id, error = %e, "Failed to add node"),
            }
        }
        info!(added, total, "Node connections started");
        Ok(added)
    }

    pub async fn stop_all(&self) {
        let connections = self.registry.drain();
        let count = connections.len();
        join_all(connections.iter().map(|c| c.stop())).await;
        info!(count, "All node connections stopped");
    }

    pub fn connection(&self, node_id: NodeId) -> Result<Arc<NodeConnection>, NodeError> {
        self.registry
            .get(node_id)
            .ok_or(NodeError::NotConnected(node_id))
    }

    /// Queue `user`'s inbound set on every affected node. Nodes that held
    /// the user in `previous` but not in `desired` get an empty list.
    /// Nodes without a live connection are skipped.
    pub async fn update_user(
        &self,
        user: &User,
        desired: &[InboundRef],
        previous: &[InboundRef],
    ) -> Result<(), NodeError> {
        self.resources.ensure_capacity()?;

        let plan = plan_node_inbounds(desired, previous);
        let mut targets = Vec::with_capacity(plan.len());
        for (node_id, inbounds) in plan {
            match self.registry.get(node_id) {
                Some(connection) => targets.push((
                    connection,
                    UpdateIntent {
                        user: user.clone(),
                        inbounds,
                    },
                )),
                None => debug!(node_id, user_id = user.id, "Node not connected, skipping update"),
            }
        }

        join_all(
            targets
                .into_iter()
                .map(|(connection, intent)| async move { connection.update_user(intent).await }),
        )
        .await;
        Ok(())
    }

    /// Remove `user` from every node it had inbounds on.
    pub async fn remove_user(&self, user: &User, previous: &[InboundRef]) -> Result<(), NodeError> {
        self.update_user(user, &[], previous).await
    }
}
