//! In-memory storage backend.
//!
//! Backs the daemon when it runs from an inventory file and every test in
//! the crate. Data is lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    BackendInfo, FailedAttempt, InboundRef, NewToken, Node, NodeCertificateRecord, NodeId,
    NodeStatus, NodeStore, NodeUser, StorageError, TokenCounts, TokenId, TokenRecord, TokenStore,
    User,
};

/// Seed data for the in-memory store, loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub users: Vec<InventoryUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryUser {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub inbounds: Vec<InboundRef>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Inventory(format!("reading {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&content)
            .map_err(|e| StorageError::Inventory(format!("parsing {}: {}", path.display(), e)))
    }
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<NodeId, Node>,
    users: BTreeMap<u32, InventoryUser>,
    certificates: HashMap<NodeId, NodeCertificateRecord>,
    backends: HashMap<NodeId, Vec<BackendInfo>>,
    tokens: BTreeMap<TokenId, TokenRecord>,
    next_token_id: TokenId,
    attempts: Vec<FailedAttempt>,
}

/// In-memory implementation of every store contract.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_inventory(inventory: Inventory) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write();
            for node in inventory.nodes {
                state.nodes.insert(node.id, node);
            }
            for user in inventory.users {
                state.users.insert(user.user.id, user);
            }
            info!(
                nodes = state.nodes.len(),
                users = state.users.len(),
                "Loaded inventory into memory store"
            );
        }
        store
    }

    pub fn upsert_node(&self, node: Node) {
        self.state.write().nodes.insert(node.id, node);
    }

    pub fn upsert_user(&self, user: User, inbounds: Vec<InboundRef>) {
        self.state
            .write()
            .users
            .insert(user.id, InventoryUser { user, inbounds });
    }

    pub fn node(&self, node_id: NodeId) -> Option<Node> {
        self.state.read().nodes.get(&node_id).cloned()
    }

    pub fn backends(&self, node_id: NodeId) -> Vec<BackendInfo> {
        self.state
            .read()
            .backends
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_certificate(&self, node_id: NodeId) -> bool {
        self.state.read().certificates.contains_key(&node_id)
    }

    /// Inbounds every user holds, keyed by user id.
    pub fn user_inbounds(&self, user_id: u32) -> Vec<InboundRef> {
        self.state
            .read()
            .users
            .get(&user_id)
            .map(|u| u.inbounds.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn load_enabled_nodes(&self) -> Result<Vec<Node>, StorageError> {
        Ok(self
            .state
            .read()
            .nodes
            .values()
            .filter(|n| n.is_enabled())
            .cloned()
            .collect())
    }

    async fn update_node_status(
        &self,
        node_id: NodeId,
        status: NodeStatus,
        reason: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| StorageError::NotFound(format!("node {}", node_id)))?;
        node.status = status;
        node.message = reason.map(str::to_string);
        debug!(node_id, %status, "Node status stored");
        Ok(())
    }

    async fn store_node_certificate(&self, record: NodeCertificateRecord) -> Result<(), StorageError> {
        info!(node_id = record.node_id, expires_at = %record.expires_at, "Storing node certificate");
        self.state.write().certificates.insert(record.node_id, record);
        Ok(())
    }

    async fn list_node_users(&self, node_id: NodeId) -> Result<Vec<NodeUser>, StorageError> {
        let state = self.state.read();
        Ok(state
            .users
            .values()
            .filter_map(|entry| {
                let tags: Vec<String> = entry
                    .inbounds
                    .iter()
                    .filter(|i| i.node_id == node_id)
                    .map(|i| i.tag.clone())
                    .collect();
                (!tags.is_empty()).then(|| NodeUser {
                    user: entry.user.clone(),
                    inbounds: tags,
                })
            })
            .collect())
    }

    async fn store_backends(
        &self,
        node_id: NodeId,
        backends: Vec<BackendInfo>,
    ) -> Result<(), StorageError> {
        self.state.write().backends.insert(node_id, backends);
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn store_token(&self, token: NewToken) -> Result<TokenRecord, StorageError> {
        let mut state = self.state.write();
        state.next_token_id += 1;
        let record = TokenRecord {
            id: state.next_token_id,
            node_id: token.node_id,
            token_hash: token.token_hash,
            created_at: token.created_at,
            expires_at: token.expires_at,
            is_active: true,
            last_used_at: None,
            usage_count: 0,
        };
        state.tokens.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_token(
        &self,
        node_id: NodeId,
        token_hash: &str,
    ) -> Result<Option<TokenRecord>, StorageError> {
        let state = self.state.read();
        let mut matches = state
            .tokens
            .values()
            .filter(|t| t.node_id == node_id && t.token_hash == token_hash);
        // An active record wins over an older deactivated one with the same hash.
        let first = matches.next().cloned();
        Ok(match first {
            Some(t) if !t.is_active => matches.find(|t| t.is_active).cloned().or(Some(t)),
            other => other,
        })
    }

    async fn deactivate_token(&self, id: TokenId) -> Result<bool, StorageError> {
        let mut state = self.state.write();
        Ok(match state.tokens.get_mut(&id) {
            Some(t) if t.is_active => {
                t.is_active = false;
                true
            }
            _ => false,
        })
    }

    async fn deactivate_all_tokens(&self, node_id: NodeId) -> Result<usize, StorageError> {
        let mut state = self.state.write();
        let mut changed = 0;
        for token in state
            .tokens
            .values_mut()
            .filter(|t| t.node_id == node_id && t.is_active)
        {
            token.is_active = false;
            changed += 1;
        }
        Ok(changed)
    }

    async fn list_tokens(&self, node_id: NodeId) -> Result<Vec<TokenRecord>, StorageError> {
        Ok(self
            .state
            .read()
            .tokens
            .values()
            .filter(|t| t.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn record_token_use(&self, id: TokenId, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let token = state
            .tokens
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("token {}", id)))?;
        token.usage_count += 1;
        token.last_used_at = Some(at);
        Ok(())
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut state = self.state.write();
        let before = state.tokens.len();
        state.tokens.retain(|_, t| !t.is_expired_at(now));
        Ok(before - state.tokens.len())
    }

    async fn token_counts(&self, now: DateTime<Utc>) -> Result<TokenCounts, StorageError> {
        let state = self.state.read();
        let mut counts = TokenCounts::default();
        for token in state.tokens.values() {
            if token.is_expired_at(now) {
                counts.expired += 1;
            } else if token.is_active {
                counts.active += 1;
            }
        }
        Ok(counts)
    }

    async fn record_failed_attempt(&self, attempt: FailedAttempt) -> Result<(), StorageError> {
        self.state.write().attempts.push(attempt);
        Ok(())
    }

    async fn count_failed_attempts(
        &self,
        node_id: NodeId,
        since: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        Ok(self
            .state
            .read()
            .attempts
            .iter()
            .filter(|a| a.node_id == node_id && a.attempted_at >= since)
            .count())
    }

    async fn failed_attempts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailedAttempt>, StorageError> {
        Ok(self
            .state
            .read()
            .attempts
            .iter()
            .filter(|a| a.attempted_at >= since)
            .cloned()
            .collect())
    }

    async fn clear_failed_attempts(&self, node_id: NodeId) -> Result<(), StorageError> {
        self.state.write().attempts.retain(|a| a.node_id != node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node(id: NodeId, status: NodeStatus) -> Node {
        Node {
            id,
            name: format!("node-{}", id),
            address: "10.0.0.1".to_string(),
            port: 62050,
            status,
            message: None,
            usage_coefficient: 1.0,
        }
    }

    #[tokio::test]
    async fn load_enabled_nodes_skips_disabled() {
        let store = MemoryStore::new();
        store.upsert_node(node(1, NodeStatus::Healthy));
        store.upsert_node(node(2, NodeStatus::Disabled));
        store.upsert_node(node(3, NodeStatus::Unhealthy));

        let ids: Vec<NodeId> = store
            .load_enabled_nodes()
            .await
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn list_node_users_filters_inbounds_per_node() {
        let store = MemoryStore::new();
        let alice = User {
            id: 1,
            username: "alice".to_string(),
            key: "k1".to_string(),
        };
        store.upsert_user(
            alice.clone(),
            vec![
                InboundRef {
                    node_id: 1,
                    tag: "vless".to_string(),
                },
                InboundRef {
                    node_id: 2,
                    tag: "trojan".to_string(),
                },
            ],
        );

        let on_one = store.list_node_users(1).await.unwrap();
        assert_eq!(on_one.len(), 1);
        assert_eq!(on_one[0].user, alice);
        assert_eq!(on_one[0].inbounds, vec!["vless".to_string()]);
        assert!(store.list_node_users(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_status_for_unknown_node_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_node_status(9, NodeStatus::Healthy, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn purge_removes_only_expired_tokens() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .store_token(NewToken {
                node_id: 1,
                token_hash: "old".to_string(),
                created_at: now - Duration::days(8),
                expires_at: now - Duration::days(1),
            })
            .await
            .unwrap();
        store
            .store_token(NewToken {
                node_id: 1,
                token_hash: "fresh".to_string(),
                created_at: now,
                expires_at: now + Duration::days(7),
            })
            .await
            .unwrap();

        assert_eq!(store.purge_expired_tokens(now).await.unwrap(), 1);
        let remaining = store.list_tokens(1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].token_hash, "fresh");
    }

    #[test]
    fn inventory_parses_from_yaml() {
        let yaml = r#"
nodes:
  - id: 7
    address: node7.example.com
    port: 62050
users:
  - id: 1
    username: alice
    key: secret
    inbounds:
      - node_id: 7
        tag: vless-reality
"#;
        let inventory: Inventory = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(inventory.nodes[0].status, NodeStatus::Unhealthy);
        assert_eq!(inventory.nodes[0].usage_coefficient, 1.0);
        assert_eq!(inventory.users[0].user.username, "alice");
        assert_eq!(inventory.users[0].inbounds[0].tag, "vless-reality");
    }
}
