//! Persistence contracts consumed by the trust and connectivity core.
//!
//! The relational data model lives elsewhere; these traits name only the
//! reads and writes the core needs. `MemoryStore` implements all of them and
//! backs the daemon when it runs from an inventory file.

pub mod memory;

pub use memory::{Inventory, MemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub type NodeId = i64;
pub type TokenId = u64;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("inventory error: {0}")]
    Inventory(String),
}

/// Persisted health of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
    Disabled,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Unhealthy
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Healthy => write!(f, "healthy"),
            NodeStatus::Unhealthy => write!(f, "unhealthy"),
            NodeStatus::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "default_usage_coefficient")]
    pub usage_coefficient: f64,
}

fn default_usage_coefficient() -> f64 {
    1.0
}

impl Node {
    pub fn is_enabled(&self) -> bool {
        self.status != NodeStatus::Disabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub key: String,
}

/// An inbound on a specific node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InboundRef {
    pub node_id: NodeId,
    pub tag: String,
}

/// A user together with the inbound tags it should have on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUser {
    pub user: User,
    pub inbounds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundInfo {
    pub tag: String,
    pub config: Option<String>,
}

/// A proxy backend reported by a node during synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendInfo {
    pub name: String,
    pub backend_type: Option<String>,
    pub version: Option<String>,
    pub inbounds: Vec<InboundInfo>,
}

/// A node's issued certificate. The store becomes the only holder of the
/// private key once this is handed over.
pub struct NodeCertificateRecord {
    pub node_id: NodeId,
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for NodeCertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCertificateRecord")
            .field("node_id", &self.node_id)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Token to be persisted. Only the hash of the raw token is ever stored.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub node_id: NodeId,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub id: TokenId,
    pub node_id: NodeId,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

impl TokenRecord {
    /// A token is expired from its expiry instant onward.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub node_id: NodeId,
    pub attempted_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub active: usize,
    pub expired: usize,
}

/// Node records, desired user state and certificate storage.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Nodes that should have a live connection.
    async fn load_enabled_nodes(&self) -> Result<Vec<Node>, StorageError>;

    async fn update_node_status(
        &self,
        node_id: NodeId,
        status: NodeStatus,
        reason: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn store_node_certificate(&self, record: NodeCertificateRecord) -> Result<(), StorageError>;

    /// Complete desired user list for a node, used for full repopulation.
    async fn list_node_users(&self, node_id: NodeId) -> Result<Vec<NodeUser>, StorageError>;

    async fn store_backends(
        &self,
        node_id: NodeId,
        backends: Vec<BackendInfo>,
    ) -> Result<(), StorageError>;
}

/// Token and failed-attempt records used by the authenticator.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn store_token(&self, token: NewToken) -> Result<TokenRecord, StorageError>;

    /// Record matching (node, hash), active or not.
    async fn find_token(
        &self,
        node_id: NodeId,
        token_hash: &str,
    ) -> Result<Option<TokenRecord>, StorageError>;

    /// Returns whether the record changed.
    async fn deactivate_token(&self, id: TokenId) -> Result<bool, StorageError>;

    /// Returns how many records changed.
    async fn deactivate_all_tokens(&self, node_id: NodeId) -> Result<usize, StorageError>;

    async fn list_tokens(&self, node_id: NodeId) -> Result<Vec<TokenRecord>, StorageError>;

    /// Bump usage count and last-used time. Last write wins.
    async fn record_token_use(&self, id: TokenId, at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Remove every record expired at `now`, returning how many were removed.
    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;

    async fn token_counts(&self, now: DateTime<Utc>) -> Result<TokenCounts, StorageError>;

    async fn record_failed_attempt(&self, attempt: FailedAttempt) -> Result<(), StorageError>;

    async fn count_failed_attempts(
        &self,
        node_id: NodeId,
        since: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    /// Failed attempts across all nodes at or after `since`.
    async fn failed_attempts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailedAttempt>, StorageError>;

    async fn clear_failed_attempts(&self, node_id: NodeId) -> Result<(), StorageError>;
}
