//! Node transport abstraction.
//!
//! A transport knows how to reach one node and speak the node-facing RPC
//! surface. Which variant a node gets is decided by the
//! [`TransportFactory`] when the node is added.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::NodeError;
use crate::mtls::ClientIdentity;
use crate::store::{BackendInfo, Node, NodeUser};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out")]
    Timeout,

    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("stream closed by peer")]
    StreamClosed,
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        TransportError::Rpc(format!("{:?}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for TransportError {
    fn from(err: tonic::transport::Error) -> Self {
        TransportError::Connect(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    #[default]
    Plain,
    Json,
    Yaml,
}

/// Opaque backend configuration blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub configuration: String,
    pub format: ConfigFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserUsage {
    pub uid: u32,
    pub usage: u64,
}

/// Intents forwarded over the update stream.
pub type IntentStream = BoxStream<'static, NodeUser>;

/// Lines from a backend's log.
pub type LogStream = BoxStream<'static, Result<String, TransportError>>;

#[async_trait]
pub trait NodeTransport: Send + Sync + 'static {
    /// Make sure a connection to the node is established.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn fetch_backends(&self) -> Result<Vec<BackendInfo>, TransportError>;

    /// Replace the node's entire user list.
    async fn repopulate_users(&self, users: Vec<NodeUser>) -> Result<(), TransportError>;

    /// Forward intents until the stream ends or the call fails.
    async fn sync_users(&self, updates: IntentStream) -> Result<(), TransportError>;

    async fn fetch_users_stats(&self) -> Result<Vec<UserUsage>, TransportError>;

    async fn fetch_backend_config(&self, backend: &str) -> Result<BackendConfig, TransportError>;

    async fn get_backend_stats(&self, backend: &str) -> Result<BackendStats, TransportError>;

    async fn restart_backend(
        &self,
        backend: Option<&str>,
        config: Option<BackendConfig>,
    ) -> Result<(), TransportError>;

    async fn stream_logs(
        &self,
        backend: &str,
        include_buffer: bool,
    ) -> Result<LogStream, TransportError>;

    async fn close(&self);
}

/// Picks and builds the transport for a node.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        node: &Node,
        identity: Option<&ClientIdentity>,
    ) -> Result<Arc<dyn NodeTransport>, NodeError>;
}
