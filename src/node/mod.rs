//! Node connectivity: transports, supervised connections, the registry of
//! live connections and the manager that ties them together.

pub mod connection;
pub mod grpc;
pub mod manager;
pub mod registry;
pub mod transport;

pub use connection::{ConnectionSettings, ConnectionState, NodeConnection, UpdateIntent};
pub use grpc::GrpcTransportFactory;
pub use manager::{plan_node_inbounds, ConnectionManager};
pub use registry::NodeRegistry;
pub use transport::{NodeTransport, TransportError, TransportFactory};

use thiserror::Error;

use crate::resources::ResourceExhausted;
use crate::store::{NodeId, StorageError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("sync failed: {0}")]
    Sync(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhausted),

    #[error("node {0} is not connected")]
    NotConnected(NodeId),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
