//! gRPC transport speaking the node-facing service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, warn};

use super::transport::{
    BackendConfig, BackendStats, ConfigFormat, IntentStream, LogStream, NodeTransport,
    TransportError, TransportFactory, UserUsage,
};
use super::NodeError;
use crate::mtls::ClientIdentity;
use crate::store::{BackendInfo, InboundInfo, Node, NodeId, NodeUser};

pub mod proto {
    tonic::include_proto!("wildosnode");
}

use proto::wildos_service_client::WildosServiceClient;

/// One node reached over gRPC. The channel is kept between ticks and
/// dropped whenever a call on it fails, so the next handshake dials again.
pub struct GrpcTransport {
    node_id: NodeId,
    endpoint: Endpoint,
    channel: Mutex<Option<Channel>>,
}

impl GrpcTransport {
    pub fn new(
        node: &Node,
        tls: Option<ClientTlsConfig>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let scheme = if tls.is_some() { "https" } else { "http" };
        let uri = format!("{}://{}:{}", scheme, node.address, node.port);

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| TransportError::Connect(format!("invalid endpoint: {}", e)))?
            .connect_timeout(connect_timeout)
            .keep_alive_timeout(Duration::from_secs(20))
            .keep_alive_while_idle(true)
            .http2_keep_alive_interval(Duration::from_secs(30));
        if let Some(tls) = tls {
            endpoint = endpoint.tls_config(tls)?;
        }

        Ok(Self {
            node_id: node.id,
            endpoint,
            channel: Mutex::new(None),
        })
    }

    fn client(&self) -> Result<WildosServiceClient<Channel>, TransportError> {
        self.channel
            .lock()
            .clone()
            .map(WildosServiceClient::new)
            .ok_or_else(|| TransportError::Connect("not connected".to_string()))
    }

    fn observe<T>(&self, result: Result<T, tonic::Status>) -> Result<T, TransportError> {
        result.map_err(|status| {
            debug!(node_id = self.node_id, code = ?status.code(), "Dropping channel after failed call");
            *self.channel.lock() = None;
            TransportError::from(status)
        })
    }
}

fn user_data(user: NodeUser) -> proto::UserData {
    proto::UserData {
        user: Some(proto::User {
            id: user.user.id,
            username: user.user.username,
            key: user.user.key,
        }),
        inbounds: user
            .inbounds
            .into_iter()
            .map(|tag| proto::Inbound { tag, config: None })
            .collect(),
    }
}

fn backend_info(backend: proto::Backend) -> BackendInfo {
    BackendInfo {
        name: backend.name,
        backend_type: backend.r#type,
        version: backend.version,
        inbounds: backend
            .inbounds
            .into_iter()
            .map(|i| InboundInfo {
                tag: i.tag,
                config: i.config,
            })
            .collect(),
    }
}

/// Named wrapper for the boxed request stream. Without it rustc cannot prove
/// the `sync_users` future `Send` ("higher-ranked lifetime error" on the
/// erased `'static` of the trait object, rust-lang/rust#102211).
struct OutboundUsers(BoxStream<'static, proto::UserData>);

impl futures::Stream for OutboundUsers {
    type Item = proto::UserData;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

fn backend_request(name: &str) -> proto::Backend {
    proto::Backend {
        name: name.to_string(),
        ..Default::default()
    }
}

impl From<proto::ConfigFormat> for ConfigFormat {
    fn from(format: proto::ConfigFormat) -> Self {
        match format {
            proto::ConfigFormat::Plain => ConfigFormat::Plain,
            proto::ConfigFormat::Json => ConfigFormat::Json,
            proto::ConfigFormat::Yaml => ConfigFormat::Yaml,
        }
    }
}

impl From<ConfigFormat> for proto::ConfigFormat {
    fn from(format: ConfigFormat) -> Self {
        match format {
            ConfigFormat::Plain => proto::ConfigFormat::Plain,
            ConfigFormat::Json => proto::ConfigFormat::Json,
            ConfigFormat::Yaml => proto::ConfigFormat::Yaml,
        }
    }
}

#[async_trait]
impl NodeTransport for GrpcTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.channel.lock().is_some() {
            return Ok(());
        }
        let channel = self.endpoint.connect().await?;
        debug!(node_id = self.node_id, "Channel established");
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    async fn fetch_backends(&self) -> Result<Vec<BackendInfo>, TransportError> {
        let response = self.client()?.fetch_backends(proto::Empty {}).await;
        Ok(self
            .observe(response)?
            .into_inner()
            .backends
            .into_iter()
            .map(backend_info)
            .collect())
    }

    async fn repopulate_users(&self, users: Vec<NodeUser>) -> Result<(), TransportError> {
        let request = proto::UsersData {
            users_data: users.into_iter().map(user_data).collect(),
        };
        let response = self.client()?.repopulate_users(request).await;
        self.observe(response)?;
        Ok(())
    }

    async fn sync_users(&self, updates: IntentStream) -> Result<(), TransportError> {
        // Boxed so the request stream has one concrete Send type.
        let outbound: BoxStream<'static, proto::UserData> = updates.map(user_data).boxed();
        let mut client = self.client()?;
        let response = client
            .sync_users(tonic::Request::new(OutboundUsers(outbound)))
            .await;
        self.observe(response)?;
        Ok(())
    }

    async fn fetch_users_stats(&self) -> Result<Vec<UserUsage>, TransportError> {
        let response = self.client()?.fetch_users_stats(proto::Empty {}).await;
        Ok(self
            .observe(response)?
            .into_inner()
            .users_stats
            .into_iter()
            .map(|s| UserUsage {
                uid: s.uid,
                usage: s.usage,
            })
            .collect())
    }

    async fn fetch_backend_config(&self, backend: &str) -> Result<BackendConfig, TransportError> {
        let response = self
            .client()?
            .fetch_backend_config(backend_request(backend))
            .await;
        let config = self.observe(response)?.into_inner();
        let format = proto::ConfigFormat::try_from(config.config_format).unwrap_or_else(|_| {
            warn!(node_id = self.node_id, value = config.config_format, "Unknown config format, assuming plain");
            proto::ConfigFormat::Plain
        });
        Ok(BackendConfig {
            configuration: config.configuration,
            format: format.into(),
        })
    }

    async fn get_backend_stats(&self, backend: &str) -> Result<BackendStats, TransportError> {
        let response = self
            .client()?
            .get_backend_stats(backend_request(backend))
            .await;
        Ok(BackendStats {
            running: self.observe(response)?.into_inner().running,
        })
    }

    async fn restart_backend(
        &self,
        backend: Option<&str>,
        config: Option<BackendConfig>,
    ) -> Result<(), TransportError> {
        let request = proto::RestartBackendRequest {
            backend_name: backend.map(str::to_string),
            config: config.map(|c| proto::BackendConfig {
                configuration: c.configuration,
                config_format: proto::ConfigFormat::from(c.format) as i32,
            }),
        };
        let response = self.client()?.restart_backend(request).await;
        self.observe(response)?;
        Ok(())
    }

    async fn stream_logs(
        &self,
        backend: &str,
        include_buffer: bool,
    ) -> Result<LogStream, TransportError> {
        let request = proto::BackendLogsRequest {
            backend_name: backend.to_string(),
            include_buffer,
        };
        let response = self.client()?.stream_backend_logs(request).await;
        let lines = self.observe(response)?.into_inner();
        Ok(lines
            .map(|item| item.map(|l| l.line).map_err(TransportError::from))
            .boxed())
    }

    async fn close(&self) {
        *self.channel.lock() = None;
    }
}

/// Builds gRPC transports: mutual TLS with the panel client identity, or
/// plaintext only when explicitly configured.
#[derive(Debug, Clone)]
pub struct GrpcTransportFactory {
    insecure: bool,
    connect_timeout: Duration,
}

impl GrpcTransportFactory {
    pub fn new(insecure: bool, connect_timeout: Duration) -> Self {
        Self {
            insecure,
            connect_timeout,
        }
    }
}

impl TransportFactory for GrpcTransportFactory {
    fn create(
        &self,
        node: &Node,
        identity: Option<&ClientIdentity>,
    ) -> Result<Arc<dyn NodeTransport>, NodeError> {
        let tls = if self.insecure {
            warn!(node_id = node.id, "Using plaintext transport to node");
            None
        } else {
            let identity = identity.ok_or_else(|| {
                NodeError::Configuration(format!(
                    "no client certificate available for node {}",
                    node.id
                ))
            })?;
            Some(identity.tls_config_for(node.id))
        };

        let transport = GrpcTransport::new(node, tls, self.connect_timeout)?;
        Ok(Arc::new(transport))
    }
}
