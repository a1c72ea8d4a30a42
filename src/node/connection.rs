//! Supervised connection to one node.
//!
//! ```text
//! connecting --(handshake ok)--> syncing --(sync ok)--> healthy
//!     |                             |                      |
//!     +--(timeout/error)--> unhealthy <--(sync/stream error)+
//! unhealthy --(next tick)--> connecting
//! any --(stop)--> stopped
//! ```
//!
//! `synced` is true only between a successful sync pass and the next
//! transport failure. The update stream only runs while it is set.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{
    BackendConfig, BackendStats, LogStream, NodeTransport, TransportError, UserUsage,
};
use super::NodeError;
use crate::events::{SecurityEvent, SecurityEventKind, SecurityEventSink, Severity};
use crate::store::{Node, NodeId, NodeStatus, NodeStore, NodeUser};

/// A user's desired inbound tags on one node. An empty list removes the
/// user from that node.
pub type UpdateIntent = NodeUser;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub tick: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Syncing,
    Healthy,
    Unhealthy(String),
    Stopped,
}

impl ConnectionState {
    /// The status persisted for this state, if any.
    fn persisted(&self) -> Option<(NodeStatus, Option<String>)> {
        match self {
            ConnectionState::Healthy => Some((NodeStatus::Healthy, None)),
            ConnectionState::Unhealthy(reason) => {
                Some((NodeStatus::Unhealthy, Some(reason.clone())))
            }
            _ => None,
        }
    }
}

struct Inner {
    node_id: NodeId,
    transport: Arc<dyn NodeTransport>,
    store: Arc<dyn NodeStore>,
    events: Arc<dyn SecurityEventSink>,
    settings: ConnectionSettings,

    synced: AtomicBool,
    state: Mutex<ConnectionState>,
    reported: Mutex<Option<(NodeStatus, Option<String>)>>,

    intents_tx: mpsc::Sender<UpdateIntent>,
    intents_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<UpdateIntent>>>,
    stream_task: Mutex<Option<JoinHandle<()>>>,

    // Monitor ticks and restart_backend both sync.
    sync_lock: tokio::sync::Mutex<()>,
    // Held from the state change through the store write, so persisted
    // status lands in the same order as in-memory transitions.
    status_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl Inner {
    async fn monitor(self: Arc<Self>) {
        info!(node_id = self.node_id, "Node monitor started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.tick() => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.tick) => {}
            }
        }
        debug!(node_id = self.node_id, "Node monitor stopped");
    }

    async fn tick(self: &Arc<Self>) {
        let handshake =
            tokio::time::timeout(self.settings.handshake_timeout, self.transport.connect()).await;
        match handshake {
            Err(_) => self.mark_down("timeout".to_string()).await,
            Ok(Err(e)) => self.mark_down(e.to_string()).await,
            Ok(Ok(())) => {
                if self.synced.load(Ordering::Acquire) {
                    return;
                }
                let _guard = self.sync_lock.lock().await;
                self.set_state(ConnectionState::Syncing).await;
                match self.synchronize().await {
                    Ok(()) => {
                        self.set_state(ConnectionState::Healthy).await;
                        self.ensure_stream();
                    }
                    Err(e) => {
                        warn!(node_id = self.node_id, error = %e, "Node sync failed, retrying next tick");
                        self.mark_down(e.to_string()).await;
                    }
                }
            }
        }
    }

    /// Fetch the node's backends, then push the complete user list.
    async fn synchronize(&self) -> Result<(), NodeError> {
        let backends = self.request(self.transport.fetch_backends()).await?;
        debug!(node_id = self.node_id, backends = backends.len(), "Fetched node backends");
        self.store
            .store_backends(self.node_id, backends)
            .await
            .map_err(|e| NodeError::Sync(format!("storing backends: {}", e)))?;

        let users = self
            .store
            .list_node_users(self.node_id)
            .await
            .map_err(|e| NodeError::Sync(format!("listing users: {}", e)))?;
        let count = users.len();
        self.request(self.transport.repopulate_users(users)).await?;

        self.synced.store(true, Ordering::Release);
        info!(node_id = self.node_id, users = count, "Node synchronized");
        Ok(())
    }

    async fn request<T>(
        &self,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        tokio::time::timeout(self.settings.request_timeout, call)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn mark_down(&self, reason: String) {
        self.synced.store(false, Ordering::Release);
        if let Some(handle) = self.stream_task.lock().take() {
            handle.abort();
        }
        self.set_state(ConnectionState::Unhealthy(reason)).await;
    }

    fn ensure_stream(self: &Arc<Self>) {
        let mut slot = self.stream_task.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = self.clone();
        *slot = Some(tokio::spawn(inner.run_stream()));
    }

    async fn run_stream(self: Arc<Self>) {
        let rx = self.intents_rx.clone().lock_owned().await;
        let intents = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|intent| (intent, rx))
        })
        .boxed();

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.transport.sync_users(intents) => result,
        };

        let reason = match result {
            Ok(()) => TransportError::StreamClosed.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(node_id = self.node_id, reason = %reason, "Update stream ended");
        self.synced.store(false, Ordering::Release);
        self.set_state(ConnectionState::Unhealthy(reason)).await;
    }

    async fn set_state(&self, next: ConnectionState) {
        let _status = self.status_lock.lock().await;
        let previous = std::mem::replace(&mut *self.state.lock(), next.clone());
        let Some((status, reason)) = next.persisted() else {
            return;
        };

        let previous_status = {
            let mut reported = self.reported.lock();
            if reported.as_ref() == Some(&(status, reason.clone())) {
                return;
            }
            reported.replace((status, reason.clone())).map(|(s, _)| s)
        };

        if previous_status != Some(status) {
            match status {
                NodeStatus::Healthy => {
                    info!(node_id = self.node_id, from = ?previous, "Node healthy");
                    self.events.emit(
                        SecurityEvent::new(SecurityEventKind::ConnectionUp, Severity::Info, "healthy")
                            .for_node(self.node_id),
                    );
                }
                _ => {
                    let details = reason.clone().unwrap_or_default();
                    warn!(node_id = self.node_id, reason = %details, "Node unhealthy");
                    self.events.emit(
                        SecurityEvent::new(SecurityEventKind::ConnectionDown, Severity::Warning, details)
                            .for_node(self.node_id),
                    );
                }
            }
        }

        if let Err(e) = self
            .store
            .update_node_status(self.node_id, status, reason.as_deref())
            .await
        {
            warn!(node_id = self.node_id, error = %e, "Failed to persist node status");
        }
    }
}

/// Live connection to one node: a monitor task, an update stream task and
/// a single-slot intent queue between callers and that stream.
pub struct NodeConnection {
    node: Node,
    inner: Arc<Inner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl NodeConnection {
    /// Create the connection and start monitoring immediately.
    pub fn start(
        node: Node,
        transport: Arc<dyn NodeTransport>,
        store: Arc<dyn NodeStore>,
        events: Arc<dyn SecurityEventSink>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (intents_tx, intents_rx) = mpsc::channel(1);
        let inner = Arc::new(Inner {
            node_id: node.id,
            transport,
            store,
            events,
            settings,
            synced: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Connecting),
            reported: Mutex::new(None),
            intents_tx,
            intents_rx: Arc::new(tokio::sync::Mutex::new(intents_rx)),
            stream_task: Mutex::new(None),
            sync_lock: tokio::sync::Mutex::new(()),
            status_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });

        let monitor = tokio::spawn(inner.clone().monitor());
        Arc::new(Self {
            node,
            inner,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().clone()
    }

    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    /// Queue an intent for the update stream. Waits while the slot is
    /// taken. An intent for a stopped connection is dropped.
    pub async fn update_user(&self, intent: UpdateIntent) {
        let user_id = intent.user.id;
        if self.inner.intents_tx.send(intent).await.is_err() {
            debug!(node_id = self.node.id, user_id, "Connection closed, dropping update");
        }
    }

    pub async fn fetch_users_stats(&self) -> Result<Vec<UserUsage>, NodeError> {
        Ok(self
            .inner
            .request(self.inner.transport.fetch_users_stats())
            .await?)
    }

    pub async fn get_backend_config(&self, backend: &str) -> Result<BackendConfig, NodeError> {
        Ok(self
            .inner
            .request(self.inner.transport.fetch_backend_config(backend))
            .await?)
    }

    pub async fn get_backend_stats(&self, backend: &str) -> Result<BackendStats, NodeError> {
        Ok(self
            .inner
            .request(self.inner.transport.get_backend_stats(backend))
            .await?)
    }

    /// Restart a backend, then resync. Any failure leaves the node
    /// unhealthy and is returned to the caller.
    pub async fn restart_backend(
        &self,
        backend: Option<&str>,
        config: Option<BackendConfig>,
    ) -> Result<(), NodeError> {
        let inner = &self.inner;
        let result = async {
            inner
                .request(inner.transport.restart_backend(backend, config))
                .await?;
            let _guard = inner.sync_lock.lock().await;
            inner.synchronize().await
        }
        .await;

        match result {
            Ok(()) => {
                info!(node_id = self.node.id, backend = ?backend, "Backend restarted");
                inner.set_state(ConnectionState::Healthy).await;
                inner.ensure_stream();
                Ok(())
            }
            Err(e) => {
                warn!(node_id = self.node.id, backend = ?backend, error = %e, "Backend restart failed");
                inner.mark_down(e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Open a fresh log stream. It ends when the node closes it.
    pub async fn stream_logs(
        &self,
        backend: &str,
        include_buffer: bool,
    ) -> Result<LogStream, NodeError> {
        Ok(self
            .inner
            .request(self.inner.transport.stream_logs(backend, include_buffer))
            .await?)
    }

    /// Cancel both tasks and close the transport.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }
        let stream = self.inner.stream_task.lock().take();
        if let Some(handle) = stream {
            let _ = handle.await;
        }
        self.inner.intents_rx.lock().await.close();
        self.inner.synced.store(false, Ordering::Release);
        self.inner.transport.close().await;
        {
            let _status = self.inner.status_lock.lock().await;
            *self.inner.state.lock() = ConnectionState::Stopped;
        }
        info!(node_id = self.node.id, "Node connection stopped");
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
