//! Client for a single upstream tool server.
//!
//! Owns one transport and one logical connection. Requests carry strictly
//! increasing integer ids unique within the client's lifetime; a pending map
//! correlates responses to callers, each guarded by its own deadline.
//! Responses may complete out of send order: correlation is by id, not by
//! arrival sequence. Responses matching nothing pending, like unparseable
//! frames below the transport, are dropped: the stream is treated as noisy.

use crate::error::{BridgeError, Result};
use crate::events::{ClientEvent, EventSender};
use crate::logging;
use crate::protocol::*;
use crate::transport::Transport;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

/// Connection lifecycle of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type ConnectOutcome = Result<Vec<ToolDef>>;
type SharedConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

enum ConnectPhase {
    Disconnected,
    /// At most one transport open is in flight; concurrent callers await it.
    Connecting(SharedConnect),
    Connected,
}

pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    name: String,
    timeout: Duration,
    transport: Mutex<Box<dyn Transport>>,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse>>>>,
    phase: StdMutex<ConnectPhase>,
    server_info: StdMutex<Option<ServerInfo>>,
    tools: StdMutex<Vec<ToolDef>>,
    events: StdMutex<Option<EventSender>>,
}

impl Client {
    /// Build a client from a server configuration, selecting the transport.
    pub fn from_config(config: &crate::config::ServerConfig) -> Result<Self> {
        use crate::config::TransportKind;
        use crate::transport::{HttpTransport, StdioTransport};
        let transport: Box<dyn Transport> = match config.transport_kind()? {
            TransportKind::Stdio => Box::new(StdioTransport::new(config)?),
            TransportKind::Http => Box::new(HttpTransport::new(config)?),
        };
        Ok(Self::with_transport(
            config.name.clone(),
            config.timeout(),
            transport,
        ))
    }

    /// Build a client over an explicit transport. Public so embedders and
    /// tests can supply their own transport implementation.
    pub fn with_transport(
        name: impl Into<String>,
        timeout: Duration,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                name: name.into(),
                timeout,
                transport: Mutex::new(transport),
                next_id: AtomicU64::new(1),
                pending: StdMutex::new(HashMap::new()),
                phase: StdMutex::new(ConnectPhase::Disconnected),
                server_info: StdMutex::new(None),
                tools: StdMutex::new(Vec::new()),
                events: StdMutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Route lifecycle events to the given channel.
    pub fn set_event_sink(&self, events: EventSender) {
        *self.inner.events.lock().unwrap() = Some(events);
    }

    pub fn state(&self) -> ConnectionState {
        match *self.inner.phase.lock().unwrap() {
            ConnectPhase::Disconnected => ConnectionState::Disconnected,
            ConnectPhase::Connecting(_) => ConnectionState::Connecting,
            ConnectPhase::Connected => ConnectionState::Connected,
        }
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.lock().unwrap().clone()
    }

    /// Tools advertised at the last listing.
    pub fn tools(&self) -> Vec<ToolDef> {
        self.inner.tools.lock().unwrap().clone()
    }

    /// Connect, handshake, and list tools. Idempotent: while one connect is
    /// in flight, concurrent callers share its outcome; once connected, the
    /// cached tool list is returned.
    pub async fn connect(&self) -> ConnectOutcome {
        let shared = {
            let mut phase = self.inner.phase.lock().unwrap();
            match &*phase {
                ConnectPhase::Connected => return Ok(self.tools()),
                ConnectPhase::Connecting(shared) => shared.clone(),
                ConnectPhase::Disconnected => {
                    let inner = Arc::clone(&self.inner);
                    let shared: SharedConnect =
                        async move { ClientInner::establish(inner).await }.boxed().shared();
                    *phase = ConnectPhase::Connecting(shared.clone());
                    shared
                }
            }
        };

        let outcome = shared.await;

        let mut phase = self.inner.phase.lock().unwrap();
        if matches!(*phase, ConnectPhase::Connecting(_)) {
            *phase = match &outcome {
                Ok(_) => ConnectPhase::Connected,
                Err(_) => ConnectPhase::Disconnected,
            };
        }
        outcome
    }

    /// Invoke a tool on the connected server. Upstream errors pass through
    /// with code, message and data intact.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        if self.state() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let params = ToolCallParams {
            name: name.to_string(),
            arguments,
        };
        let response = self
            .inner
            .request("tools/call", Some(serde_json::to_value(params).map_err(to_protocol)?))
            .await?;
        let result = response
            .result
            .ok_or_else(|| BridgeError::Protocol("tool call returned no result".into()))?;
        serde_json::from_value(result).map_err(to_protocol)
    }

    /// Liveness probe against the connected server.
    pub async fn ping(&self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }
        self.inner.request("ping", None).await.map(|_| ())
    }

    /// List the documents the server exposes.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDef>> {
        if self.state() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let response = self.inner.request("resources/list", None).await?;
        let result = response
            .result
            .ok_or_else(|| BridgeError::Protocol("resources/list returned no result".into()))?;
        let listing: ResourcesListResult = serde_json::from_value(result).map_err(to_protocol)?;
        Ok(listing.resources)
    }

    /// Read one URI-addressed document.
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        if self.state() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let params = ResourceReadParams {
            uri: uri.to_string(),
        };
        let response = self
            .inner
            .request(
                "resources/read",
                Some(serde_json::to_value(params).map_err(to_protocol)?),
            )
            .await?;
        response
            .result
            .ok_or_else(|| BridgeError::Protocol("resources/read returned no result".into()))
    }

    /// Re-issue the tool listing without re-running the handshake.
    pub async fn refresh_tools(&self) -> ConnectOutcome {
        if self.state() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let tools = self.inner.list_tools().await?;
        *self.inner.tools.lock().unwrap() = tools.clone();
        Ok(tools)
    }

    /// Best-effort shutdown: notify the server (send failures ignored),
    /// reject every pending request with a cancellation error, and tear the
    /// transport down. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut phase = self.inner.phase.lock().unwrap();
            if matches!(*phase, ConnectPhase::Disconnected) && self.inner.pending_is_empty() {
                return;
            }
            *phase = ConnectPhase::Disconnected;
        }

        let _ = self.inner.notify("shutdown", None).await;
        self.inner.fail_all_pending(BridgeError::Cancelled);

        {
            let mut transport = self.inner.transport.lock().await;
            transport.close().await;
        }

        self.inner.emit(ClientEvent::Disconnected {
            server: self.inner.name.clone(),
        });
    }
}

impl ClientInner {
    async fn establish(inner: Arc<ClientInner>) -> ConnectOutcome {
        let receiver = {
            let mut transport = inner.transport.lock().await;
            transport.open().await?
        };
        ClientInner::spawn_reader(&inner, receiver);

        match inner.handshake().await {
            Ok(tools) => {
                inner.emit(ClientEvent::Connected {
                    server: inner.name.clone(),
                });
                logging::info(&format!(
                    "connected to '{}' ({} tool(s))",
                    inner.name,
                    tools.len()
                ));
                Ok(tools)
            }
            Err(e) => {
                // A half-connected transport is torn down, not left running.
                let mut transport = inner.transport.lock().await;
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> ConnectOutcome {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "toolbridge".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let response = self
            .request("initialize", Some(serde_json::to_value(params).map_err(to_protocol)?))
            .await?;
        let result = response
            .result
            .ok_or_else(|| BridgeError::Protocol("initialize returned no result".into()))?;
        let init: InitializeResult = serde_json::from_value(result).map_err(to_protocol)?;
        *self.server_info.lock().unwrap() = init.server_info;

        self.notify("notifications/initialized", None).await?;

        let tools = self.list_tools().await?;
        *self.tools.lock().unwrap() = tools.clone();
        Ok(tools)
    }

    /// Reader task: frames arrive in transport byte order; a transport error
    /// drains every pending request so callers fail fast instead of waiting
    /// out their deadlines.
    fn spawn_reader(inner: &Arc<Self>, mut receiver: crate::transport::FrameReceiver) {
        let weak: Weak<ClientInner> = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match frame {
                    Ok(value) => inner.dispatch_frame(value),
                    Err(e) => {
                        inner.emit(ClientEvent::Error {
                            server: inner.name.clone(),
                            message: e.to_string(),
                        });
                        inner.mark_disconnected();
                        inner.fail_all_pending(e);
                        return;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.mark_disconnected();
                inner.fail_all_pending(BridgeError::Connection("transport closed".into()));
            }
        });
    }

    fn dispatch_frame(&self, value: Value) {
        let response: JsonRpcResponse = match serde_json::from_value(value) {
            Ok(response) => response,
            Err(e) => {
                logging::debug(&format!("dropped malformed response: {}", e));
                return;
            }
        };
        let Some(id) = response.id else {
            // Server-initiated notifications are not part of this surface.
            return;
        };
        let sender = self.pending.lock().unwrap().remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => {
                logging::debug(&format!("dropped response with unknown id {}", id));
            }
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&JsonRpcRequest::request(id, method, params))
            .map_err(to_protocol)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        // The deadline covers the send too: the HTTP transport performs a
        // whole exchange inside `send`, so a peer that accepts the request
        // but never answers must not extend the wait past the timeout.
        let exchange = async {
            self.send_frame(frame).await?;
            match rx.await {
                Ok(result) => result,
                // Sender dropped without an explicit verdict.
                Err(_) => Err(BridgeError::Connection("connection closed".into())),
            }
        };
        let response = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(BridgeError::Timeout(self.timeout));
            }
            Ok(Err(e)) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(e);
            }
            Ok(Ok(response)) => response,
        };

        if let Some(err) = response.error {
            return Err(BridgeError::Remote {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(response)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcRequest::notification(method, params))
            .map_err(to_protocol)?;
        match tokio::time::timeout(self.timeout, self.send_frame(frame)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(self.timeout)),
        }
    }

    async fn send_frame(&self, frame: String) -> Result<()> {
        let transport = self.transport.lock().await;
        transport.send(frame).await
    }

    async fn list_tools(&self) -> ConnectOutcome {
        let response = self.request("tools/list", None).await?;
        let result = response
            .result
            .ok_or_else(|| BridgeError::Protocol("tools/list returned no result".into()))?;
        let listing: ToolsListResult = serde_json::from_value(result).map_err(to_protocol)?;
        Ok(listing.tools)
    }

    fn fail_all_pending(&self, error: BridgeError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    fn pending_is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    fn mark_disconnected(&self) {
        let mut phase = self.phase.lock().unwrap();
        if matches!(*phase, ConnectPhase::Connected) {
            *phase = ConnectPhase::Disconnected;
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.try_send(event);
        }
    }
}

fn to_protocol(e: serde_json::Error) -> BridgeError {
    BridgeError::Protocol(e.to_string())
}
