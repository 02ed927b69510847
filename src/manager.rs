//! Aggregates many upstream servers behind one routing table.
//!
//! `discover()` builds a (client, breaker) pair per configured server,
//! connects them concurrently, and merges the advertised tool names into a
//! tool-name → owning-server routing table. One unreachable server is logged
//! and skipped; partial availability is the intended behavior, not an error
//! state. All state is owned by the manager instance, so multiple managers
//! can coexist in one process.

use crate::breaker::{BreakerConfig, BreakerPhase, CircuitBreaker};
use crate::client::{Client, ConnectionState};
use crate::config::{BridgeConfig, ServerConfig};
use crate::error::{BridgeError, Result};
use crate::events::{self, EventReceiver, EventSender};
use crate::logging;
use crate::protocol::{ToolCallResult, ToolDef};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};

/// A tool name plus the server that owns it in the routing table.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub server: String,
}

/// Read-only snapshot of one server's state.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub connection: ConnectionState,
    pub breaker: BreakerPhase,
    pub tool_count: usize,
}

type ClientFactory = Box<dyn Fn(&ServerConfig) -> Result<Client> + Send + Sync>;

#[derive(Clone)]
struct ServerEntry {
    client: Arc<Client>,
    breaker: Arc<CircuitBreaker>,
}

pub struct ClientManager {
    config: BridgeConfig,
    breaker_config: BreakerConfig,
    factory: ClientFactory,
    servers: RwLock<HashMap<String, ServerEntry>>,
    /// tool name → owning server name.
    routing: RwLock<HashMap<String, String>>,
    /// server name → tools it advertised at discovery.
    tools: RwLock<HashMap<String, Vec<ToolDef>>>,
    /// True once a discovery cycle completed. Guards idempotency and
    /// serializes concurrent discover/shutdown calls.
    discovered: Mutex<bool>,
    events_tx: EventSender,
    events_rx: StdMutex<Option<EventReceiver>>,
}

impl ClientManager {
    pub fn new(config: BridgeConfig) -> Self {
        let (events_tx, events_rx) = events::channel();
        Self {
            config,
            breaker_config: BreakerConfig::default(),
            factory: Box::new(Client::from_config),
            servers: RwLock::new(HashMap::new()),
            routing: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
            discovered: Mutex::new(false),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        }
    }

    pub fn with_breaker_config(mut self, breaker_config: BreakerConfig) -> Self {
        self.breaker_config = breaker_config;
        self
    }

    /// Replace how clients are built from configs. Lets tests and embedders
    /// inject their own transports.
    pub fn with_client_factory(
        mut self,
        factory: impl Fn(&ServerConfig) -> Result<Client> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Box::new(factory);
        self
    }

    /// Take the lifecycle event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<EventReceiver> {
        self.events_rx.lock().unwrap().take()
    }

    /// Connect every configured server and build the routing table.
    /// Idempotent: a repeated call without an intervening `shutdown()`
    /// returns the cached aggregate.
    pub async fn discover(&self) -> Result<Vec<ToolDescriptor>> {
        let mut discovered = self.discovered.lock().await;
        if *discovered {
            return Ok(self.aggregate().await);
        }

        let mut connects = Vec::new();
        for server_config in &self.config.servers {
            let name = server_config.name.clone();
            let client = match (self.factory)(server_config) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    logging::error(&format!("cannot build client for '{}': {:#}", name, e));
                    continue;
                }
            };
            client.set_event_sink(self.events_tx.clone());
            let breaker = Arc::new(CircuitBreaker::new(
                name.clone(),
                self.breaker_config.clone(),
            ));
            self.servers.write().await.insert(
                name.clone(),
                ServerEntry {
                    client: Arc::clone(&client),
                    breaker: Arc::clone(&breaker),
                },
            );

            connects.push(tokio::spawn(async move {
                let result = breaker.call(|| async { client.connect().await }).await;
                (name, result)
            }));
        }

        // Join in configuration order so tool-name ties break deterministically.
        for connect in connects {
            match connect.await {
                Ok((name, Ok(tools))) => {
                    self.merge_tools(&name, tools).await;
                }
                Ok((name, Err(e))) => {
                    logging::error(&format!("failed to connect to server '{}': {}", name, e));
                }
                Err(e) => {
                    logging::error(&format!("connection task panicked: {}", e));
                }
            }
        }

        *discovered = true;
        Ok(self.aggregate().await)
    }

    /// First registration for a tool name wins; later duplicates from other
    /// servers are rejected with a warning, never silently overwritten.
    async fn merge_tools(&self, server: &str, tools: Vec<ToolDef>) {
        let mut routing = self.routing.write().await;
        let mut kept = Vec::new();
        for tool in tools {
            match routing.get(&tool.name) {
                Some(owner) if owner != server => {
                    logging::warn(&format!(
                        "tool '{}' from server '{}' conflicts with server '{}'; keeping the original",
                        tool.name, server, owner
                    ));
                }
                Some(_) => {
                    logging::warn(&format!(
                        "server '{}' advertises tool '{}' more than once; keeping the first",
                        server, tool.name
                    ));
                }
                None => {
                    routing.insert(tool.name.clone(), server.to_string());
                    kept.push(tool);
                }
            }
        }
        self.tools.write().await.insert(server.to_string(), kept);
    }

    /// Route a tool invocation to its owning server through that server's
    /// breaker. Unknown tool names reject immediately without consulting any
    /// server; per-call failures propagate with no automatic retry.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let server = self
            .routing
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownTool(name.to_string()))?;
        let entry = self
            .servers
            .read()
            .await
            .get(&server)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownServer(server.clone()))?;

        let client = Arc::clone(&entry.client);
        let tool = name.to_string();
        entry
            .breaker
            .call(move || async move { client.call_tool(&tool, arguments).await })
            .await
    }

    /// Every tool in the routing table, with its owning server.
    pub async fn all_tools(&self) -> Vec<ToolDescriptor> {
        self.aggregate().await
    }

    pub async fn tools_by_server(&self, server: &str) -> Option<Vec<ToolDef>> {
        self.tools.read().await.get(server).cloned()
    }

    pub async fn server_state(&self, server: &str) -> Option<ServerState> {
        let entry = self.servers.read().await.get(server).cloned()?;
        let tool_count = self
            .tools
            .read()
            .await
            .get(server)
            .map(|tools| tools.len())
            .unwrap_or(0);
        Some(ServerState {
            connection: entry.client.state(),
            breaker: entry.breaker.phase(),
            tool_count,
        })
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn has_connections(&self) -> bool {
        let servers = self.servers.read().await;
        for entry in servers.values() {
            if entry.client.state() == ConnectionState::Connected {
                return true;
            }
        }
        false
    }

    /// Shut every client down concurrently, drop the breakers, and clear all
    /// internal maps, returning the manager to its pre-discovery state.
    /// `discover()` is valid again afterwards.
    pub async fn shutdown(&self) {
        let mut discovered = self.discovered.lock().await;

        let entries: Vec<ServerEntry> = {
            let mut servers = self.servers.write().await;
            servers.drain().map(|(_, entry)| entry).collect()
        };
        futures::future::join_all(entries.iter().map(|entry| entry.client.shutdown())).await;

        self.routing.write().await.clear();
        self.tools.write().await.clear();
        *discovered = false;
    }

    async fn aggregate(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let mut all = Vec::new();
        for (server, defs) in tools.iter() {
            for def in defs {
                all.push(ToolDescriptor {
                    name: def.name.clone(),
                    description: def.description.clone(),
                    input_schema: def.input_schema.clone(),
                    server: server.clone(),
                });
            }
        }
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
