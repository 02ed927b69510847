//! toolbridge: tool-provider connectivity layer.
//!
//! Speaks a JSON-RPC-based tool/resource protocol over two transports
//! (spawned-process stdio and HTTP POST). A [`Client`] owns one logical
//! connection to one upstream server; a [`ClientManager`] aggregates many
//! servers behind one tool-name routing table, isolating each behind its own
//! [`CircuitBreaker`]; a [`ServerDispatcher`] serves the same protocol to
//! inbound callers.
//!
//! ```no_run
//! use toolbridge::{BridgeConfig, ClientManager};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = BridgeConfig::load(std::path::Path::new("."))?;
//! let manager = ClientManager::new(config);
//! let tools = manager.discover().await?;
//! for tool in &tools {
//!     println!("{} (served by {})", tool.name, tool.server);
//! }
//! let _result = manager.call_tool("read_file", serde_json::json!({"path": "a.txt"})).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerPhase, CircuitBreaker};
pub use client::{Client, ConnectionState};
pub use config::{AuthMode, BridgeConfig, ServerConfig, TransportKind};
pub use dispatcher::{Authorizer, ServerDispatcher};
pub use error::{BridgeError, Result};
pub use events::ClientEvent;
pub use manager::{ClientManager, ServerState, ToolDescriptor};
pub use protocol::{ContentBlock, ToolCallResult, ToolDef};
pub use registry::{ServedResource, ServedTool};
pub use transport::{HttpTransport, StdioTransport, Transport};
