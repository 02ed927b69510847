//! Scripted in-process server used by the integration tests.
//!
//! Implements [`Transport`] directly: every request written through `send`
//! is answered (or deliberately ignored) according to a [`Script`], so the
//! client and manager can be exercised without spawning real processes.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use toolbridge::error::{BridgeError, Result};
use toolbridge::protocol::ToolDef;
use toolbridge::transport::{FrameReceiver, Transport};

#[derive(Default)]
pub struct Script {
    pub marker: String,
    pub tools: Vec<ToolDef>,
    /// Fail `open()` outright (unreachable server).
    pub fail_open: bool,
    /// Never answer any request (hung server).
    pub mute: bool,
    /// `send` itself never returns (hostile exchange, not just a missing
    /// response).
    pub stall_send: bool,
    /// Answer the handshake but never answer `tools/call`.
    pub mute_calls: bool,
    /// Answer `tools/call` with a structured error.
    pub fail_calls: bool,
    /// Emit a response with an unknown id before the real one.
    pub stray_response_first: bool,
    /// (uri, text) documents answered on resource methods.
    pub resources: Vec<(String, String)>,
    pub opens: Arc<AtomicU64>,
    pub calls: Arc<AtomicU64>,
    pub closes: Arc<AtomicU64>,
}

impl Script {
    pub fn new(marker: &str, tool_names: &[&str]) -> Self {
        Self {
            marker: marker.to_string(),
            tools: tool_names
                .iter()
                .map(|name| ToolDef {
                    name: name.to_string(),
                    description: Some(format!("{} from {}", name, marker)),
                    input_schema: json!({"type": "object"}),
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct ScriptedTransport {
    script: Arc<Script>,
    frame_tx: Mutex<Option<mpsc::Sender<Result<Value>>>>,
}

impl ScriptedTransport {
    pub fn boxed(script: Arc<Script>) -> Box<dyn Transport> {
        Box::new(Self {
            script,
            frame_tx: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&mut self) -> Result<FrameReceiver> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_open {
            return Err(BridgeError::Connection("scripted open failure".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.frame_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, frame: String) -> Result<()> {
        if self.script.stall_send {
            std::future::pending::<()>().await;
        }
        let tx = self
            .frame_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(BridgeError::NotConnected)?;
        let message: Value =
            serde_json::from_str(&frame).map_err(|e| BridgeError::Protocol(e.to_string()))?;

        // Notifications are consumed without an answer.
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            return Ok(());
        };
        if self.script.mute {
            return Ok(());
        }

        let script = &self.script;
        let response = match message.get("method").and_then(Value::as_str) {
            Some("initialize") => json!({
                "jsonrpc": "2.0", "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": script.marker},
                },
            }),
            Some("tools/list") => json!({
                "jsonrpc": "2.0", "id": id,
                "result": {"tools": script.tools},
            }),
            Some("tools/call") => {
                script.calls.fetch_add(1, Ordering::SeqCst);
                if script.mute_calls {
                    return Ok(());
                }
                if script.fail_calls {
                    json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {
                            "code": -32050,
                            "message": "tool backend unavailable",
                            "data": {"server": script.marker},
                        },
                    })
                } else {
                    if script.stray_response_first {
                        let stray = json!({"jsonrpc": "2.0", "id": 999_999, "result": {}});
                        let _ = tx.send(Ok(stray)).await;
                    }
                    let name = message["params"]["name"].as_str().unwrap_or("");
                    json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {
                            "content": [{"type": "text", "text": format!("{}:{}", script.marker, name)}],
                            "isError": false,
                        },
                    })
                }
            }
            Some("ping") => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            Some("resources/list") => {
                let resources: Vec<Value> = script
                    .resources
                    .iter()
                    .map(|(uri, _)| json!({"uri": uri, "name": uri}))
                    .collect();
                json!({"jsonrpc": "2.0", "id": id, "result": {"resources": resources}})
            }
            Some("resources/read") => {
                let uri = message["params"]["uri"].as_str().unwrap_or("");
                match script.resources.iter().find(|(u, _)| u == uri) {
                    Some((uri, text)) => json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {"contents": [{"uri": uri, "text": text}]},
                    }),
                    None => json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": -32602, "message": "unknown resource"},
                    }),
                }
            }
            _ => json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": "method not found"},
            }),
        };
        let _ = tx.send(Ok(response)).await;
        Ok(())
    }

    async fn close(&mut self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        *self.frame_tx.lock().unwrap() = None;
    }
}
