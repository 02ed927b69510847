//! HTTP transport: one POST per protocol message.
//!
//! The configured URL is used verbatim, with no implicit path rewriting. The
//! response body is read as a stream up to [`MAX_BODY_BYTES`] and the
//! connection aborted beyond that. Bearer tokens are looked up from the
//! environment at send time, never stored in configuration.

use super::{FrameReceiver, Transport};
use crate::config::{AuthMode, ServerConfig};
use crate::error::{BridgeError, Result};
use crate::logging;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Hard ceiling on a single response body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub struct HttpTransport {
    url: String,
    auth: AuthMode,
    token_env: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
    frame_tx: Option<mpsc::Sender<Result<Value>>>,
    dropped: Arc<AtomicU64>,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| BridgeError::Config(format!("server '{}' has no url", config.name)))?;
        Ok(Self {
            url,
            auth: config.auth,
            token_env: config.token_env.clone(),
            timeout: config.timeout(),
            http: reqwest::Client::new(),
            frame_tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Response bodies dropped because they failed to parse.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        if self.auth != AuthMode::Bearer {
            return Ok(None);
        }
        let var = self
            .token_env
            .as_deref()
            .ok_or_else(|| BridgeError::Config("bearer auth without token_env".into()))?;
        match std::env::var(var) {
            Ok(token) => Ok(Some(token)),
            Err(_) => Err(BridgeError::Config(format!(
                "token environment variable '{}' is not set",
                var
            ))),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&mut self) -> Result<FrameReceiver> {
        let (frame_tx, frame_rx) = mpsc::channel::<Result<Value>>(64);
        self.frame_tx = Some(frame_tx);
        Ok(frame_rx)
    }

    async fn send(&self, frame: String) -> Result<()> {
        let tx = self.frame_tx.as_ref().ok_or(BridgeError::NotConnected)?;

        // The whole exchange happens inside this call, so the per-request
        // deadline applies here, not just to response correlation.
        let mut request = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(frame);
        if let Some(token) = self.bearer_token()? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::Connection(format!("POST {} failed: {}", self.url, e)))?;

        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            // Notification acknowledged; nothing to correlate.
            return Ok(());
        }
        if !status.is_success() {
            return Err(BridgeError::Connection(format!(
                "POST {} returned {}",
                self.url, status
            )));
        }

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| BridgeError::Connection(format!("body read failed: {}", e)))?;
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                // Dropping the stream aborts the connection.
                return Err(BridgeError::Overflow { limit: MAX_BODY_BYTES });
            }
            body.extend_from_slice(&chunk);
        }

        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(());
        }
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => {
                let _ = tx.send(Ok(value)).await;
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                logging::debug(&format!("dropped unparseable response body: {}", e));
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        // Stateless; dropping the sender ends the inbound stream.
        self.frame_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn requires_a_url() {
        let config = ServerConfig::stdio("srv", "server-bin", &[]);
        assert!(matches!(
            HttpTransport::new(&config),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn bearer_token_comes_from_environment() {
        let mut config = ServerConfig::http("srv", "http://127.0.0.1:1/rpc");
        config.auth = AuthMode::Bearer;
        config.token_env = Some("TOOLBRIDGE_TEST_TOKEN".to_string());
        let transport = HttpTransport::new(&config).unwrap();

        unsafe { std::env::remove_var("TOOLBRIDGE_TEST_TOKEN") };
        assert!(matches!(
            transport.bearer_token(),
            Err(BridgeError::Config(_))
        ));

        unsafe { std::env::set_var("TOOLBRIDGE_TEST_TOKEN", "tok-123") };
        assert_eq!(transport.bearer_token().unwrap(), Some("tok-123".into()));
        unsafe { std::env::remove_var("TOOLBRIDGE_TEST_TOKEN") };
    }

    #[test]
    fn no_auth_means_no_token_lookup() {
        let config = ServerConfig::http("srv", "http://127.0.0.1:1/rpc");
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.bearer_token().unwrap(), None);
    }

    #[tokio::test]
    async fn send_gives_up_on_a_server_that_never_answers() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and read the request, but never write a response.
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let mut config = ServerConfig::http("hung", format!("http://{}/rpc", addr));
        config.timeout_ms = 200;
        let mut transport = HttpTransport::new(&config).unwrap();
        let _rx = transport.open().await.unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string()),
        )
        .await
        .expect("send must respect the configured deadline");
        assert!(matches!(outcome, Err(BridgeError::Connection(_))));
    }
}
