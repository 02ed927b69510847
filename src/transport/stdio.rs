//! Spawned-process transport: one JSON message per line over stdio.
//!
//! The child's stdout is read incrementally and split on newline boundaries;
//! each line parses independently. Unconsumed buffered bytes are capped at
//! [`MAX_LINE_BYTES`]: a peer that streams bytes without a newline gets
//! disconnected with an overflow error instead of growing our memory.

use super::{FrameReceiver, Transport};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::logging;
use async_trait::async_trait;
use bytes::BytesMut;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Hard ceiling on unconsumed buffered bytes from the child's stdout.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Grace period between closing stdin and killing the child.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Shell interpreters are refused outright: spawning one indirectly defeats
/// argument-level injection protection.
const SHELL_DENYLIST: &[&str] = &[
    "sh",
    "bash",
    "zsh",
    "fish",
    "dash",
    "ksh",
    "csh",
    "tcsh",
    "cmd",
    "cmd.exe",
    "powershell",
    "powershell.exe",
    "pwsh",
    "pwsh.exe",
];

#[derive(Debug)]
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: Option<Child>,
    writer_tx: Option<mpsc::Sender<String>>,
    dropped: Arc<AtomicU64>,
}

impl StdioTransport {
    /// Rejects deny-listed executables at construction time, not at spawn.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let command = config
            .command
            .clone()
            .ok_or_else(|| BridgeError::Config(format!("server '{}' has no command", config.name)))?;
        let basename = Path::new(&command)
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if SHELL_DENYLIST.contains(&basename.as_str()) {
            return Err(BridgeError::Spawn {
                command,
                reason: "shell interpreters are not allowed as tool servers".to_string(),
            });
        }
        Ok(Self {
            command,
            args: config.args.clone(),
            env: config.env.clone(),
            child: None,
            writer_tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Frames dropped because they failed to parse.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn open(&mut self) -> Result<FrameReceiver> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // The runtime reaps the child even if this handle is replaced
            // before an explicit close.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Connection(format!("failed to spawn {}: {}", self.command, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Connection("child has no stdin".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Connection("child has no stdout".into()))?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(32);
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if stdin.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let (frame_tx, frame_rx) = mpsc::channel::<Result<Value>>(64);
        let dropped = Arc::clone(&self.dropped);
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8 * 1024);
            loop {
                while let Some(line) = take_line(&mut buf) {
                    if let Some(value) = parse_frame(&line, &dropped) {
                        if frame_tx.send(Ok(value)).await.is_err() {
                            return;
                        }
                    }
                }
                if buf.len() > MAX_LINE_BYTES {
                    let _ = frame_tx
                        .send(Err(BridgeError::Overflow { limit: MAX_LINE_BYTES }))
                        .await;
                    return;
                }
                match stdout.read_buf(&mut buf).await {
                    Ok(0) => {
                        let _ = frame_tx
                            .send(Err(BridgeError::Connection(
                                "server closed its output stream".into(),
                            )))
                            .await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = frame_tx
                            .send(Err(BridgeError::Connection(format!("read failed: {}", e))))
                            .await;
                        return;
                    }
                }
            }
        });

        self.child = Some(child);
        self.writer_tx = Some(writer_tx);
        Ok(frame_rx)
    }

    async fn send(&self, frame: String) -> Result<()> {
        let tx = self.writer_tx.as_ref().ok_or(BridgeError::NotConnected)?;
        tx.send(frame + "\n")
            .await
            .map_err(|_| BridgeError::Connection("server input stream closed".into()))
    }

    async fn close(&mut self) {
        // Dropping the writer closes the child's stdin.
        self.writer_tx = None;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Split one newline-terminated line off the front of the buffer.
fn take_line(buf: &mut BytesMut) -> Option<BytesMut> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    Some(line)
}

/// Parse one line independently; malformed lines are dropped, not fatal.
fn parse_frame(line: &[u8], dropped: &AtomicU64) -> Option<Value> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match serde_json::from_slice::<Value>(line) {
        Ok(value) => Some(value),
        Err(e) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            logging::debug(&format!("dropped unparseable frame: {}", e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn refuses_shell_interpreters() {
        for shell in ["sh", "/bin/bash", "/usr/bin/zsh", "powershell.exe", "CMD"] {
            let config = ServerConfig::stdio("srv", shell, &["-c", "true"]);
            let err = StdioTransport::new(&config).unwrap_err();
            assert!(
                matches!(err, BridgeError::Spawn { .. }),
                "{} should be refused",
                shell
            );
        }
    }

    #[test]
    fn accepts_ordinary_executables() {
        let config = ServerConfig::stdio("srv", "/usr/local/bin/files-server", &[]);
        assert!(StdioTransport::new(&config).is_ok());
    }

    #[test]
    fn take_line_splits_on_newlines() {
        let mut buf = BytesMut::from(&b"{\"a\":1}\n{\"b\":2}\npartial"[..]);
        assert_eq!(take_line(&mut buf).unwrap().as_ref(), b"{\"a\":1}");
        assert_eq!(take_line(&mut buf).unwrap().as_ref(), b"{\"b\":2}");
        assert!(take_line(&mut buf).is_none());
        assert_eq!(buf.as_ref(), b"partial");
    }

    #[test]
    fn parse_frame_drops_garbage_and_counts() {
        let dropped = AtomicU64::new(0);
        assert!(parse_frame(b"not json at all", &dropped).is_none());
        assert!(parse_frame(b"   ", &dropped).is_none());
        assert!(parse_frame(b"{\"jsonrpc\":\"2.0\",\"id\":1}", &dropped).is_some());
        // Whitespace-only lines are skipped without counting as drops.
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn overflow_disconnects_instead_of_buffering() {
        // `head -c` emits 2 MiB with no newline terminator.
        let config = ServerConfig::stdio(
            "noisy",
            "head",
            &["-c", "2097152", "/dev/zero"],
        );
        let mut transport = StdioTransport::new(&config).unwrap();
        let mut rx = transport.open().await.unwrap();
        let frame = rx.recv().await.expect("expected a terminal frame");
        match frame {
            Err(BridgeError::Overflow { limit }) => assert_eq!(limit, MAX_LINE_BYTES),
            other => panic!("expected overflow, got {:?}", other),
        }
        assert!(rx.recv().await.is_none(), "stream ends after overflow");
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_newline_delimited_frames_from_child() {
        let config = ServerConfig::stdio(
            "echoing",
            "printf",
            &[r#"{"jsonrpc":"2.0","id":7,"result":{}}\n"#],
        );
        let mut transport = StdioTransport::new(&config).unwrap();
        let mut rx = transport.open().await.unwrap();
        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame["id"], 7);
        // EOF after the single line surfaces as a connection error.
        let last = rx.recv().await.unwrap();
        assert!(matches!(last, Err(BridgeError::Connection(_))));
        transport.close().await;
    }
}
