//! Transport layer: one upstream server, two interchangeable transports.
//!
//! A transport moves already-parsed protocol frames. `open()` yields the
//! inbound side as a channel; an `Err` frame on that channel means the
//! transport is dead and no further frames will arrive. Unparseable input is
//! dropped silently (the stream is treated as potentially noisy) and counted.

mod http;
mod stdio;

pub use http::{HttpTransport, MAX_BODY_BYTES};
pub use stdio::{StdioTransport, MAX_LINE_BYTES};

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Inbound frames. A final `Err` signals transport failure.
pub type FrameReceiver = mpsc::Receiver<Result<Value>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the transport and return the inbound frame stream.
    async fn open(&mut self) -> Result<FrameReceiver>;

    /// Send one serialized protocol message.
    async fn send(&self, frame: String) -> Result<()>;

    /// Tear the transport down. Idempotent.
    async fn close(&mut self);
}
