//! Connection lifecycle events.
//!
//! Clients push events into an explicit channel the manager (or any embedder)
//! reads from, instead of registering callbacks on a global event bus.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { server: String },
    Disconnected { server: String },
    Error { server: String, message: String },
}

pub type EventSender = mpsc::Sender<ClientEvent>;
pub type EventReceiver = mpsc::Receiver<ClientEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(256)
}
