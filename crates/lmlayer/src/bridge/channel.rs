//! In-process message channel between host and worker.
//!
//! The `postMessage`/`onmessage` pair: two unbounded queues, one per direction.
//! Sending never blocks and never waits for the peer to process the message.

use tokio::sync::mpsc;

use super::protocol::{Incoming, Message};

/// Peer went away; the message was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message channel closed")]
pub struct ChannelClosed;

/// Host end: sends requests, receives replies.
pub struct HostPort {
    pub outbound: mpsc::UnboundedSender<Message>,
    pub inbound: mpsc::UnboundedReceiver<Incoming>,
}

/// Worker end: receives requests, replies through its [`Outbox`].
pub struct WorkerPort {
    pub inbound: mpsc::UnboundedReceiver<Message>,
    pub outbox: Outbox,
}

/// The worker's `postMessage`.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Incoming>,
}

impl Outbox {
    /// Outbox plus the queue it feeds, for callers that pump replies elsewhere.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Incoming>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, message: Message) -> Result<(), ChannelClosed> {
        self.forward(Incoming::Known(message))
    }

    /// Relays an already-decoded frame without re-interpreting it.
    pub(crate) fn forward(&self, incoming: Incoming) -> Result<(), ChannelClosed> {
        self.tx.send(incoming).map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Connected pair of ports.
pub fn channel() -> (HostPort, WorkerPort) {
    let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
    let (outbox, to_host_rx) = Outbox::channel();

    let host = HostPort {
        outbound: to_worker_tx,
        inbound: to_host_rx,
    };
    let worker = WorkerPort {
        inbound: to_worker_rx,
        outbox,
    };
    (host, worker)
}
