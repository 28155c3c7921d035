//! Application delegate seams.
//!
//! All hooks are invoked synchronously from the protocol path, some of them
//! while the registry lock is held; implementations must not block.

use crate::error::Error;
use crate::types::{Event, Node};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Main extension point: node metadata, user messages, and user state for
/// push-pull exchanges.
pub trait Delegate: Send + Sync {
    /// Opaque metadata advertised with our Alive messages, at most `limit`
    /// bytes.
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    /// A user message arrived (datagram or stream). The buffer is only valid
    /// for the call.
    fn notify_msg(&self, _msg: &[u8]) {}

    /// User broadcasts to piggyback, each costing `len + overhead` against
    /// `limit` bytes.
    fn broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Opaque state to ship in a push-pull exchange.
    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    /// Counterpart state received from a push-pull exchange.
    fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}

/// Membership change notifications.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, node: &Node);
    fn notify_leave(&self, node: &Node);
    fn notify_update(&self, node: &Node);
}

/// Name collisions: two distinct addresses claiming one node name.
pub trait ConflictDelegate: Send + Sync {
    fn notify_conflict(&self, existing: &Node, other: &Node);
}

/// Veto point for admitting peers; an error drops the Alive message.
pub trait AliveDelegate: Send + Sync {
    fn notify_alive(&self, peer: &Node) -> Result<(), Error>;
}

/// Veto point for push-pull merges; an error aborts the whole exchange.
pub trait MergeDelegate: Send + Sync {
    fn notify_merge(&self, peers: &[Node]) -> Result<(), Error>;
}

/// Probe instrumentation: attach a payload to our acks, observe RTTs.
pub trait PingDelegate: Send + Sync {
    fn ack_payload(&self) -> Vec<u8>;
    fn notify_ping_complete(&self, peer: &Node, rtt: Duration, payload: &[u8]);
}

/// [`EventDelegate`] adapter that forwards events into an mpsc channel.
///
/// Sends never block the protocol path: if the receiver falls behind, events
/// are dropped with a warning.
pub struct ChannelEvents {
    tx: mpsc::Sender<Event>,
}

impl ChannelEvents {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    fn push(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("membership event dropped: {}", e);
        }
    }
}

impl EventDelegate for ChannelEvents {
    fn notify_join(&self, node: &Node) {
        self.push(Event::Join(node.clone()));
    }

    fn notify_leave(&self, node: &Node) {
        self.push(Event::Leave(node.clone()));
    }

    fn notify_update(&self, node: &Node) {
        self.push(Event::Update(node.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateKind;

    fn node(name: &str) -> Node {
        Node {
            name: name.into(),
            addr: "127.0.0.1".parse().unwrap(),
            port: 7946,
            meta: Vec::new(),
            state: StateKind::Alive,
            vsn: [1, 5, 5, 2, 5, 5],
        }
    }

    #[tokio::test]
    async fn test_channel_events_forward() {
        let (events, mut rx) = ChannelEvents::new(4);
        events.notify_join(&node("a"));
        events.notify_leave(&node("b"));
        events.notify_update(&node("c"));

        assert!(matches!(rx.recv().await, Some(Event::Join(n)) if n.name == "a"));
        assert!(matches!(rx.recv().await, Some(Event::Leave(n)) if n.name == "b"));
        assert!(matches!(rx.recv().await, Some(Event::Update(n)) if n.name == "c"));
    }

    #[tokio::test]
    async fn test_channel_events_drop_when_full() {
        let (events, mut rx) = ChannelEvents::new(1);
        events.notify_join(&node("a"));
        events.notify_join(&node("b")); // dropped, receiver is full

        assert!(matches!(rx.recv().await, Some(Event::Join(n)) if n.name == "a"));
        assert!(rx.try_recv().is_err());
    }
}
