//! Core membership types: node identity, peer state, events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::time::Instant;

// =============================================================================
// PROTOCOL VERSIONS
// =============================================================================

/// Oldest wire protocol revision this engine understands.
pub const PROTOCOL_VERSION_MIN: u8 = 1;

/// Newest wire protocol revision this engine speaks.
/// TCP-ping fallback requires the remote to advertise at least version 3.
pub const PROTOCOL_VERSION_MAX: u8 = 5;

/// Minimum remote protocol version that supports TCP pings.
pub const PROTOCOL_VERSION_TCP_PING: u8 = 3;

/// Minimum remote protocol version that understands the CRC packet wrapper.
pub const PROTOCOL_VERSION_CRC: u8 = 5;

/// Maximum size of the opaque per-node metadata blob.
pub const META_MAX_SIZE: usize = 512;

// =============================================================================
// PEER STATE
// =============================================================================

/// Liveness state of a known peer.
///
/// Ordering matters: for equal incarnations a higher state wins
/// (Alive < Suspect < Dead), and a graceful leave maps Dead into Left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum StateKind {
    Alive = 0,
    Suspect = 1,
    Dead = 2,
    Left = 3,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Alive => "alive",
            StateKind::Suspect => "suspect",
            StateKind::Dead => "dead",
            StateKind::Left => "left",
        };
        f.write_str(s)
    }
}

/// A peer as seen by the local node.
///
/// `vsn` is the six-byte version vector
/// `[pmin, pmax, pcur, dmin, dmax, dcur]` — protocol min/max/current followed
/// by the delegate-protocol min/max/current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    /// Opaque application metadata, at most [`META_MAX_SIZE`] bytes.
    pub meta: Vec<u8>,
    pub state: StateKind,
    pub vsn: [u8; 6],
}

impl Node {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Newest protocol version the peer speaks.
    pub fn pmax(&self) -> u8 {
        self.vsn[1]
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address())
    }
}

/// Full local record for a known peer.
///
/// The registry owns exactly one of these per name. `state_change` is the
/// instant of the last state transition and is what suspicion-fire callbacks
/// re-check before promoting a suspect.
#[derive(Debug, Clone)]
pub struct Member {
    pub node: Node,
    pub incarnation: u32,
    pub state: StateKind,
    pub state_change: Instant,
}

impl Member {
    /// Dead or Left peers count as gone; everything else participates.
    pub fn dead_or_left(&self) -> bool {
        matches!(self.state, StateKind::Dead | StateKind::Left)
    }
}

// =============================================================================
// MEMBERSHIP EVENTS
// =============================================================================

/// Membership change surfaced to the application.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer transitioned into the cluster (first sighting or rejoin).
    Join(Node),
    /// A peer was declared dead or gracefully left.
    Leave(Node),
    /// A peer's metadata changed while it stayed alive.
    Update(Node),
}

impl Event {
    pub fn node(&self) -> &Node {
        match self {
            Event::Join(n) | Event::Leave(n) | Event::Update(n) => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_precedence() {
        assert!(StateKind::Alive < StateKind::Suspect);
        assert!(StateKind::Suspect < StateKind::Dead);
        assert!(StateKind::Dead < StateKind::Left);
    }

    #[test]
    fn test_node_display() {
        let node = Node {
            name: "n1".into(),
            addr: "10.0.0.1".parse().unwrap(),
            port: 7946,
            meta: Vec::new(),
            state: StateKind::Alive,
            vsn: [1, 5, 5, 0, 0, 0],
        };
        assert_eq!(node.to_string(), "n1 (10.0.0.1:7946)");
        assert_eq!(node.pmax(), 5);
    }
}
