//! Crate-wide error type for user-facing operations.

use crate::net::encrypted::CryptoError;
use crate::net::wire::WireError;
use std::io;

/// Errors surfaced by membership operations.
///
/// Per-peer failures inside the scheduler loops are logged and swallowed so a
/// single bad peer cannot halt the cluster view; only user-initiated
/// operations (create, join, leave, update) return these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("node metadata exceeds {0} bytes")]
    MetaTooLarge(usize),

    #[error("peer rejected: {0}")]
    PeerRejected(String),

    #[error("merge canceled: {0}")]
    MergeCanceled(String),

    #[error("no response from node before timeout")]
    NoResponse,

    #[error("timeout waiting for broadcast dissemination")]
    BroadcastTimeout,

    #[error("node is leaving or shut down")]
    Closed,

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("unable to join any of {attempted} seeds: {}", failures.join("; "))]
    Join {
        attempted: usize,
        failures: Vec<String>,
    },
}
