pub mod awareness;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod delegate;
pub mod error;
pub mod net;
pub mod probe;
pub mod state;
pub mod suspicion;
pub mod types;

pub use broadcast::{Broadcast, TransmitLimitedQueue, retransmit_limit};
pub use cluster::Membership;
pub use config::{Config, parse_cidrs};
pub use delegate::{
    AliveDelegate, ChannelEvents, ConflictDelegate, Delegate, EventDelegate, MergeDelegate,
    PingDelegate,
};
pub use error::Error;
pub use net::{Keyring, NetTransport, Packet, Transport};
pub use types::{Event, Node, StateKind};
