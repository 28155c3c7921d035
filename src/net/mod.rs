//! Wire protocol and transport layer.

pub mod encrypted;
pub mod message;
pub mod stream;
pub mod transport;
pub mod wire;

// Re-exports
pub use encrypted::{CryptoError, Keyring, MAX_ENCRYPTION_VERSION};
pub use message::MessageType;
pub use transport::{NetTransport, Packet, Transport};
pub use wire::{COMPOUND_OVERHEAD, MAX_FRAME_SIZE, WireError};
