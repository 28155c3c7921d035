//! Wire message types.
//!
//! Every datagram and stream frame starts with a one-byte message type;
//! bodies are postcard-encoded structs. The numeric values are wire contract
//! and must never be reordered.

use super::wire::WireError;
use crate::types::StateKind;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::net::IpAddr;

// =============================================================================
// MESSAGE TYPE REGISTRY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    AckResp = 2,
    Suspect = 3,
    Alive = 4,
    Dead = 5,
    PushPull = 6,
    Compound = 7,
    User = 8,
    Compress = 9,
    Encrypt = 10,
    NackResp = 11,
    HasCrc = 12,
    Err = 13,
    /// Deliberately high so a labeled packet can never be confused with a
    /// protocol message.
    HasLabel = 244,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Ping,
            1 => Self::IndirectPing,
            2 => Self::AckResp,
            3 => Self::Suspect,
            4 => Self::Alive,
            5 => Self::Dead,
            6 => Self::PushPull,
            7 => Self::Compound,
            8 => Self::User,
            9 => Self::Compress,
            10 => Self::Encrypt,
            11 => Self::NackResp,
            12 => Self::HasCrc,
            13 => Self::Err,
            244 => Self::HasLabel,
            _ => return None,
        })
    }
}

// =============================================================================
// MESSAGE BODIES
// =============================================================================

/// Direct liveness check. The source fields let the target reply to our
/// advertised endpoint rather than the datagram's envelope origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub seq_no: u32,
    /// Name of the intended target; a mismatch means a misdirected packet.
    pub node: String,
    pub source_addr: Option<IpAddr>,
    pub source_port: u16,
    pub source_node: String,
}

/// Ask an intermediary to ping `node` at `target`/`port` on our behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectPing {
    pub seq_no: u32,
    pub target: IpAddr,
    pub port: u16,
    pub node: String,
    /// Request a NackResp if the intermediary cannot reach the target, as a
    /// health signal for our own connectivity.
    pub nack: bool,
    pub source_addr: Option<IpAddr>,
    pub source_port: u16,
    pub source_node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResp {
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackResp {
    pub seq_no: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

/// Aliveness claim, minted (or re-minted on refutation) by the named node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u32,
    pub node: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    /// `[pmin, pmax, pcur, dmin, dmax, dcur]`.
    pub vsn: [u8; 6],
}

/// Death verdict. `node == from` marks a graceful leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPullHeader {
    pub nodes: u32,
    pub user_state_len: u32,
    pub join: bool,
}

/// One registry record in a push-pull exchange. Dead and Left records ride
/// along too: a rejoining node must see its own tombstone to refute it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub incarnation: u32,
    pub state: StateKind,
    pub meta: Vec<u8>,
    pub vsn: [u8; 6],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrResp {
    pub error: String,
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// `[type byte] + postcard(body)`.
pub fn encode<B: Serialize>(ty: MessageType, body: &B) -> Result<Vec<u8>, WireError> {
    let mut buf = vec![ty as u8];
    buf.extend(postcard::to_allocvec(body).map_err(WireError::Encode)?);
    Ok(buf)
}

/// Decode a body (the buffer excludes the already-consumed type byte).
pub fn decode<B: DeserializeOwned>(body: &[u8]) -> Result<B, WireError> {
    postcard::from_bytes(body).map_err(WireError::Decode)
}

/// Decode a body from the front of `buf`, returning the remainder. Used for
/// the sequential record layout of push-pull payloads.
pub fn decode_from<B: DeserializeOwned>(buf: &[u8]) -> Result<(B, &[u8]), WireError> {
    postcard::take_from_bytes(buf).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_byte_round_trip() {
        for b in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 244] {
            assert_eq!(MessageType::from_u8(b).unwrap() as u8, b);
        }
        assert!(MessageType::from_u8(14).is_none());
        assert!(MessageType::from_u8(200).is_none());
    }

    #[test]
    fn test_encode_prefixes_type_byte() {
        let ping = Ping {
            seq_no: 42,
            node: "target".into(),
            source_addr: Some("192.168.1.10".parse().unwrap()),
            source_port: 7946,
            source_node: "me".into(),
        };
        let buf = encode(MessageType::Ping, &ping).unwrap();
        assert_eq!(buf[0], MessageType::Ping as u8);

        let back: Ping = decode(&buf[1..]).unwrap();
        assert_eq!(back, ping);
    }

    #[test]
    fn test_every_body_round_trips() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();

        let ack = AckResp {
            seq_no: 7,
            payload: vec![1, 2, 3],
        };
        let buf = encode(MessageType::AckResp, &ack).unwrap();
        assert_eq!(decode::<AckResp>(&buf[1..]).unwrap(), ack);

        let nack = NackResp { seq_no: 7 };
        let buf = encode(MessageType::NackResp, &nack).unwrap();
        assert_eq!(decode::<NackResp>(&buf[1..]).unwrap(), nack);

        let sus = Suspect {
            incarnation: 9,
            node: "victim".into(),
            from: "accuser".into(),
        };
        let buf = encode(MessageType::Suspect, &sus).unwrap();
        assert_eq!(decode::<Suspect>(&buf[1..]).unwrap(), sus);

        let alive = Alive {
            incarnation: 3,
            node: "n".into(),
            addr,
            port: 9000,
            meta: b"meta".to_vec(),
            vsn: [1, 5, 5, 2, 5, 5],
        };
        let buf = encode(MessageType::Alive, &alive).unwrap();
        assert_eq!(decode::<Alive>(&buf[1..]).unwrap(), alive);

        let dead = Dead {
            incarnation: 4,
            node: "n".into(),
            from: "n".into(),
        };
        let buf = encode(MessageType::Dead, &dead).unwrap();
        assert_eq!(decode::<Dead>(&buf[1..]).unwrap(), dead);

        let ind = IndirectPing {
            seq_no: 1,
            target: addr,
            port: 9000,
            node: "n".into(),
            nack: true,
            source_addr: None,
            source_port: 8000,
            source_node: "s".into(),
        };
        let buf = encode(MessageType::IndirectPing, &ind).unwrap();
        assert_eq!(decode::<IndirectPing>(&buf[1..]).unwrap(), ind);
    }

    #[test]
    fn test_sequential_decode() {
        let a = PushPullHeader {
            nodes: 2,
            user_state_len: 0,
            join: true,
        };
        let b = PushNodeState {
            name: "n".into(),
            addr: "10.0.0.2".parse().unwrap(),
            port: 1,
            incarnation: 5,
            state: StateKind::Left,
            meta: Vec::new(),
            vsn: [1, 5, 5, 2, 5, 5],
        };
        let mut buf = postcard::to_allocvec(&a).unwrap();
        buf.extend(postcard::to_allocvec(&b).unwrap());

        let (ha, rest) = decode_from::<PushPullHeader>(&buf).unwrap();
        assert_eq!(ha, a);
        let (hb, rest) = decode_from::<PushNodeState>(rest).unwrap();
        assert_eq!(hb, b);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_truncated_body_fails() {
        let sus = Suspect {
            incarnation: 9,
            node: "victim".into(),
            from: "accuser".into(),
        };
        let buf = encode(MessageType::Suspect, &sus).unwrap();
        assert!(decode::<Suspect>(&buf[1..buf.len() - 2]).is_err());
    }
}
