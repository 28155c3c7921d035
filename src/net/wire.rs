//! Packet and stream framing: label prefix, CRC wrapper, compound packing,
//! compression wrapper. Layout bytes here are wire contract.

use super::message::MessageType;
use crate::config::LABEL_MAX_SIZE;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Read, Write};

/// Per-fragment overhead inside a compound message (u16 length).
pub const COMPOUND_OVERHEAD: usize = 2;

/// `[Compound][count:u8]` leading a compound message.
pub const COMPOUND_HEADER_OVERHEAD: usize = 2;

/// Upper bound for a single stream frame; bounds allocations when reading
/// a hostile peer's length prefix. Push-pull states dominate frame sizes.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Hard cap on fragments in one compound message (count rides in a u8).
pub const MAX_COMPOUND_MESSAGES: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message encode failed: {0}")]
    Encode(postcard::Error),

    #[error("message decode failed: {0}")]
    Decode(postcard::Error),

    #[error("truncated message")]
    Truncated,

    #[error("unexpected message type {0}")]
    UnexpectedType(u8),

    #[error("label exceeds {LABEL_MAX_SIZE} bytes")]
    LabelTooLong,

    #[error("label is not valid utf-8")]
    LabelNotUtf8,

    #[error("remote label {remote:?} does not match local {local:?}")]
    LabelMismatch { remote: String, local: String },

    #[error("crc mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("too many fragments for one compound message")]
    TooManyFragments,

    #[error("compression codec error: {0}")]
    Compression(std::io::Error),
}

// =============================================================================
// LABEL PREFIX
// =============================================================================

/// Prefix `packet` with `[HasLabel][len:u8][label]`. Empty labels are a
/// caller bug; packets without a label skip the header entirely.
pub fn add_label_header(packet: &[u8], label: &str) -> Result<Vec<u8>, WireError> {
    debug_assert!(!label.is_empty());
    if label.len() > LABEL_MAX_SIZE {
        return Err(WireError::LabelTooLong);
    }
    let mut out = Vec::with_capacity(2 + label.len() + packet.len());
    out.push(MessageType::HasLabel as u8);
    out.push(label.len() as u8);
    out.extend_from_slice(label.as_bytes());
    out.extend_from_slice(packet);
    Ok(out)
}

/// Split an optional label header off the front of `buf`, returning
/// `(payload, label)` with an empty label when none was present.
pub fn remove_label_header(buf: &[u8]) -> Result<(&[u8], &str), WireError> {
    if buf.first() != Some(&(MessageType::HasLabel as u8)) {
        return Ok((buf, ""));
    }
    if buf.len() < 2 {
        return Err(WireError::Truncated);
    }
    let len = buf[1] as usize;
    if buf.len() < 2 + len {
        return Err(WireError::Truncated);
    }
    let label = std::str::from_utf8(&buf[2..2 + len]).map_err(|_| WireError::LabelNotUtf8)?;
    if label.is_empty() {
        return Err(WireError::Truncated);
    }
    Ok((&buf[2 + len..], label))
}

/// Enforce the label policy on an inbound packet or stream.
pub fn check_label(remote: &str, local: &str, skip_check: bool) -> Result<(), WireError> {
    if skip_check {
        // With checking disabled an unexpectedly present label still means a
        // misconfigured sender.
        if remote.is_empty() {
            return Ok(());
        }
        return Err(WireError::LabelMismatch {
            remote: remote.into(),
            local: local.into(),
        });
    }
    if remote == local {
        Ok(())
    } else {
        Err(WireError::LabelMismatch {
            remote: remote.into(),
            local: local.into(),
        })
    }
}

/// Wire bytes a label header adds to each packet and stream.
pub fn label_overhead(label: &str) -> usize {
    if label.is_empty() { 0 } else { 2 + label.len() }
}

// =============================================================================
// CRC WRAPPER
// =============================================================================

/// `[HasCrc][crc32:u32 BE][inner]`; the checksum covers `inner` only.
pub fn wrap_crc(inner: &[u8]) -> Vec<u8> {
    let crc = crc32fast::hash(inner);
    let mut out = Vec::with_capacity(5 + inner.len());
    out.push(MessageType::HasCrc as u8);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(inner);
    out
}

/// Verify and strip a `[HasCrc]` wrapper. The caller has already consumed
/// the type byte; `buf` starts at the checksum.
pub fn unwrap_crc(buf: &[u8]) -> Result<&[u8], WireError> {
    if buf.len() < 4 {
        return Err(WireError::Truncated);
    }
    let expected = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let inner = &buf[4..];
    let actual = crc32fast::hash(inner);
    if expected != actual {
        return Err(WireError::CrcMismatch { expected, actual });
    }
    Ok(inner)
}

// =============================================================================
// COMPOUND MESSAGES
// =============================================================================

/// Pack messages as `[Compound][n:u8][len:u16 BE]*n [bodies]`.
pub fn make_compound(msgs: &[Vec<u8>]) -> Result<Vec<u8>, WireError> {
    if msgs.len() > MAX_COMPOUND_MESSAGES {
        return Err(WireError::TooManyFragments);
    }
    let total: usize = msgs.iter().map(|m| m.len()).sum();
    let mut out = Vec::with_capacity(COMPOUND_HEADER_OVERHEAD + msgs.len() * 2 + total);
    out.push(MessageType::Compound as u8);
    out.push(msgs.len() as u8);
    for m in msgs {
        out.extend_from_slice(&(m.len() as u16).to_be_bytes());
    }
    for m in msgs {
        out.extend_from_slice(m);
    }
    Ok(out)
}

/// Split a compound body (type byte already consumed). Returns the number of
/// fragments lost to truncation alongside the intact ones.
pub fn split_compound(buf: &[u8]) -> Result<(usize, Vec<&[u8]>), WireError> {
    let Some((&count, rest)) = buf.split_first() else {
        return Err(WireError::Truncated);
    };
    let count = count as usize;
    if rest.len() < count * 2 {
        return Err(WireError::Truncated);
    }
    let (lengths, mut body) = rest.split_at(count * 2);

    let mut parts = Vec::with_capacity(count);
    for chunk in lengths.chunks_exact(2) {
        let len = u16::from_be_bytes([chunk[0], chunk[1]]) as usize;
        if body.len() < len {
            break;
        }
        let (part, tail) = body.split_at(len);
        parts.push(part);
        body = tail;
    }
    Ok((count - parts.len(), parts))
}

// =============================================================================
// COMPRESSION WRAPPER
// =============================================================================

/// `[Compress][deflate bytes]`; the inflated bytes begin with a type byte.
pub fn compress_payload(inner: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut enc = DeflateEncoder::new(vec![MessageType::Compress as u8], Compression::default());
    enc.write_all(inner)
        .and_then(|_| enc.finish())
        .map_err(WireError::Compression)
}

/// Inflate a compression wrapper body (type byte already consumed).
pub fn decompress_payload(buf: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    let mut dec = DeflateDecoder::new(buf).take(MAX_FRAME_SIZE as u64 + 1);
    dec.read_to_end(&mut out).map_err(WireError::Compression)?;
    if out.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(out.len()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        let packet = b"\x00rest-of-packet";
        let labeled = add_label_header(packet, "prod-cluster").unwrap();
        assert_eq!(labeled[0], MessageType::HasLabel as u8);

        let (payload, label) = remove_label_header(&labeled).unwrap();
        assert_eq!(label, "prod-cluster");
        assert_eq!(payload, packet);
    }

    #[test]
    fn test_unlabeled_passthrough() {
        let packet = b"\x04body";
        let (payload, label) = remove_label_header(packet).unwrap();
        assert_eq!(label, "");
        assert_eq!(payload, packet);
    }

    #[test]
    fn test_label_too_long() {
        let label = "x".repeat(256);
        assert!(matches!(
            add_label_header(b"p", &label),
            Err(WireError::LabelTooLong)
        ));
    }

    #[test]
    fn test_label_policy() {
        assert!(check_label("a", "a", false).is_ok());
        assert!(check_label("a", "b", false).is_err());
        assert!(check_label("", "", false).is_ok());
        // Skip mode admits anything unlabeled but rejects a stray label.
        assert!(check_label("", "b", true).is_ok());
        assert!(check_label("a", "b", true).is_err());
    }

    #[test]
    fn test_label_overhead() {
        assert_eq!(label_overhead(""), 0);
        assert_eq!(label_overhead("abc"), 5);
    }

    #[test]
    fn test_crc_round_trip() {
        let inner = b"\x04some-alive-message";
        let wrapped = wrap_crc(inner);
        assert_eq!(wrapped[0], MessageType::HasCrc as u8);
        assert_eq!(unwrap_crc(&wrapped[1..]).unwrap(), inner);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let mut wrapped = wrap_crc(b"\x04payload");
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xff;
        assert!(matches!(
            unwrap_crc(&wrapped[1..]),
            Err(WireError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_compound_round_trip() {
        let msgs = vec![b"first".to_vec(), b"second-longer".to_vec(), b"3".to_vec()];
        let packed = make_compound(&msgs).unwrap();
        assert_eq!(packed[0], MessageType::Compound as u8);

        let (truncated, parts) = split_compound(&packed[1..]).unwrap();
        assert_eq!(truncated, 0);
        assert_eq!(parts.len(), 3);
        for (part, msg) in parts.iter().zip(&msgs) {
            assert_eq!(part, &msg.as_slice());
        }
    }

    #[test]
    fn test_compound_reports_truncation() {
        let msgs = vec![b"first".to_vec(), b"second".to_vec()];
        let packed = make_compound(&msgs).unwrap();

        // Chop the last body short: one intact fragment, one lost.
        let short = &packed[1..packed.len() - 3];
        let (truncated, parts) = split_compound(short).unwrap();
        assert_eq!(truncated, 1);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0], b"first");
    }

    #[test]
    fn test_compress_round_trip() {
        let inner: Vec<u8> = std::iter::once(4u8)
            .chain(std::iter::repeat(b'z').take(4000))
            .collect();
        let packed = compress_payload(&inner).unwrap();
        assert_eq!(packed[0], MessageType::Compress as u8);
        assert!(packed.len() < inner.len());

        assert_eq!(decompress_payload(&packed[1..]).unwrap(), inner);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress_payload(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
