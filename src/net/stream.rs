//! Stream protocol: framed TCP messages, the push-pull state exchange, the
//! TCP fallback ping, and reliable user messages.
//!
//! A stream carries the label bytes once (initiator to acceptor), then
//! length-prefixed frames. Each frame payload runs through the same
//! compression and encryption pipeline as a datagram.

use super::message::{self, MessageType};
use super::transport::Transport;
use super::wire::{self, WireError};
use crate::cluster::Membership;
use crate::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// `[len:u32 BE][payload]`.
pub(crate) async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
) -> Result<(), Error> {
    if payload.len() > wire::MAX_FRAME_SIZE {
        return Err(Error::Wire(WireError::FrameTooLarge(payload.len())));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, Error> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > wire::MAX_FRAME_SIZE {
        return Err(Error::Wire(WireError::FrameTooLarge(len)));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Consume the optional label header off the front of an accepted stream.
async fn read_stream_label<S: AsyncRead + Unpin>(
    stream: &mut BufReader<S>,
) -> Result<String, Error> {
    let first = stream.fill_buf().await?;
    if first.first() != Some(&(MessageType::HasLabel as u8)) {
        return Ok(String::new());
    }
    stream.consume(1);
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut label = vec![0u8; len[0] as usize];
    stream.read_exact(&mut label).await?;
    let label = String::from_utf8(label).map_err(|_| Error::Wire(WireError::LabelNotUtf8))?;
    if label.is_empty() {
        return Err(Error::Wire(WireError::Truncated));
    }
    Ok(label)
}

impl<T: Transport> Membership<T> {
    /// Apply compression and encryption to an outbound frame payload.
    pub(crate) fn outbound_frame(&self, msg: Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut msg = msg;
        if self.config.enable_compression {
            msg = wire::compress_payload(&msg)?;
        }
        if let Some(keyring) = &self.config.keyring
            && self.config.gossip_verify_outgoing
        {
            let sealed = crate::net::encrypted::encrypt_payload(
                self.encryption_version(),
                &keyring.primary_key(),
                &msg,
                self.config.label.as_bytes(),
            )?;
            let mut out = Vec::with_capacity(1 + sealed.len());
            out.push(MessageType::Encrypt as u8);
            out.extend_from_slice(&sealed);
            msg = out;
        }
        Ok(msg)
    }

    /// Undo encryption and compression on an inbound frame payload, leaving
    /// a buffer that starts with a protocol message type.
    pub(crate) fn inbound_frame(&self, frame: Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut buf = frame;
        if buf.first() == Some(&(MessageType::Encrypt as u8)) {
            let Some(keyring) = &self.config.keyring else {
                return Err(Error::Remote("remote sent encrypted traffic".into()));
            };
            buf = crate::net::encrypted::decrypt_payload(
                &keyring.keys(),
                &buf[1..],
                self.config.label.as_bytes(),
            )?;
        } else if self.config.encryption_enabled() && self.config.gossip_verify_incoming {
            return Err(Error::Remote("plaintext traffic rejected".into()));
        }
        if buf.first() == Some(&(MessageType::Compress as u8)) {
            buf = wire::decompress_payload(&buf[1..])?;
        }
        Ok(buf)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<T::Stream, Error> {
        let mut stream = self
            .transport
            .dial_timeout(addr, self.config.tcp_timeout)
            .await?;
        if !self.config.label.is_empty() {
            let header = wire::add_label_header(&[], &self.config.label)?;
            stream.write_all(&header).await?;
        }
        Ok(stream)
    }

    // =========================================================================
    // PUSH-PULL CLIENT
    // =========================================================================

    /// Full-state exchange with one peer; `join` marks a bootstrap exchange.
    pub(crate) async fn push_pull_node(
        &self,
        addr: SocketAddr,
        join: bool,
    ) -> Result<(), Error> {
        let exchange = async {
            let mut stream = self.dial(addr).await?;
            self.send_local_state(&mut stream, join).await?;

            let payload = self.inbound_frame(read_frame(&mut stream).await?)?;
            self.read_and_merge(&payload, join)
        };
        tokio::time::timeout(self.config.tcp_timeout * 2, exchange)
            .await
            .map_err(|_| Error::NoResponse)?
    }

    fn read_and_merge(&self, payload: &[u8], join: bool) -> Result<(), Error> {
        match payload.first().and_then(|b| MessageType::from_u8(*b)) {
            Some(MessageType::Err) => {
                let err: message::ErrResp = message::decode(&payload[1..])?;
                Err(Error::Remote(err.error))
            }
            Some(MessageType::PushPull) => {
                let (_, remote, user) = read_remote_state(&payload[1..])?;
                self.merge_remote_state(&remote, &user, join)
            }
            other => Err(Error::Wire(WireError::UnexpectedType(
                other.map(|t| t as u8).unwrap_or(0xff),
            ))),
        }
    }

    /// Serialize the whole registry (tombstones included) plus delegate user
    /// state into one push-pull frame.
    pub(crate) async fn send_local_state<S: AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        join: bool,
    ) -> Result<(), Error> {
        let states: Vec<message::PushNodeState> = {
            let reg = self.registry.lock().unwrap();
            reg.members
                .values()
                .map(|m| message::PushNodeState {
                    name: m.node.name.clone(),
                    addr: m.node.addr,
                    port: m.node.port,
                    incarnation: m.incarnation,
                    state: m.state,
                    meta: m.node.meta.clone(),
                    vsn: m.node.vsn,
                })
                .collect()
        };
        let user = self
            .config
            .delegate
            .as_ref()
            .map(|d| d.local_state(join))
            .unwrap_or_default();

        let header = message::PushPullHeader {
            nodes: states.len() as u32,
            user_state_len: user.len() as u32,
            join,
        };
        let mut buf = vec![MessageType::PushPull as u8];
        buf.extend(postcard::to_allocvec(&header).map_err(|e| Error::Wire(WireError::Encode(e)))?);
        for state in &states {
            buf.extend(
                postcard::to_allocvec(state).map_err(|e| Error::Wire(WireError::Encode(e)))?,
            );
        }
        buf.extend_from_slice(&user);

        let frame = self.outbound_frame(buf)?;
        write_frame(stream, &frame).await
    }

    /// Merge a remote snapshot, giving the merge delegate its veto first.
    pub(crate) fn merge_remote_state(
        &self,
        remote: &[message::PushNodeState],
        user: &[u8],
        join: bool,
    ) -> Result<(), Error> {
        if let Some(merge) = &self.config.merge {
            let nodes: Vec<crate::types::Node> = remote
                .iter()
                .map(|r| crate::types::Node {
                    name: r.name.clone(),
                    addr: r.addr,
                    port: r.port,
                    meta: r.meta.clone(),
                    state: r.state,
                    vsn: r.vsn,
                })
                .collect();
            merge
                .notify_merge(&nodes)
                .map_err(|e| Error::MergeCanceled(e.to_string()))?;
        }

        self.merge_state(remote);

        if !user.is_empty()
            && let Some(delegate) = &self.config.delegate
        {
            delegate.merge_remote_state(user, join);
        }
        Ok(())
    }

    // =========================================================================
    // SERVER SIDE
    // =========================================================================

    /// Serve one accepted stream: a push-pull exchange, a TCP ping, or a
    /// reliable user message.
    pub(crate) async fn handle_stream(self: Arc<Self>, stream: T::Stream, from: SocketAddr) {
        let deadline = self.config.tcp_timeout * 2;
        if let Err(e) = tokio::time::timeout(deadline, self.serve_stream(stream, from)).await {
            debug!("stream from {} timed out: {}", from, e);
        }
    }

    async fn serve_stream(&self, stream: T::Stream, from: SocketAddr) {
        let mut stream = BufReader::new(stream);

        let label = match read_stream_label(&mut stream).await {
            Ok(label) => label,
            Err(e) => {
                warn!("failed to read stream label from {}: {}", from, e);
                return;
            }
        };
        if let Err(e) = wire::check_label(
            &label,
            &self.config.label,
            self.config.skip_inbound_label_check,
        ) {
            warn!("rejecting stream from {}: {}", from, e);
            return;
        }

        let payload = match read_frame(&mut stream).await {
            Ok(frame) => match self.inbound_frame(frame) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("undecipherable stream from {}: {}", from, e);
                    return;
                }
            },
            Err(e) => {
                debug!("failed to read stream frame from {}: {}", from, e);
                return;
            }
        };

        match payload.first().and_then(|b| MessageType::from_u8(*b)) {
            Some(MessageType::PushPull) => {
                self.serve_push_pull(&mut stream, &payload[1..], from).await;
            }
            Some(MessageType::Ping) => {
                self.serve_tcp_ping(&mut stream, &payload[1..], from).await;
            }
            Some(MessageType::User) => {
                if let Some(delegate) = &self.config.delegate {
                    delegate.notify_msg(&payload[1..]);
                }
            }
            other => warn!(
                "unexpected stream message type {:?} from {}",
                other.map(|t| t as u8),
                from
            ),
        }
    }

    async fn serve_push_pull<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        body: &[u8],
        from: SocketAddr,
    ) {
        // Bound concurrent exchanges: each holds a full cluster snapshot.
        let Ok(_permit) = self.stream_sem.clone().try_acquire_owned() else {
            warn!("too many concurrent push-pull exchanges, rejecting {}", from);
            self.send_err_resp(stream, "push-pull concurrency limit reached")
                .await;
            return;
        };

        let (join, remote, user) = match read_remote_state(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("malformed push-pull from {}: {}", from, e);
                self.send_err_resp(stream, "malformed push-pull").await;
                return;
            }
        };

        if let Err(e) = self.merge_remote_state(&remote, &user, join) {
            warn!("push-pull merge with {} canceled: {}", from, e);
            self.send_err_resp(stream, &e.to_string()).await;
            return;
        }

        if let Err(e) = self.send_local_state(stream, join).await {
            warn!("failed to send local state to {}: {}", from, e);
        }
    }

    async fn serve_tcp_ping<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        body: &[u8],
        from: SocketAddr,
    ) {
        let ping: message::Ping = match message::decode(body) {
            Ok(ping) => ping,
            Err(e) => {
                warn!("malformed stream ping from {}: {}", from, e);
                return;
            }
        };
        if !ping.node.is_empty() && ping.node != self.config.name {
            warn!("got stream ping addressed to {} from {}", ping.node, from);
            return;
        }

        let payload = self
            .config
            .ping
            .as_ref()
            .map(|d| d.ack_payload())
            .unwrap_or_default();
        let ack = message::AckResp {
            seq_no: ping.seq_no,
            payload,
        };
        let reply = match message::encode(MessageType::AckResp, &ack)
            .map_err(Error::from)
            .and_then(|buf| self.outbound_frame(buf))
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("failed to encode stream ack: {}", e);
                return;
            }
        };
        if let Err(e) = write_frame(stream, &reply).await {
            debug!("failed to ack stream ping from {}: {}", from, e);
        }
    }

    async fn send_err_resp<S: AsyncWrite + Unpin>(&self, stream: &mut S, error: &str) {
        let resp = message::ErrResp {
            error: error.to_string(),
        };
        if let Ok(frame) = message::encode(MessageType::Err, &resp)
            .map_err(Error::from)
            .and_then(|buf| self.outbound_frame(buf))
        {
            let _ = write_frame(stream, &frame).await;
        }
    }

    // =========================================================================
    // TCP PING CLIENT
    // =========================================================================

    /// Fallback liveness check over a stream. Returns true on a matching ack.
    pub(crate) async fn tcp_ping(
        &self,
        addr: SocketAddr,
        ping: message::Ping,
        deadline: Duration,
    ) -> Result<bool, Error> {
        let seq = ping.seq_no;
        let attempt = async {
            let mut stream = self.dial(addr).await?;
            let buf = message::encode(MessageType::Ping, &ping)?;
            let frame = self.outbound_frame(buf)?;
            write_frame(&mut stream, &frame).await?;

            let payload = self.inbound_frame(read_frame(&mut stream).await?)?;
            match payload.first().and_then(|b| MessageType::from_u8(*b)) {
                Some(MessageType::AckResp) => {
                    let ack: message::AckResp = message::decode(&payload[1..])?;
                    Ok(ack.seq_no == seq)
                }
                other => Err(Error::Wire(WireError::UnexpectedType(
                    other.map(|t| t as u8).unwrap_or(0xff),
                ))),
            }
        };
        tokio::time::timeout(deadline, attempt)
            .await
            .map_err(|_| Error::NoResponse)?
    }

    // =========================================================================
    // RELIABLE USER MESSAGES
    // =========================================================================

    /// Deliver a user message over a dedicated stream.
    pub(crate) async fn send_user_stream(
        &self,
        addr: SocketAddr,
        msg: &[u8],
    ) -> Result<(), Error> {
        let mut stream = self.dial(addr).await?;
        let mut buf = Vec::with_capacity(1 + msg.len());
        buf.push(MessageType::User as u8);
        buf.extend_from_slice(msg);
        let frame = self.outbound_frame(buf)?;
        write_frame(&mut stream, &frame).await
    }
}

/// Parse `[header][states...][user bytes]` (the PushPull type byte is
/// already consumed).
fn read_remote_state(
    body: &[u8],
) -> Result<(bool, Vec<message::PushNodeState>, Vec<u8>), Error> {
    let (header, mut rest) = message::decode_from::<message::PushPullHeader>(body)?;

    let mut states = Vec::with_capacity(header.nodes.min(4096) as usize);
    for _ in 0..header.nodes {
        let (state, tail) = message::decode_from::<message::PushNodeState>(rest)?;
        states.push(state);
        rest = tail;
    }

    if rest.len() < header.user_state_len as usize {
        return Err(Error::Wire(WireError::Truncated));
    }
    let user = rest[..header.user_state_len as usize].to_vec();

    Ok((header.join, states, user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateKind;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"frame-payload").await.unwrap();
        let got = read_frame(&mut server).await.unwrap();
        assert_eq!(got, b"frame-payload");
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge = (wire::MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &huge)
            .await
            .unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_label_parsing() {
        let (mut client, server) = tokio::io::duplex(256);
        let header = wire::add_label_header(&[], "team-a").unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();
        write_frame(&mut client, b"x").await.unwrap();

        let mut reader = BufReader::new(server);
        let label = read_stream_label(&mut reader).await.unwrap();
        assert_eq!(label, "team-a");
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_stream_without_label() {
        let (mut client, server) = tokio::io::duplex(256);
        write_frame(&mut client, b"payload").await.unwrap();

        let mut reader = BufReader::new(server);
        let label = read_stream_label(&mut reader).await.unwrap();
        assert_eq!(label, "");
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"payload");
    }

    #[test]
    fn test_read_remote_state_round_trip() {
        let header = message::PushPullHeader {
            nodes: 1,
            user_state_len: 3,
            join: true,
        };
        let state = message::PushNodeState {
            name: "n1".into(),
            addr: "10.0.0.9".parse().unwrap(),
            port: 7,
            incarnation: 11,
            state: StateKind::Suspect,
            meta: b"m".to_vec(),
            vsn: [1, 5, 5, 2, 5, 5],
        };
        let mut body = postcard::to_allocvec(&header).unwrap();
        body.extend(postcard::to_allocvec(&state).unwrap());
        body.extend_from_slice(b"usr");

        let (join, states, user) = read_remote_state(&body).unwrap();
        assert!(join);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0], state);
        assert_eq!(user, b"usr");
    }

    #[test]
    fn test_read_remote_state_truncated_user() {
        let header = message::PushPullHeader {
            nodes: 0,
            user_state_len: 10,
            join: false,
        };
        let body = postcard::to_allocvec(&header).unwrap();
        assert!(read_remote_state(&body).is_err());
    }
}
