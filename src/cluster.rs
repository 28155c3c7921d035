//! The membership engine: lifecycle, packet ingest, outbound send pipeline,
//! and the user-facing API (join, leave, update, user messages).

use crate::awareness::Awareness;
use crate::broadcast::{Broadcast, TransmitLimitedQueue};
use crate::config::Config;
use crate::error::Error;
use crate::net::encrypted::{self, Keyring};
use crate::net::message::{self, MessageType};
use crate::net::transport::{NetTransport, Packet, Transport};
use crate::net::wire;
use crate::probe::AckTable;
use crate::state::Registry;
use crate::types::{Node, PROTOCOL_VERSION_CRC};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A running membership engine.
///
/// Created with [`Membership::create`], shared as an `Arc`, and fed by five
/// long-lived tasks: packet ingest, stream accept, probe tick, gossip tick,
/// and periodic push-pull. All state transitions funnel through the registry
/// mutex; the atomics below deliberately live outside it.
pub struct Membership<T: Transport = NetTransport> {
    pub(crate) config: Config,
    pub(crate) transport: T,
    pub(crate) advertise: SocketAddr,
    /// Self-handle for timer callbacks and spawned helpers.
    pub(crate) myself: Weak<Membership<T>>,

    pub(crate) seq_no: AtomicU32,
    pub(crate) incarnation: AtomicU32,
    /// Estimated cluster size (alive + suspect), shared with the broadcast
    /// queue for retransmit sizing.
    pub(crate) num_members: Arc<AtomicU32>,
    pub(crate) leaving: AtomicBool,
    pub(crate) shut_down: AtomicBool,
    pub(crate) shutdown_tx: watch::Sender<bool>,

    pub(crate) registry: Mutex<Registry>,
    pub(crate) queue: TransmitLimitedQueue,
    pub(crate) acks: AckTable,
    pub(crate) awareness: Awareness,
    /// Bounds concurrent server-side push-pull exchanges.
    pub(crate) stream_sem: Arc<Semaphore>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Membership<NetTransport> {
    /// Bind sockets and start a node with the given configuration.
    pub async fn create(config: Config) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let transport = NetTransport::bind(config.bind_addr, config.bind_port).await?;
        Self::with_transport(config, transport).await
    }
}

impl<T: Transport> Membership<T> {
    /// Start a node on an externally supplied transport.
    pub async fn with_transport(config: Config, transport: T) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let (ip, port) =
            transport.final_advertise_addr(config.advertise_addr, config.advertise_port)?;
        let advertise = SocketAddr::new(ip, port);

        let num_members = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, _) = watch::channel(false);

        let m = Arc::new_cyclic(|myself| Self {
            queue: TransmitLimitedQueue::new(config.retransmit_mult, Arc::clone(&num_members)),
            awareness: Awareness::new(config.awareness_max_multiplier),
            stream_sem: Arc::new(Semaphore::new(config.max_push_pull_concurrency)),
            seq_no: AtomicU32::new(0),
            incarnation: AtomicU32::new(0),
            num_members,
            leaving: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            shutdown_tx,
            registry: Mutex::new(Registry::new()),
            acks: AckTable::new(),
            tasks: Mutex::new(Vec::new()),
            myself: myself.clone(),
            advertise,
            transport,
            config,
        });

        m.set_alive(None)?;
        m.schedule();
        info!(
            "node {} started, advertising {}",
            m.config.name, m.advertise
        );
        Ok(m)
    }

    fn schedule(&self) {
        let me = self.myself.upgrade().expect("scheduled from a live handle");
        let mut tasks = self.tasks.lock().unwrap();

        if let Some(packets) = self.transport.packet_rx() {
            tasks.push(tokio::spawn(
                Arc::clone(&me).packet_loop(packets, self.shutdown_tx.subscribe()),
            ));
        }
        if let Some(streams) = self.transport.stream_rx() {
            tasks.push(tokio::spawn(
                Arc::clone(&me).stream_loop(streams, self.shutdown_tx.subscribe()),
            ));
        }
        tasks.push(tokio::spawn(
            Arc::clone(&me).probe_loop(self.shutdown_tx.subscribe()),
        ));
        if !self.config.gossip_interval.is_zero() && self.config.gossip_nodes > 0 {
            tasks.push(tokio::spawn(
                Arc::clone(&me).gossip_loop(self.shutdown_tx.subscribe()),
            ));
        }
        if !self.config.push_pull_interval.is_zero() {
            tasks.push(tokio::spawn(
                Arc::clone(&me).push_pull_loop(self.shutdown_tx.subscribe()),
            ));
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Contact seed nodes (`ip:port` or `name@ip:port`) and bootstrap from
    /// the first cluster state received. A single success suffices.
    pub async fn join(&self, seeds: &[String]) -> Result<usize, Error> {
        if self.has_shutdown() || self.has_left() {
            return Err(Error::Closed);
        }
        let mut successes = 0;
        let mut failures = Vec::new();
        for seed in seeds {
            match parse_seed(seed) {
                Ok(addr) => match self.push_pull_node(addr, true).await {
                    Ok(()) => {
                        debug!("joined via {}", seed);
                        successes += 1;
                    }
                    Err(e) => failures.push(format!("{seed}: {e}")),
                },
                Err(e) => failures.push(format!("{seed}: {e}")),
            }
        }
        if successes == 0 {
            return Err(Error::Join {
                attempted: seeds.len(),
                failures,
            });
        }
        Ok(successes)
    }

    /// Announce a graceful departure and wait up to `timeout` for the
    /// goodbye to be disseminated. Idempotent. The node keeps answering
    /// traffic until [`shutdown`](Self::shutdown) so peers can still pull
    /// the Left state.
    pub async fn leave(&self, timeout: Duration) -> Result<(), Error> {
        if self.has_shutdown() {
            return Err(Error::Closed);
        }
        if self.leaving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Pending verdicts no longer matter to a departing node.
        {
            let mut reg = self.registry.lock().unwrap();
            for (_, timer) in reg.timers.drain() {
                timer.dispose();
            }
        }

        let (incarnation, any_peers) = {
            let reg = self.registry.lock().unwrap();
            let me = reg
                .members
                .get(&self.config.name)
                .ok_or_else(|| Error::UnknownNode(self.config.name.clone()))?;
            let any_peers = reg
                .members
                .values()
                .any(|m| m.node.name != self.config.name && !m.dead_or_left());
            (me.incarnation, any_peers)
        };

        let d = message::Dead {
            incarnation,
            node: self.config.name.clone(),
            from: self.config.name.clone(),
        };
        let (tx, rx) = oneshot::channel();
        self.dead_node(d, Some(tx));

        if any_peers && !timeout.is_zero() {
            tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| Error::BroadcastTimeout)?
                .ok();
        }
        Ok(())
    }

    /// Re-read local metadata from the delegate and disseminate it with a
    /// fresh incarnation, waiting up to `timeout` for the broadcast.
    pub async fn update_node(&self, timeout: Duration) -> Result<(), Error> {
        if self.has_shutdown() || self.has_left() {
            return Err(Error::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.set_alive(Some(tx))?;

        let any_peers = {
            let reg = self.registry.lock().unwrap();
            reg.members
                .values()
                .any(|m| m.node.name != self.config.name && !m.dead_or_left())
        };
        if any_peers && !timeout.is_zero() {
            tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| Error::BroadcastTimeout)?
                .ok();
        }
        Ok(())
    }

    /// Stop all tasks and release sockets. The cluster will detect the
    /// silence as a failure unless [`leave`](Self::leave) ran first.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        self.transport.shutdown().await?;
        self.acks.clear();
        {
            let mut reg = self.registry.lock().unwrap();
            for (_, timer) in reg.timers.drain() {
                timer.dispose();
            }
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("node {} shut down", self.config.name);
        Ok(())
    }

    // =========================================================================
    // READ API
    // =========================================================================

    /// Snapshot of members not known to be dead or departed.
    pub fn members(&self) -> Vec<Node> {
        let reg = self.registry.lock().unwrap();
        reg.members
            .values()
            .filter(|m| !m.dead_or_left())
            .map(|m| m.node.clone())
            .collect()
    }

    /// Estimated number of live members (including ourselves).
    pub fn num_members(&self) -> usize {
        self.num_members.load(Ordering::SeqCst) as usize
    }

    /// Our own record as the cluster sees it.
    pub fn local_node(&self) -> Node {
        let reg = self.registry.lock().unwrap();
        reg.members
            .get(&self.config.name)
            .map(|m| m.node.clone())
            .expect("local record exists after create")
    }

    /// Current Lifeguard health score (0 = healthy).
    pub fn health_score(&self) -> u32 {
        self.awareness.health_score()
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    /// Installed encryption keys, if encryption is enabled.
    pub fn keyring(&self) -> Option<&Keyring> {
        self.config.keyring.as_ref()
    }

    /// Enqueue an application broadcast for piggybacked dissemination.
    pub fn queue_broadcast(&self, broadcast: Broadcast) {
        self.queue.queue_broadcast(broadcast);
    }

    // =========================================================================
    // USER MESSAGES
    // =========================================================================

    /// Fire-and-forget user message over UDP.
    pub async fn send_best_effort(&self, target: &Node, msg: &[u8]) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(1 + msg.len());
        buf.push(MessageType::User as u8);
        buf.extend_from_slice(msg);
        self.send_msg_packet(target.address(), Some(&target.name), buf)
            .await
    }

    /// User message over a dedicated framed stream.
    pub async fn send_reliable(&self, target: &Node, msg: &[u8]) -> Result<(), Error> {
        self.send_user_stream(target.address(), msg).await
    }

    // =========================================================================
    // OUTBOUND PIPELINE
    // =========================================================================

    pub(crate) fn encryption_version(&self) -> u8 {
        if self.config.protocol_version == 1 { 0 } else { 1 }
    }

    /// Bytes the encryption envelope adds to each packet.
    pub(crate) fn encrypt_overhead(&self) -> usize {
        if self.config.encryption_enabled() && self.config.gossip_verify_outgoing {
            1 + encrypted::encrypted_length(self.encryption_version(), 0)
        } else {
            0
        }
    }

    /// Queue drain plus delegate user broadcasts, each already carrying its
    /// type byte.
    pub(crate) fn get_gossip_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut msgs = self.queue.get_broadcasts(overhead, limit);
        if let Some(delegate) = &self.config.delegate {
            let used: usize = msgs.iter().map(|m| m.len() + overhead).sum();
            let remaining = limit.saturating_sub(used);
            if remaining > overhead {
                for user in delegate.broadcasts(overhead + 1, remaining) {
                    let mut buf = Vec::with_capacity(1 + user.len());
                    buf.push(MessageType::User as u8);
                    buf.extend_from_slice(&user);
                    msgs.push(buf);
                }
            }
        }
        msgs
    }

    /// Send a protocol message, filling spare datagram space with queued
    /// broadcasts. This piggybacking on every ack and ping is a large share
    /// of total dissemination.
    pub(crate) async fn send_msg_packet(
        &self,
        addr: SocketAddr,
        node_name: Option<&str>,
        msg: Vec<u8>,
    ) -> Result<(), Error> {
        let avail = self
            .config
            .udp_buffer_size
            .saturating_sub(msg.len())
            .saturating_sub(wire::COMPOUND_HEADER_OVERHEAD)
            .saturating_sub(wire::label_overhead(&self.config.label))
            .saturating_sub(self.encrypt_overhead());
        let extra = self.get_gossip_broadcasts(wire::COMPOUND_OVERHEAD, avail);

        if extra.is_empty() {
            return self.raw_send_packet(addr, node_name, &msg).await;
        }
        let mut all = Vec::with_capacity(1 + extra.len());
        all.push(msg);
        all.extend(extra);
        let compound = wire::make_compound(&all)?;
        self.raw_send_packet(addr, node_name, &compound).await
    }

    /// The bare datagram pipeline: compress, checksum, encrypt, label, send.
    pub(crate) async fn raw_send_packet(
        &self,
        addr: SocketAddr,
        node_name: Option<&str>,
        msg: &[u8],
    ) -> Result<(), Error> {
        let mut buf = msg.to_vec();

        if self.config.enable_compression {
            buf = wire::compress_payload(&buf)?;
        }

        // Checksum only for peers whose advertised protocol understands it.
        let crc_capable = node_name.is_some_and(|name| {
            let reg = self.registry.lock().unwrap();
            reg.members
                .get(name)
                .is_some_and(|m| m.node.pmax() >= PROTOCOL_VERSION_CRC)
        });
        if crc_capable {
            buf = wire::wrap_crc(&buf);
        }

        if let Some(keyring) = &self.config.keyring
            && self.config.gossip_verify_outgoing
        {
            let sealed = encrypted::encrypt_payload(
                self.encryption_version(),
                &keyring.primary_key(),
                &buf,
                self.config.label.as_bytes(),
            )?;
            let mut out = Vec::with_capacity(1 + sealed.len());
            out.push(MessageType::Encrypt as u8);
            out.extend_from_slice(&sealed);
            buf = out;
        }

        if !self.config.label.is_empty() {
            buf = wire::add_label_header(&buf, &self.config.label)?;
        }

        self.transport.write_to(&buf, addr).await?;
        Ok(())
    }

    // =========================================================================
    // INGEST
    // =========================================================================

    async fn packet_loop(
        self: Arc<Self>,
        mut packets: mpsc::Receiver<Packet>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                packet = packets.recv() => {
                    let Some(packet) = packet else { return };
                    self.ingest_packet(packet).await;
                }
            }
        }
    }

    async fn stream_loop(
        self: Arc<Self>,
        mut streams: mpsc::Receiver<(T::Stream, SocketAddr)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                accepted = streams.recv() => {
                    let Some((stream, from)) = accepted else { return };
                    tokio::spawn(Arc::clone(&self).handle_stream(stream, from));
                }
            }
        }
    }

    /// Unwrap one datagram (label, encryption, CRC) and dispatch it.
    async fn ingest_packet(&self, packet: Packet) {
        let Packet {
            buf,
            from,
            timestamp,
        } = packet;

        let (after_label, label) = match wire::remove_label_header(&buf) {
            Ok(v) => v,
            Err(e) => {
                warn!("bad packet from {}: {}", from, e);
                return;
            }
        };
        if let Err(e) = wire::check_label(
            label,
            &self.config.label,
            self.config.skip_inbound_label_check,
        ) {
            warn!("discarding packet from {}: {}", from, e);
            return;
        }

        let decrypted: Vec<u8>;
        let mut payload: &[u8] = after_label;
        if payload.first() == Some(&(MessageType::Encrypt as u8)) {
            let Some(keyring) = &self.config.keyring else {
                warn!("discarding encrypted packet from {}: no keys installed", from);
                return;
            };
            match encrypted::decrypt_payload(
                &keyring.keys(),
                &payload[1..],
                self.config.label.as_bytes(),
            ) {
                Ok(plain) => {
                    decrypted = plain;
                    payload = &decrypted;
                }
                Err(e) => {
                    warn!("failed to decrypt packet from {}: {}", from, e);
                    return;
                }
            }
        } else if self.config.encryption_enabled() && self.config.gossip_verify_incoming {
            warn!("discarding plaintext packet from {}", from);
            return;
        }

        let checked: &[u8];
        if payload.first() == Some(&(MessageType::HasCrc as u8)) {
            match wire::unwrap_crc(&payload[1..]) {
                Ok(inner) => checked = inner,
                Err(e) => {
                    warn!("discarding corrupt packet from {}: {}", from, e);
                    return;
                }
            }
        } else {
            checked = payload;
        }

        self.handle_command(checked, from, timestamp).await;
    }

    /// Dispatch a protocol message, expanding compound and compression
    /// wrappers iteratively (a hostile peer cannot recurse us).
    pub(crate) async fn handle_command(&self, buf: &[u8], from: SocketAddr, timestamp: Instant) {
        let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
        pending.push_back(buf.to_vec());
        // Wrapper expansion is bounded: a compound may not nest.
        let mut expansions = 0usize;

        while let Some(cur) = pending.pop_front() {
            let Some((&ty, body)) = cur.split_first() else {
                warn!("empty message from {}", from);
                continue;
            };
            match MessageType::from_u8(ty) {
                Some(MessageType::Compound) => {
                    expansions += 1;
                    if expansions > 2 {
                        warn!("ignoring nested compound from {}", from);
                        continue;
                    }
                    match wire::split_compound(body) {
                        Ok((truncated, parts)) => {
                            if truncated > 0 {
                                warn!(
                                    "compound from {} truncated, lost {} messages",
                                    from, truncated
                                );
                            }
                            for part in parts {
                                pending.push_back(part.to_vec());
                            }
                        }
                        Err(e) => warn!("bad compound from {}: {}", from, e),
                    }
                }
                Some(MessageType::Compress) => match wire::decompress_payload(body) {
                    Ok(inner) => pending.push_back(inner),
                    Err(e) => warn!("bad compressed message from {}: {}", from, e),
                },
                Some(MessageType::Ping) => match message::decode(body) {
                    Ok(ping) => self.handle_ping(ping, from).await,
                    Err(e) => warn!("malformed ping from {}: {}", from, e),
                },
                Some(MessageType::IndirectPing) => match message::decode(body) {
                    Ok(ind) => self.handle_indirect_ping(ind, from).await,
                    Err(e) => warn!("malformed indirect ping from {}: {}", from, e),
                },
                Some(MessageType::AckResp) => match message::decode(body) {
                    Ok(ack) => self.acks.invoke_ack(ack, timestamp),
                    Err(e) => warn!("malformed ack from {}: {}", from, e),
                },
                Some(MessageType::NackResp) => match message::decode(body) {
                    Ok(nack) => self.acks.invoke_nack(nack),
                    Err(e) => warn!("malformed nack from {}: {}", from, e),
                },
                Some(MessageType::Suspect) => match message::decode(body) {
                    Ok(s) => self.suspect_node(s),
                    Err(e) => warn!("malformed suspect from {}: {}", from, e),
                },
                Some(MessageType::Alive) => match message::decode(body) {
                    Ok(a) => self.alive_node(a, false, None),
                    Err(e) => warn!("malformed alive from {}: {}", from, e),
                },
                Some(MessageType::Dead) => match message::decode(body) {
                    Ok(d) => self.dead_node(d, None),
                    Err(e) => warn!("malformed dead from {}: {}", from, e),
                },
                Some(MessageType::User) => {
                    if let Some(delegate) = &self.config.delegate {
                        delegate.notify_msg(body);
                    }
                }
                Some(MessageType::Err) => match message::decode::<message::ErrResp>(body) {
                    Ok(err) => warn!("remote error from {}: {}", from, err.error),
                    Err(e) => warn!("malformed error response from {}: {}", from, e),
                },
                Some(other) => warn!(
                    "unexpected datagram message type {} from {}",
                    other as u8, from
                ),
                None => debug!("unknown message type {} from {}", ty, from),
            }
        }
    }
}

/// Parse `ip:port` or `name@ip:port`. DNS names are resolved by the caller;
/// the engine only speaks addresses.
fn parse_seed(seed: &str) -> Result<SocketAddr, Error> {
    let addr = seed.split_once('@').map(|(_, addr)| addr).unwrap_or(seed);
    addr.parse()
        .map_err(|e| Error::Config(format!("bad seed address {seed:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateKind;

    #[test]
    fn test_parse_seed() {
        assert_eq!(
            parse_seed("127.0.0.1:7946").unwrap(),
            "127.0.0.1:7946".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_seed("node-a@10.0.0.1:7000").unwrap(),
            "10.0.0.1:7000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_seed("just-a-name").is_err());
    }

    #[tokio::test]
    async fn test_create_registers_self_alive() {
        let mut config = Config::default_lan("solo");
        config.bind_addr = "127.0.0.1".parse().unwrap();
        config.bind_port = 0;
        let m = Membership::create(config).await.unwrap();

        let me = m.local_node();
        assert_eq!(me.name, "solo");
        assert_eq!(me.state, StateKind::Alive);
        assert_eq!(m.num_members(), 1);
        assert_eq!(m.members().len(), 1);
        assert_eq!(m.health_score(), 0);

        m.shutdown().await.unwrap();
        // Idempotent.
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_requires_reachable_seed() {
        let mut config = Config::default_local("lonely");
        config.bind_addr = "127.0.0.1".parse().unwrap();
        config.bind_port = 0;
        config.tcp_timeout = Duration::from_millis(200);
        let m = Membership::create(config).await.unwrap();

        let err = m.join(&["127.0.0.1:1".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Join { attempted: 1, .. }));

        m.shutdown().await.unwrap();
    }
}
