//! Failure detection: round-robin probing with indirect fan-out and TCP
//! fallback, plus the gossip and push-pull schedulers.

use crate::cluster::Membership;
use crate::net::message::{self, MessageType};
use crate::net::transport::Transport;
use crate::net::wire;
use crate::types::{Member, PROTOCOL_VERSION_TCP_PING, StateKind};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

// =============================================================================
// ACK WAITERS
// =============================================================================

/// Resolution of a pending probe: a real ack, or the deadline marker
/// (`complete == false`).
pub(crate) struct AckMessage {
    pub complete: bool,
    pub payload: Vec<u8>,
    pub timestamp: Instant,
}

struct AckEntry {
    ack_tx: mpsc::Sender<AckMessage>,
    nack_tx: Option<mpsc::Sender<()>>,
    timer: JoinHandle<()>,
}

/// Sequence-number keyed waiter table. The first of ack/timeout wins and
/// removes the entry; nacks are informational and leave it in place (a real
/// ack may still arrive).
pub(crate) struct AckTable {
    entries: Arc<Mutex<HashMap<u32, AckEntry>>>,
}

impl AckTable {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn set_handler(
        &self,
        seq: u32,
        timeout: Duration,
        ack_tx: mpsc::Sender<AckMessage>,
        nack_tx: Option<mpsc::Sender<()>>,
    ) {
        let entries = Arc::clone(&self.entries);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let entry = entries.lock().unwrap().remove(&seq);
            if let Some(entry) = entry {
                let _ = entry.ack_tx.try_send(AckMessage {
                    complete: false,
                    payload: Vec::new(),
                    timestamp: Instant::now(),
                });
            }
        });
        self.entries.lock().unwrap().insert(
            seq,
            AckEntry {
                ack_tx,
                nack_tx,
                timer,
            },
        );
    }

    pub fn invoke_ack(&self, ack: message::AckResp, timestamp: Instant) {
        let entry = self.entries.lock().unwrap().remove(&ack.seq_no);
        if let Some(entry) = entry {
            entry.timer.abort();
            let _ = entry.ack_tx.try_send(AckMessage {
                complete: true,
                payload: ack.payload,
                timestamp,
            });
        }
    }

    pub fn invoke_nack(&self, nack: message::NackResp) {
        let entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&nack.seq_no)
            && let Some(tx) = &entry.nack_tx
        {
            let _ = tx.try_send(());
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            entry.timer.abort();
        }
    }
}

// =============================================================================
// SCHEDULERS
// =============================================================================

/// Anti-entropy slows down logarithmically past this cluster size.
const PUSH_PULL_SCALE_THRESHOLD: usize = 32;

pub(crate) fn push_pull_scale(interval: Duration, n: usize) -> Duration {
    if n <= PUSH_PULL_SCALE_THRESHOLD {
        return interval;
    }
    let multiplier = ((n as f64) / (PUSH_PULL_SCALE_THRESHOLD as f64)).log2().ceil() + 1.0;
    interval.mul_f64(multiplier)
}

impl<T: Transport> Membership<T> {
    pub(crate) async fn probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.probe_interval;
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.probe().await,
            }
        }
    }

    pub(crate) async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.gossip_interval;
        let stagger = interval.mul_f64(rand::thread_rng().r#gen::<f64>());
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(stagger) => {}
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.gossip().await,
            }
        }
    }

    pub(crate) async fn push_pull_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let base = self.config.push_pull_interval;
        let stagger = base.mul_f64(rand::thread_rng().r#gen::<f64>());
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(stagger) => {}
        }
        loop {
            let n = self.num_members.load(Ordering::SeqCst) as usize;
            let tick = push_pull_scale(base, n);
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(tick) => self.push_pull().await,
            }
        }
    }

    // =========================================================================
    // PROBING
    // =========================================================================

    /// One failure-detection round: probe the next eligible peer in the
    /// shuffled order, sweeping tombstones on wraparound.
    pub(crate) async fn probe(&self) {
        let mut checked = 0usize;
        loop {
            let (len, candidate) = {
                let mut reg = self.registry.lock().unwrap();
                let len = reg.order.len();
                if len == 0 {
                    return;
                }
                if reg.probe_index >= len {
                    reg.probe_index = 0;
                    (len, None)
                } else {
                    let name = reg.order[reg.probe_index].clone();
                    reg.probe_index += 1;
                    (len, reg.members.get(&name).cloned())
                }
            };

            match candidate {
                None => self.reset_nodes(),
                Some(member) => {
                    checked += 1;
                    if member.node.name != self.config.name && !member.dead_or_left() {
                        self.probe_node(member).await;
                        return;
                    }
                }
            }
            if checked >= len {
                return;
            }
        }
    }

    pub(crate) async fn probe_node(&self, target: Member) {
        let probe_interval = self.config.probe_interval;
        let probe_timeout = self.awareness.scale_timeout(self.config.probe_timeout);

        let seq = self.next_seq_no();
        let ping = message::Ping {
            seq_no: seq,
            node: target.node.name.clone(),
            source_addr: Some(self.advertise.ip()),
            source_port: self.advertise.port(),
            source_node: self.config.name.clone(),
        };

        let (ack_tx, mut ack_rx) = mpsc::channel(3);
        let (nack_tx, mut nack_rx) = mpsc::channel(self.config.indirect_checks.max(1));
        self.acks.set_handler(seq, probe_interval, ack_tx, Some(nack_tx));

        let sent_at = Instant::now();
        let buf = match message::encode(MessageType::Ping, &ping) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("failed to encode ping: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .send_msg_packet(target.node.address(), Some(&target.node.name), buf)
            .await
        {
            // A send failure is our problem, not evidence about the peer.
            warn!("failed to send ping to {}: {}", target.node, e);
            return;
        }

        // Race a TCP ping against the UDP path for peers that support it;
        // catches clusters where UDP is silently filtered.
        let mut fallback = None;
        let tcp_eligible = !self.config.disable_tcp_pings
            && target.node.pmax() >= PROTOCOL_VERSION_TCP_PING
            && !self
                .config
                .disable_tcp_pings_for
                .as_ref()
                .is_some_and(|f| f(&target.node.name));
        if tcp_eligible && let Some(m) = self.myself.upgrade() {
            let (tx, rx) = oneshot::channel();
            fallback = Some(rx);
            let addr = target.node.address();
            let ping = ping.clone();
            tokio::spawn(async move {
                let ok = match m.tcp_ping(addr, ping, probe_interval).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        debug!("tcp fallback ping to {} failed: {}", addr, e);
                        false
                    }
                };
                let _ = tx.send(ok);
            });
        }

        // Direct window.
        match tokio::time::timeout(probe_timeout, ack_rx.recv()).await {
            Ok(Some(ack)) if ack.complete => {
                self.awareness.apply_delta(-1);
                self.cancel_suspicion(&target.node.name);
                if let Some(ping_delegate) = &self.config.ping {
                    let rtt = ack.timestamp.saturating_duration_since(sent_at);
                    ping_delegate.notify_ping_complete(&target.node, rtt, &ack.payload);
                }
                return;
            }
            Ok(_) => {}
            Err(_) => debug!(
                "probe of {} timed out after {:?}, trying indirect",
                target.node.name, probe_timeout
            ),
        }

        // Indirect fan-out through up to `indirect_checks` alive peers.
        let peers = {
            let reg = self.registry.lock().unwrap();
            reg.k_random_members(self.config.indirect_checks, |m| {
                m.node.name == self.config.name
                    || m.node.name == target.node.name
                    || m.state != StateKind::Alive
            })
        };
        let expected_nacks = peers.len();
        let ind = message::IndirectPing {
            seq_no: seq,
            target: target.node.addr,
            port: target.node.port,
            node: target.node.name.clone(),
            nack: true,
            source_addr: Some(self.advertise.ip()),
            source_port: self.advertise.port(),
            source_node: self.config.name.clone(),
        };
        for peer in &peers {
            let buf = match message::encode(MessageType::IndirectPing, &ind) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!("failed to encode indirect ping: {}", e);
                    break;
                }
            };
            if let Err(e) = self
                .send_msg_packet(peer.node.address(), Some(&peer.node.name), buf)
                .await
            {
                warn!("failed to send indirect ping via {}: {}", peer.node, e);
            }
        }

        // Wait out the rest of the probe window for any ack (direct retry or
        // mirrored through an intermediary).
        let rest = probe_interval.saturating_sub(sent_at.elapsed());
        let late_ack = tokio::time::timeout(rest, async {
            while let Some(ack) = ack_rx.recv().await {
                if ack.complete {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        if late_ack {
            self.cancel_suspicion(&target.node.name);
            return;
        }

        if let Some(rx) = fallback {
            let remaining = probe_interval.saturating_sub(sent_at.elapsed());
            if let Ok(Ok(true)) = tokio::time::timeout(remaining, rx).await {
                warn!(
                    "reached {} over tcp but all udp probes failed; check udp routing and filters",
                    target.node.name
                );
                self.cancel_suspicion(&target.node.name);
                return;
            }
        }

        // Missing nacks mean our own outbound path is questionable too.
        let mut nacks = 0usize;
        while nack_rx.try_recv().is_ok() {
            nacks += 1;
        }
        let delta = if expected_nacks > 0 {
            expected_nacks.saturating_sub(nacks) as i32
        } else {
            1
        };
        self.awareness.apply_delta(delta);

        warn!(
            "no acks from {} within {:?}, marking suspect",
            target.node.name, probe_interval
        );
        let s = message::Suspect {
            incarnation: target.incarnation,
            node: target.node.name.clone(),
            from: self.config.name.clone(),
        };
        self.suspect_node(s);
    }

    fn cancel_suspicion(&self, name: &str) {
        let mut reg = self.registry.lock().unwrap();
        if let Some(timer) = reg.timers.remove(name) {
            timer.dispose();
        }
    }

    // =========================================================================
    // INBOUND PROBE TRAFFIC
    // =========================================================================

    pub(crate) async fn handle_ping(&self, p: message::Ping, from: SocketAddr) {
        if !p.node.is_empty() && p.node != self.config.name {
            warn!("got ping addressed to {} from {}", p.node, from);
            return;
        }
        if p.node.is_empty() && self.config.require_node_names {
            warn!("dropping nameless ping from {}", from);
            return;
        }

        let payload = self
            .config
            .ping
            .as_ref()
            .map(|d| d.ack_payload())
            .unwrap_or_default();
        let ack = message::AckResp {
            seq_no: p.seq_no,
            payload,
        };
        let dest = match p.source_addr {
            Some(ip) => SocketAddr::new(ip, p.source_port),
            None => from,
        };
        let name = (!p.source_node.is_empty()).then_some(p.source_node.as_str());
        match message::encode(MessageType::AckResp, &ack) {
            Ok(buf) => {
                if let Err(e) = self.send_msg_packet(dest, name, buf).await {
                    warn!("failed to ack ping from {}: {}", dest, e);
                }
            }
            Err(e) => warn!("failed to encode ack: {}", e),
        }
    }

    /// Probe a third node on someone else's behalf, mirroring the result.
    pub(crate) async fn handle_indirect_ping(
        &self,
        ind: message::IndirectPing,
        from: SocketAddr,
    ) {
        let origin = match ind.source_addr {
            Some(ip) => SocketAddr::new(ip, ind.source_port),
            None => from,
        };
        let origin_name = (!ind.source_node.is_empty()).then(|| ind.source_node.clone());

        let local_seq = self.next_seq_no();
        let ping = message::Ping {
            seq_no: local_seq,
            node: ind.node.clone(),
            source_addr: Some(self.advertise.ip()),
            source_port: self.advertise.port(),
            source_node: self.config.name.clone(),
        };

        let (ack_tx, mut ack_rx) = mpsc::channel(1);
        self.acks
            .set_handler(local_seq, self.config.probe_timeout, ack_tx, None);

        let Some(m) = self.myself.upgrade() else {
            return;
        };
        let forward_seq = ind.seq_no;
        let send_nack = ind.nack;
        tokio::spawn(async move {
            let ack = ack_rx.recv().await;
            match ack {
                Some(ack) if ack.complete => {
                    let resp = message::AckResp {
                        seq_no: forward_seq,
                        payload: ack.payload,
                    };
                    if let Ok(buf) = message::encode(MessageType::AckResp, &resp)
                        && let Err(e) = m.send_msg_packet(origin, origin_name.as_deref(), buf).await
                    {
                        warn!("failed to mirror ack to {}: {}", origin, e);
                    }
                }
                _ if send_nack => {
                    let resp = message::NackResp {
                        seq_no: forward_seq,
                    };
                    if let Ok(buf) = message::encode(MessageType::NackResp, &resp)
                        && let Err(e) = m.send_msg_packet(origin, origin_name.as_deref(), buf).await
                    {
                        warn!("failed to nack {}: {}", origin, e);
                    }
                }
                _ => {}
            }
        });

        let target = SocketAddr::new(ind.target, ind.port);
        match message::encode(MessageType::Ping, &ping) {
            Ok(buf) => {
                if let Err(e) = self.send_msg_packet(target, Some(&ind.node), buf).await {
                    warn!("failed to relay ping to {}: {}", target, e);
                }
            }
            Err(e) => warn!("failed to encode relayed ping: {}", e),
        }
    }

    // =========================================================================
    // GOSSIP
    // =========================================================================

    /// One gossip round: drain the broadcast queue once and fan the packet
    /// out to K random peers (including the recently dead, so they can learn
    /// of their own tombstone).
    pub(crate) async fn gossip(&self) {
        let dead_horizon = self.config.gossip_to_the_dead_time;
        let targets = {
            let reg = self.registry.lock().unwrap();
            reg.k_random_members(self.config.gossip_nodes, |m| {
                if m.node.name == self.config.name {
                    return true;
                }
                match m.state {
                    StateKind::Alive | StateKind::Suspect => false,
                    StateKind::Dead | StateKind::Left => m.state_change.elapsed() > dead_horizon,
                }
            })
        };
        if targets.is_empty() {
            return;
        }

        let avail = self
            .config
            .udp_buffer_size
            .saturating_sub(wire::COMPOUND_HEADER_OVERHEAD)
            .saturating_sub(wire::label_overhead(&self.config.label))
            .saturating_sub(self.encrypt_overhead());
        // One drain per tick: each queued item burns one transmit for the
        // whole K-peer fan-out, which is what the retransmit limit assumes.
        let msgs = self.get_gossip_broadcasts(wire::COMPOUND_OVERHEAD, avail);
        if msgs.is_empty() {
            return;
        }

        let packet = if msgs.len() == 1 {
            msgs.into_iter().next().unwrap()
        } else {
            match wire::make_compound(&msgs) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("failed to build compound gossip: {}", e);
                    return;
                }
            }
        };

        for target in targets {
            if let Err(e) = self
                .raw_send_packet(target.node.address(), Some(&target.node.name), &packet)
                .await
            {
                warn!("gossip to {} failed: {}", target.node, e);
            }
        }
    }

    // =========================================================================
    // PUSH-PULL
    // =========================================================================

    /// One anti-entropy round with a single random peer (any state).
    pub(crate) async fn push_pull(&self) {
        let target = {
            let reg = self.registry.lock().unwrap();
            reg.k_random_members(1, |m| m.node.name == self.config.name)
                .pop()
        };
        let Some(target) = target else {
            return;
        };
        if let Err(e) = self.push_pull_node(target.node.address(), false).await {
            warn!("push-pull with {} failed: {}", target.node, e);
        }
    }
}
