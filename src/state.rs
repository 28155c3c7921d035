//! Node registry and the membership state machine.
//!
//! Every state transition is linearized by the registry mutex. Handlers are
//! synchronous and perform no I/O while holding it; the only side effects are
//! registry mutation, delegate callbacks, and enqueued broadcasts.

use crate::broadcast::Broadcast;
use crate::cluster::Membership;
use crate::config::{DELEGATE_PROTOCOL_MAX, DELEGATE_PROTOCOL_MIN};
use crate::error::Error;
use crate::net::message::{self, MessageType};
use crate::net::transport::Transport;
use crate::suspicion::{Suspicion, suspicion_timeout};
use crate::types::{
    META_MAX_SIZE, Member, Node, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN, StateKind,
};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// REGISTRY
// =============================================================================

/// Authoritative peer table plus the shuffled list used for round-robin
/// probing. The registry exclusively owns all member records and their
/// suspicion timers.
pub(crate) struct Registry {
    pub members: HashMap<String, Member>,
    /// Every known name, in shuffled order. Newcomers land at a uniformly
    /// random position so probe order decorrelates across the cluster.
    pub order: Vec<String>,
    pub timers: HashMap<String, Suspicion>,
    pub probe_index: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            order: Vec::new(),
            timers: HashMap::new(),
            probe_index: 0,
        }
    }

    /// Append then swap with a uniformly random slot: O(1) online shuffle.
    pub fn insert_shuffled(&mut self, name: String) {
        self.order.push(name);
        let n = self.order.len();
        let idx = rand::thread_rng().gen_range(0..n);
        self.order.swap(idx, n - 1);
    }

    /// Up to `k` distinct members drawn at random, rejecting those `skip`
    /// returns true for. Scans at most `3n` candidates.
    pub fn k_random_members(&self, k: usize, skip: impl Fn(&Member) -> bool) -> Vec<Member> {
        let n = self.order.len();
        let mut rng = rand::thread_rng();
        let mut out: Vec<Member> = Vec::with_capacity(k);
        for _ in 0..3 * n {
            if out.len() >= k {
                break;
            }
            let name = &self.order[rng.gen_range(0..n)];
            let Some(m) = self.members.get(name) else {
                continue;
            };
            if skip(m) || out.iter().any(|picked| picked.node.name == m.node.name) {
                continue;
            }
            out.push(m.clone());
        }
        out
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

impl<T: Transport> Membership<T> {
    pub(crate) fn next_seq_no(&self) -> u32 {
        self.seq_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn next_incarnation(&self) -> u32 {
        self.incarnation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn skip_incarnation(&self, offset: u32) -> u32 {
        self.incarnation.fetch_add(offset, Ordering::SeqCst) + offset
    }

    pub(crate) fn has_left(&self) -> bool {
        self.leaving.load(Ordering::SeqCst)
    }

    pub(crate) fn has_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// The six-byte version vector we advertise.
    pub(crate) fn node_vsn(&self) -> [u8; 6] {
        [
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_MAX,
            self.config.protocol_version,
            DELEGATE_PROTOCOL_MIN,
            DELEGATE_PROTOCOL_MAX,
            self.config.delegate_protocol_version,
        ]
    }

    pub(crate) fn queue_state_broadcast(
        &self,
        node: &str,
        kind: StateKind,
        incarnation: u32,
        msg: Vec<u8>,
        notify: Option<oneshot::Sender<()>>,
    ) {
        self.queue.queue_broadcast(Broadcast::Membership {
            node: node.to_string(),
            kind,
            incarnation,
            msg,
            notify,
        });
    }

    fn notify_join(&self, node: &Node) {
        if let Some(events) = &self.config.events {
            events.notify_join(node);
        }
    }

    fn notify_leave(&self, node: &Node) {
        if let Some(events) = &self.config.events {
            events.notify_leave(node);
        }
    }

    fn notify_update(&self, node: &Node) {
        if let Some(events) = &self.config.events {
            events.notify_update(node);
        }
    }

    /// Announce ourselves. `Membership::create` runs this as the bootstrap
    /// Alive; `update_node` reuses it for metadata changes.
    pub(crate) fn set_alive(
        &self,
        notify: Option<oneshot::Sender<()>>,
    ) -> Result<(), Error> {
        let meta = match &self.config.delegate {
            Some(delegate) => {
                let meta = delegate.node_meta(META_MAX_SIZE);
                if meta.len() > META_MAX_SIZE {
                    return Err(Error::MetaTooLarge(META_MAX_SIZE));
                }
                meta
            }
            None => Vec::new(),
        };
        let a = message::Alive {
            incarnation: self.next_incarnation(),
            node: self.config.name.clone(),
            addr: self.advertise.ip(),
            port: self.advertise.port(),
            meta,
            vsn: self.node_vsn(),
        };
        self.alive_node(a, true, notify);
        Ok(())
    }

    /// Process an Alive claim (from gossip, push-pull, or ourselves).
    pub(crate) fn alive_node(
        &self,
        a: message::Alive,
        bootstrap: bool,
        notify: Option<oneshot::Sender<()>>,
    ) {
        let is_local = a.node == self.config.name;

        // A node that has announced its departure must not resurrect itself
        // through a stale rebroadcast.
        if (self.has_left() || self.has_shutdown()) && is_local && !bootstrap {
            return;
        }

        if a.vsn[0] == 0 || a.vsn[0] > a.vsn[1] {
            warn!(
                "ignoring alive for {}: invalid protocol version vector {:?}",
                a.node, a.vsn
            );
            return;
        }

        let mut reg = self.registry.lock().unwrap();

        let is_new = !reg.members.contains_key(&a.node);
        if is_new {
            if let Err(e) = self.config.ip_allowed(a.addr) {
                warn!("rejecting alive for {}: {}", a.node, e);
                return;
            }
            // Created in the Dead state so the transition below fires the
            // usual join path.
            let member = Member {
                node: Node {
                    name: a.node.clone(),
                    addr: a.addr,
                    port: a.port,
                    meta: a.meta.clone(),
                    state: StateKind::Dead,
                    vsn: a.vsn,
                },
                incarnation: 0,
                state: StateKind::Dead,
                state_change: Instant::now(),
            };
            reg.members.insert(a.node.clone(), member);
            reg.insert_shuffled(a.node.clone());
        }

        if !is_local && let Some(filter) = &self.config.alive {
            let candidate = Node {
                name: a.node.clone(),
                addr: a.addr,
                port: a.port,
                meta: a.meta.clone(),
                state: StateKind::Alive,
                vsn: a.vsn,
            };
            if let Err(e) = filter.notify_alive(&candidate) {
                warn!("ignoring alive for {}: {}", a.node, e);
                return;
            }
        }

        let Registry {
            members, timers, ..
        } = &mut *reg;
        let member = members.get_mut(&a.node).expect("record exists");

        // A known name advertising a different endpoint is either a node
        // that moved or an identity conflict.
        let mut updates_node = false;
        if member.node.addr != a.addr || member.node.port != a.port {
            let can_reclaim = !self.config.dead_node_reclaim_time.is_zero()
                && member.state_change.elapsed() >= self.config.dead_node_reclaim_time;
            if member.state == StateKind::Left
                || (member.state == StateKind::Dead && can_reclaim)
                || a.incarnation > member.incarnation
            {
                info!(
                    "updating address for {}: {}:{} -> {}:{}",
                    a.node, member.node.addr, member.node.port, a.addr, a.port
                );
                updates_node = true;
            } else {
                warn!(
                    "conflicting address for {} (ours {}:{}, theirs {}:{})",
                    a.node, member.node.addr, member.node.port, a.addr, a.port
                );
                if let Some(conflict) = &self.config.conflict {
                    let other = Node {
                        name: a.node.clone(),
                        addr: a.addr,
                        port: a.port,
                        meta: a.meta.clone(),
                        state: StateKind::Alive,
                        vsn: a.vsn,
                    };
                    conflict.notify_conflict(&member.node, &other);
                }
                return;
            }
        }

        // Incarnation precedence: strictly older knowledge is discarded and
        // equal knowledge only matters for new, local, or relocating records.
        // A departed node is the exception: it may be reclaimed by any
        // incarnation, since its counter restarted.
        let rejoin = member.state == StateKind::Left;
        if is_local {
            if a.incarnation < member.incarnation {
                return;
            }
        } else if !updates_node && !rejoin {
            if a.incarnation < member.incarnation {
                return;
            }
            if a.incarnation == member.incarnation && !is_new {
                return;
            }
        }

        if let Some(timer) = timers.remove(&a.node) {
            timer.dispose();
        }

        let old_state = member.state;
        let old_meta = member.node.meta.clone();

        if is_local && !bootstrap {
            // An echo of exactly what we advertise needs no reaction; anything
            // else is somebody gossiping a stale identity for us.
            if a.incarnation == member.incarnation
                && a.meta == member.node.meta
                && a.vsn == member.node.vsn
            {
                return;
            }
            self.refute(member, a.incarnation);
            warn!(
                "refuting an alive message for {} (incarnation {})",
                a.node, a.incarnation
            );
        } else {
            match message::encode(MessageType::Alive, &a) {
                Ok(buf) => self.queue_state_broadcast(
                    &a.node,
                    StateKind::Alive,
                    a.incarnation,
                    buf,
                    notify,
                ),
                Err(e) => warn!("failed to encode alive for {}: {}", a.node, e),
            }

            member.incarnation = a.incarnation;
            member.node.meta = a.meta;
            member.node.addr = a.addr;
            member.node.port = a.port;
            member.node.vsn = a.vsn;
            if member.state != StateKind::Alive {
                member.state = StateKind::Alive;
                member.state_change = Instant::now();
            }
            member.node.state = member.state;

            // The live count moves on the Dead/Left <-> Alive edges only, so
            // it stays symmetric with the decrement on death.
            if old_state == StateKind::Dead || old_state == StateKind::Left {
                self.num_members.fetch_add(1, Ordering::SeqCst);
                self.notify_join(&member.node);
            } else if old_meta != member.node.meta {
                self.notify_update(&member.node);
            }
        }
    }

    /// Process a Suspect accusation.
    pub(crate) fn suspect_node(&self, s: message::Suspect) {
        let mut reg = self.registry.lock().unwrap();
        let Registry {
            members, timers, ..
        } = &mut *reg;

        let Some(member) = members.get_mut(&s.node) else {
            return;
        };
        if s.incarnation < member.incarnation {
            return;
        }

        // An accusation already under investigation: new accusers shorten
        // the verdict window and are worth re-gossiping.
        if let Some(timer) = timers.get(&s.node) {
            if timer.confirm(&s.from) {
                match message::encode(MessageType::Suspect, &s) {
                    Ok(buf) => self.queue_state_broadcast(
                        &s.node,
                        StateKind::Suspect,
                        s.incarnation,
                        buf,
                        None,
                    ),
                    Err(e) => warn!("failed to encode suspect for {}: {}", s.node, e),
                }
            }
            return;
        }

        if member.state != StateKind::Alive {
            return;
        }

        if s.node == self.config.name {
            warn!("refuting suspect message from {}", s.from);
            self.refute(member, s.incarnation);
            return;
        }

        match message::encode(MessageType::Suspect, &s) {
            Ok(buf) => {
                self.queue_state_broadcast(&s.node, StateKind::Suspect, s.incarnation, buf, None)
            }
            Err(e) => warn!("failed to encode suspect for {}: {}", s.node, e),
        }

        member.incarnation = s.incarnation;
        member.state = StateKind::Suspect;
        member.node.state = StateKind::Suspect;
        let changed_at = Instant::now();
        member.state_change = changed_at;

        // Confirmation target scales with what the cluster can witness.
        let n = self.num_members.load(Ordering::SeqCst) as usize;
        let mut k = self.config.suspicion_mult.saturating_sub(2);
        if (n as i64) - 2 < k as i64 {
            k = 0;
        }
        let min = suspicion_timeout(self.config.suspicion_mult, n, self.config.probe_interval);
        let max = min * self.config.suspicion_max_timeout_mult;

        let weak = self.myself.clone();
        let node_name = s.node.clone();
        let fire = Box::new(move |confirmations: u32| {
            let Some(m) = weak.upgrade() else {
                return;
            };
            // Re-verify under the lock: the accusation may have been refuted
            // or superseded while the timer ran.
            let verdict = {
                let reg = m.registry.lock().unwrap();
                match reg.members.get(&node_name) {
                    Some(member)
                        if member.state == StateKind::Suspect
                            && member.state_change == changed_at =>
                    {
                        Some(message::Dead {
                            incarnation: member.incarnation,
                            node: node_name.clone(),
                            from: m.config.name.clone(),
                        })
                    }
                    _ => None,
                }
            };
            if let Some(d) = verdict {
                warn!(
                    "marking {} as failed, suspect timeout reached ({} peer confirmations)",
                    d.node, confirmations
                );
                m.dead_node(d, None);
            }
        });
        timers.insert(s.node.clone(), Suspicion::new(&s.from, k, min, max, fire));
    }

    /// Process a Dead verdict (or graceful leave when `node == from`).
    pub(crate) fn dead_node(&self, d: message::Dead, notify: Option<oneshot::Sender<()>>) {
        let mut reg = self.registry.lock().unwrap();
        let Registry {
            members, timers, ..
        } = &mut *reg;

        let Some(member) = members.get_mut(&d.node) else {
            return;
        };
        if d.incarnation < member.incarnation {
            return;
        }

        if let Some(timer) = timers.remove(&d.node) {
            timer.dispose();
        }

        let graceful = d.node == d.from;
        let was_dead_or_left = member.dead_or_left();
        if was_dead_or_left {
            // The one terminal-state transition still allowed: a graceful
            // leave racing with (and overriding) a failure verdict.
            let upgrades = member.state == StateKind::Dead && graceful;
            if !upgrades {
                return;
            }
        }

        if d.node == self.config.name && !self.has_left() {
            // Somebody declared us dead while we are demonstrably running.
            warn!("refuting dead message from {}", d.from);
            self.refute(member, d.incarnation);
            return;
        }

        match message::encode(MessageType::Dead, &d) {
            Ok(buf) => {
                self.queue_state_broadcast(&d.node, StateKind::Dead, d.incarnation, buf, notify)
            }
            Err(e) => warn!("failed to encode dead for {}: {}", d.node, e),
        }

        member.incarnation = d.incarnation;
        member.state = if graceful {
            StateKind::Left
        } else {
            StateKind::Dead
        };
        member.node.state = member.state;
        member.state_change = Instant::now();

        if !was_dead_or_left {
            self.num_members.fetch_sub(1, Ordering::SeqCst);
            debug!("member {} is now {}", d.node, member.state);
        }
        self.notify_leave(&member.node);
    }

    /// Rebut an accusation about ourselves with a strictly higher
    /// incarnation, and note the event against our own health.
    fn refute(&self, member: &mut Member, accused_inc: u32) {
        let mut inc = self.next_incarnation();
        if accused_inc >= inc {
            inc = self.skip_incarnation(accused_inc - inc + 1);
        }
        member.incarnation = inc;

        // Getting accused usually means we were too slow to answer probes.
        self.awareness.apply_delta(1);

        let a = message::Alive {
            incarnation: inc,
            node: member.node.name.clone(),
            addr: member.node.addr,
            port: member.node.port,
            meta: member.node.meta.clone(),
            vsn: member.node.vsn,
        };
        match message::encode(MessageType::Alive, &a) {
            Ok(buf) => self.queue_state_broadcast(&a.node, StateKind::Alive, inc, buf, None),
            Err(e) => warn!("failed to encode refutation: {}", e),
        }
    }

    /// Fold a remote full-state snapshot into the local view.
    pub(crate) fn merge_state(&self, remote: &[message::PushNodeState]) {
        for r in remote {
            // Our own tombstone in someone else's view: break it now rather
            // than waiting for the gossip echo.
            if r.name == self.config.name
                && matches!(r.state, StateKind::Dead | StateKind::Left)
                && !self.has_left()
            {
                if r.incarnation >= self.incarnation.load(Ordering::SeqCst) {
                    warn!("refuting a remote tombstone for ourselves");
                    let mut reg = self.registry.lock().unwrap();
                    if let Some(member) = reg.members.get_mut(&r.name) {
                        self.refute(member, r.incarnation);
                    }
                }
                continue;
            }

            match r.state {
                StateKind::Alive => {
                    let a = message::Alive {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        addr: r.addr,
                        port: r.port,
                        meta: r.meta.clone(),
                        vsn: r.vsn,
                    };
                    self.alive_node(a, false, None);
                }
                StateKind::Left => {
                    let d = message::Dead {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        from: r.name.clone(),
                    };
                    self.dead_node(d, None);
                }
                // Hearsay of death only earns a suspicion: the node gets its
                // chance to refute before we spread a verdict.
                StateKind::Dead | StateKind::Suspect => {
                    let s = message::Suspect {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        from: self.config.name.clone(),
                    };
                    self.suspect_node(s);
                }
            }
        }
    }

    /// Sweep tombstones older than the gossip-to-the-dead horizon and
    /// reshuffle the probe order. Runs when a probe round wraps around.
    pub(crate) fn reset_nodes(&self) {
        let horizon = self.config.gossip_to_the_dead_time;
        let mut reg = self.registry.lock().unwrap();
        let Registry {
            members,
            order,
            timers,
            ..
        } = &mut *reg;

        let stale: Vec<String> = members
            .values()
            .filter(|m| {
                m.node.name != self.config.name
                    && m.dead_or_left()
                    && m.state_change.elapsed() > horizon
            })
            .map(|m| m.node.name.clone())
            .collect();
        for name in &stale {
            debug!("reclaiming tombstone for {}", name);
            members.remove(name);
            if let Some(timer) = timers.remove(name) {
                timer.dispose();
            }
        }
        order.retain(|name| members.contains_key(name));
        order.shuffle(&mut rand::thread_rng());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::delegate::{ChannelEvents, ConflictDelegate};
    use crate::types::Event;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Engine with idle schedulers, so tests drive the state machine alone.
    fn quiet_config(name: &str) -> Config {
        let mut config = Config::default_lan(name);
        config.bind_addr = "127.0.0.1".parse().unwrap();
        config.bind_port = 0;
        config.probe_interval = Duration::from_secs(3600);
        config.probe_timeout = Duration::from_secs(1800);
        config.gossip_interval = Duration::from_secs(3600);
        config.push_pull_interval = Duration::ZERO;
        config
    }

    async fn quiet_node(name: &str) -> (Arc<Membership>, mpsc::Receiver<Event>) {
        let mut config = quiet_config(name);
        let (events, mut rx) = ChannelEvents::new(64);
        config.events = Some(Arc::new(events));
        let m = Membership::create(config).await.unwrap();
        // Drain our own bootstrap join.
        assert!(matches!(rx.recv().await, Some(Event::Join(n)) if n.name == name));
        (m, rx)
    }

    fn alive_msg(name: &str, incarnation: u32, port: u16) -> message::Alive {
        message::Alive {
            incarnation,
            node: name.into(),
            addr: "127.0.0.1".parse().unwrap(),
            port,
            meta: Vec::new(),
            vsn: [1, 5, 5, 2, 5, 5],
        }
    }

    fn member_state(m: &Membership, name: &str) -> Option<(StateKind, u32)> {
        let reg = m.registry.lock().unwrap();
        reg.members.get(name).map(|x| (x.state, x.incarnation))
    }

    fn has_timer(m: &Membership, name: &str) -> bool {
        m.registry.lock().unwrap().timers.contains_key(name)
    }

    #[tokio::test]
    async fn test_alive_creates_member_and_emits_join() {
        let (m, mut rx) = quiet_node("a").await;

        m.alive_node(alive_msg("b", 1, 9001), false, None);
        assert_eq!(member_state(&m, "b"), Some((StateKind::Alive, 1)));
        assert_eq!(m.num_members(), 2);
        assert!(matches!(rx.recv().await, Some(Event::Join(n)) if n.name == "b"));

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_older_incarnation_is_ignored() {
        let (m, _rx) = quiet_node("a").await;

        m.alive_node(alive_msg("b", 5, 9001), false, None);
        m.alive_node(alive_msg("b", 3, 9001), false, None);
        assert_eq!(member_state(&m, "b"), Some((StateKind::Alive, 5)));

        m.suspect_node(message::Suspect {
            incarnation: 4,
            node: "b".into(),
            from: "c".into(),
        });
        assert_eq!(member_state(&m, "b"), Some((StateKind::Alive, 5)));
        assert!(!has_timer(&m, "b"));

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_suspect_for_unknown_node_is_dropped() {
        let (m, _rx) = quiet_node("a").await;
        m.suspect_node(message::Suspect {
            incarnation: 1,
            node: "ghost".into(),
            from: "c".into(),
        });
        assert_eq!(member_state(&m, "ghost"), None);
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_equal_incarnation_precedence() {
        let (m, _rx) = quiet_node("a").await;

        m.alive_node(alive_msg("b", 2, 9001), false, None);
        m.suspect_node(message::Suspect {
            incarnation: 2,
            node: "b".into(),
            from: "a".into(),
        });
        assert_eq!(member_state(&m, "b"), Some((StateKind::Suspect, 2)));
        assert!(has_timer(&m, "b"));

        // Equal-incarnation alive does not clear an accusation.
        m.alive_node(alive_msg("b", 2, 9001), false, None);
        assert_eq!(member_state(&m, "b"), Some((StateKind::Suspect, 2)));

        // A strictly newer alive does.
        m.alive_node(alive_msg("b", 3, 9001), false, None);
        assert_eq!(member_state(&m, "b"), Some((StateKind::Alive, 3)));
        assert!(!has_timer(&m, "b"));

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_suspect_about_self_refutes() {
        let (m, _rx) = quiet_node("a").await;
        let (_, inc) = member_state(&m, "a").unwrap();
        assert_eq!(inc, 1);

        m.suspect_node(message::Suspect {
            incarnation: 1,
            node: "a".into(),
            from: "c".into(),
        });

        // Still alive, with a strictly higher incarnation and a bruised ego.
        assert_eq!(member_state(&m, "a"), Some((StateKind::Alive, 2)));
        assert_eq!(m.health_score(), 1);
        assert!(m.queue.num_queued() >= 1);

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_emits_leave_and_decrements() {
        let (m, mut rx) = quiet_node("a").await;
        m.alive_node(alive_msg("b", 1, 9001), false, None);
        let _ = rx.recv().await;
        assert_eq!(m.num_members(), 2);

        m.dead_node(
            message::Dead {
                incarnation: 1,
                node: "b".into(),
                from: "a".into(),
            },
            None,
        );
        assert_eq!(member_state(&m, "b"), Some((StateKind::Dead, 1)));
        assert_eq!(m.num_members(), 1);
        assert!(matches!(rx.recv().await, Some(Event::Leave(n)) if n.name == "b"));

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_leave_overrides_failure_verdict() {
        let (m, mut rx) = quiet_node("a").await;
        m.alive_node(alive_msg("b", 5, 9001), false, None);
        let _ = rx.recv().await;

        // Failure detection wins the race first.
        m.dead_node(
            message::Dead {
                incarnation: 5,
                node: "b".into(),
                from: "a".into(),
            },
            None,
        );
        assert_eq!(member_state(&m, "b"), Some((StateKind::Dead, 5)));
        let _ = rx.recv().await;

        // The graceful goodbye still upgrades Dead into Left.
        m.dead_node(
            message::Dead {
                incarnation: 5,
                node: "b".into(),
                from: "b".into(),
            },
            None,
        );
        assert_eq!(member_state(&m, "b"), Some((StateKind::Left, 5)));
        assert!(matches!(rx.recv().await, Some(Event::Leave(n)) if n.name == "b"));
        assert_eq!(m.num_members(), 1);

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejoin_after_left_with_lower_incarnation() {
        let (m, mut rx) = quiet_node("a").await;
        m.alive_node(alive_msg("b", 9, 9001), false, None);
        m.dead_node(
            message::Dead {
                incarnation: 9,
                node: "b".into(),
                from: "b".into(),
            },
            None,
        );
        assert_eq!(member_state(&m, "b"), Some((StateKind::Left, 9)));
        let _ = rx.recv().await;
        let _ = rx.recv().await;

        // Restarted node: fresh incarnation counter, new port.
        m.alive_node(alive_msg("b", 1, 9002), false, None);
        assert_eq!(member_state(&m, "b"), Some((StateKind::Alive, 1)));
        let reg = m.registry.lock().unwrap();
        assert_eq!(reg.members.get("b").unwrap().node.port, 9002);
        drop(reg);
        assert!(matches!(rx.recv().await, Some(Event::Join(n)) if n.name == "b"));

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_address_conflict_notifies_delegate() {
        struct Counting(AtomicUsize);
        impl ConflictDelegate for Counting {
            fn notify_conflict(&self, _existing: &Node, _other: &Node) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let conflicts = Arc::new(Counting(AtomicUsize::new(0)));
        let mut config = quiet_config("a");
        config.conflict = Some(conflicts.clone());
        let m = Membership::create(config).await.unwrap();

        m.alive_node(alive_msg("b", 5, 9001), false, None);
        // Same name, same incarnation, different endpoint: conflict.
        m.alive_node(alive_msg("b", 5, 9002), false, None);

        assert_eq!(conflicts.0.load(Ordering::SeqCst), 1);
        let reg = m.registry.lock().unwrap();
        assert_eq!(reg.members.get("b").unwrap().node.port, 9001);
        drop(reg);

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_prefers_suspicion_over_remote_death() {
        let (m, _rx) = quiet_node("a").await;
        m.alive_node(alive_msg("b", 3, 9001), false, None);

        m.merge_state(&[message::PushNodeState {
            name: "b".into(),
            addr: "127.0.0.1".parse().unwrap(),
            port: 9001,
            incarnation: 3,
            state: StateKind::Dead,
            meta: Vec::new(),
            vsn: [1, 5, 5, 2, 5, 5],
        }]);

        // Hearsay death became a suspicion with a running timer.
        assert_eq!(member_state(&m, "b"), Some((StateKind::Suspect, 3)));
        assert!(has_timer(&m, "b"));

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_refutes_remote_tombstone_about_self() {
        let (m, _rx) = quiet_node("a").await;
        assert_eq!(member_state(&m, "a"), Some((StateKind::Alive, 1)));

        m.merge_state(&[message::PushNodeState {
            name: "a".into(),
            addr: m.advertise.ip(),
            port: m.advertise.port(),
            incarnation: 4,
            state: StateKind::Dead,
            meta: Vec::new(),
            vsn: [1, 5, 5, 2, 5, 5],
        }]);

        let (state, inc) = member_state(&m, "a").unwrap();
        assert_eq!(state, StateKind::Alive);
        assert!(inc >= 5, "incarnation must jump past the tombstone");
        assert!(m.queue.num_queued() >= 1);

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_shuffled_insert_and_k_random() {
        let mut reg = Registry::new();
        for i in 0..20 {
            let name = format!("n{i}");
            reg.members.insert(
                name.clone(),
                Member {
                    node: Node {
                        name: name.clone(),
                        addr: "127.0.0.1".parse().unwrap(),
                        port: 9000 + i,
                        meta: Vec::new(),
                        state: StateKind::Alive,
                        vsn: [1, 5, 5, 2, 5, 5],
                    },
                    incarnation: 1,
                    state: StateKind::Alive,
                    state_change: Instant::now(),
                },
            );
            reg.insert_shuffled(name);
        }
        assert_eq!(reg.order.len(), 20);

        let picked = reg.k_random_members(5, |m| m.node.name == "n0");
        assert_eq!(picked.len(), 5);
        let mut names: Vec<_> = picked.iter().map(|m| m.node.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 5, "selections must be distinct");
        assert!(!names.contains(&"n0".to_string()));
    }
}
