//! Transmit-limited broadcast queue.
//!
//! Pending gossip messages are retransmitted a bounded number of times
//! (scaling with the log of the cluster size) and drained in priority order:
//! fewest transmits first, then longest message, then newest id. Newer
//! knowledge about a node invalidates queued older knowledge.

use crate::types::StateKind;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;

/// A queued broadcast. The payload is a fully encoded wire message; the queue
/// never holds references into the registry.
pub enum Broadcast {
    /// Membership knowledge about `node`; participates in the invalidation
    /// lattice below.
    Membership {
        node: String,
        kind: StateKind,
        incarnation: u32,
        msg: Vec<u8>,
        notify: Option<oneshot::Sender<()>>,
    },
    /// Application broadcast with a stable name; a later broadcast with the
    /// same name replaces it.
    Named {
        name: String,
        msg: Vec<u8>,
        notify: Option<oneshot::Sender<()>>,
    },
    /// Application broadcast that neither invalidates nor is invalidated.
    Unique {
        msg: Vec<u8>,
        notify: Option<oneshot::Sender<()>>,
    },
}

impl Broadcast {
    pub fn message(&self) -> &[u8] {
        match self {
            Broadcast::Membership { msg, .. }
            | Broadcast::Named { msg, .. }
            | Broadcast::Unique { msg, .. } => msg,
        }
    }

    /// Does this broadcast supersede `other` in the queue?
    fn invalidates(&self, other: &Broadcast) -> bool {
        match (self, other) {
            (
                Broadcast::Membership {
                    node: a,
                    kind: ka,
                    incarnation: ia,
                    ..
                },
                Broadcast::Membership {
                    node: b,
                    kind: kb,
                    incarnation: ib,
                    ..
                },
            ) if a == b => match (ka, kb) {
                // Fresh aliveness obsoletes older aliveness and any queued
                // accusation about the node.
                (StateKind::Alive, StateKind::Alive) => ia >= ib,
                (StateKind::Alive, StateKind::Suspect | StateKind::Dead) => true,
                // A newer suspicion replaces an older one.
                (StateKind::Suspect, StateKind::Suspect) => ia >= ib,
                // A death verdict is terminal knowledge.
                (StateKind::Dead | StateKind::Left, _) => true,
                _ => false,
            },
            (Broadcast::Named { name: a, .. }, Broadcast::Named { name: b, .. }) => a == b,
            _ => false,
        }
    }

    /// Signal whoever is waiting on dissemination. Called exactly once, when
    /// the broadcast leaves the queue for good.
    fn finished(&mut self) {
        let notify = match self {
            Broadcast::Membership { notify, .. }
            | Broadcast::Named { notify, .. }
            | Broadcast::Unique { notify, .. } => notify,
        };
        if let Some(tx) = notify.take() {
            let _ = tx.send(());
        }
    }
}

/// Number of times a broadcast is sent before being dropped, for a cluster
/// of `n` nodes: `mult * ceil(log10(n + 1))`.
pub fn retransmit_limit(mult: usize, n: usize) -> usize {
    let scale = ((n as f64) + 1.0).log10().ceil() as usize;
    mult * scale
}

/// Drain-order key: ascending transmit count, then descending length, then
/// descending id (newest first).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Priority {
    transmits: usize,
    neg_len: i64,
    neg_id: i64,
}

impl Priority {
    fn new(transmits: usize, len: usize, id: u64) -> Self {
        Self {
            transmits,
            neg_len: -(len as i64),
            neg_id: -(id as i64),
        }
    }
}

struct Queued {
    transmits: usize,
    id: u64,
    broadcast: Broadcast,
}

struct Inner {
    next_id: u64,
    items: BTreeMap<Priority, Queued>,
}

pub struct TransmitLimitedQueue {
    retransmit_mult: usize,
    /// Live cluster-size estimate shared with the registry.
    num_nodes: Arc<AtomicU32>,
    inner: Mutex<Inner>,
}

impl TransmitLimitedQueue {
    pub fn new(retransmit_mult: usize, num_nodes: Arc<AtomicU32>) -> Self {
        Self {
            retransmit_mult,
            num_nodes,
            inner: Mutex::new(Inner {
                next_id: 0,
                items: BTreeMap::new(),
            }),
        }
    }

    /// Enqueue a broadcast, retiring anything it invalidates.
    pub fn queue_broadcast(&self, broadcast: Broadcast) {
        let mut inner = self.inner.lock().unwrap();

        if !matches!(broadcast, Broadcast::Unique { .. }) {
            let stale: Vec<Priority> = inner
                .items
                .iter()
                .filter(|(_, q)| broadcast.invalidates(&q.broadcast))
                .map(|(p, _)| *p)
                .collect();
            for key in stale {
                if let Some(mut q) = inner.items.remove(&key) {
                    q.broadcast.finished();
                }
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.insert(
            Priority::new(0, broadcast.message().len(), id),
            Queued {
                transmits: 0,
                id,
                broadcast,
            },
        );
    }

    /// Pull up to `limit` bytes of messages (each costing `len + overhead`)
    /// in priority order, bumping transmit counts and retiring items that hit
    /// the retransmit limit.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let transmit_limit = retransmit_limit(
            self.retransmit_mult,
            self.num_nodes.load(Ordering::SeqCst) as usize,
        );

        let mut picked: Vec<Priority> = Vec::new();
        let mut used = 0usize;
        for (key, q) in inner.items.iter() {
            let cost = q.broadcast.message().len() + overhead;
            if used + cost > limit {
                continue;
            }
            used += cost;
            picked.push(*key);
        }

        let mut out = Vec::with_capacity(picked.len());
        for key in picked {
            let Some(mut q) = inner.items.remove(&key) else {
                continue;
            };
            out.push(q.broadcast.message().to_vec());
            q.transmits += 1;
            if q.transmits >= transmit_limit {
                q.broadcast.finished();
            } else {
                inner
                    .items
                    .insert(Priority::new(q.transmits, q.broadcast.message().len(), q.id), q);
            }
        }
        out
    }

    /// Retire the lowest-priority items until at most `max` remain.
    pub fn prune(&self, max: usize) {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() > max {
            let Some(key) = inner.items.keys().next_back().copied() else {
                break;
            };
            if let Some(mut q) = inner.items.remove(&key) {
                q.broadcast.finished();
            }
        }
    }

    pub fn num_queued(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(n: u32) -> TransmitLimitedQueue {
        TransmitLimitedQueue::new(1, Arc::new(AtomicU32::new(n)))
    }

    fn alive(node: &str, incarnation: u32, msg: &[u8]) -> Broadcast {
        Broadcast::Membership {
            node: node.into(),
            kind: StateKind::Alive,
            incarnation,
            msg: msg.to_vec(),
            notify: None,
        }
    }

    fn dead(node: &str, incarnation: u32, msg: &[u8]) -> Broadcast {
        Broadcast::Membership {
            node: node.into(),
            kind: StateKind::Dead,
            incarnation,
            msg: msg.to_vec(),
            notify: None,
        }
    }

    #[test]
    fn test_retransmit_limit_formula() {
        assert_eq!(retransmit_limit(3, 0), 0);
        assert_eq!(retransmit_limit(3, 1), 3);
        assert_eq!(retransmit_limit(3, 9), 3);
        assert_eq!(retransmit_limit(3, 10), 6);
        assert_eq!(retransmit_limit(3, 99), 6);
        assert_eq!(retransmit_limit(3, 100), 9);
        assert_eq!(retransmit_limit(0, 50), 0);
    }

    #[test]
    fn test_drain_prefers_fewest_transmits_then_largest() {
        let q = queue(100); // limit = 3 transmits per item
        q.queue_broadcast(alive("a", 1, b"short"));
        q.queue_broadcast(alive("b", 1, b"a-much-longer-message"));

        let out = q.get_broadcasts(0, 1024);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], b"a-much-longer-message");
        assert_eq!(out[1], b"short");
        assert_eq!(q.num_queued(), 2);
    }

    #[test]
    fn test_limit_respected() {
        let q = queue(100);
        q.queue_broadcast(alive("a", 1, b"aaaaaaaaaa")); // 10 bytes
        q.queue_broadcast(alive("b", 1, b"bbbb")); // 4 bytes

        // Budget of 12 with overhead 2: fits only one of the two.
        let out = q.get_broadcasts(2, 12);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], b"aaaaaaaaaa");
    }

    #[test]
    fn test_items_retire_at_transmit_limit() {
        let q = queue(1); // ceil(log10(2)) = 1 -> one transmit each
        q.queue_broadcast(alive("a", 1, b"payload"));

        assert_eq!(q.get_broadcasts(0, 1024).len(), 1);
        assert_eq!(q.num_queued(), 0);
        assert!(q.get_broadcasts(0, 1024).is_empty());
    }

    #[test]
    fn test_invalidation_lattice() {
        let q = queue(100);
        q.queue_broadcast(alive("a", 1, b"alive-1"));
        // Newer alive for the same node replaces it.
        q.queue_broadcast(alive("a", 2, b"alive-2"));
        assert_eq!(q.num_queued(), 1);

        // Dead supersedes anything queued about the node.
        q.queue_broadcast(dead("a", 2, b"dead-2"));
        assert_eq!(q.num_queued(), 1);
        let out = q.get_broadcasts(0, 1024);
        assert_eq!(out[0], b"dead-2");

        // Different nodes never interfere.
        q.queue_broadcast(alive("b", 1, b"b-alive"));
        q.queue_broadcast(dead("c", 1, b"c-dead"));
        assert_eq!(q.num_queued(), 3);
    }

    #[test]
    fn test_named_replacement_and_unique() {
        let q = queue(100);
        q.queue_broadcast(Broadcast::Named {
            name: "cfg".into(),
            msg: b"v1".to_vec(),
            notify: None,
        });
        q.queue_broadcast(Broadcast::Named {
            name: "cfg".into(),
            msg: b"v2".to_vec(),
            notify: None,
        });
        assert_eq!(q.num_queued(), 1);

        q.queue_broadcast(Broadcast::Unique {
            msg: b"u1".to_vec(),
            notify: None,
        });
        q.queue_broadcast(Broadcast::Unique {
            msg: b"u1".to_vec(),
            notify: None,
        });
        assert_eq!(q.num_queued(), 3);
    }

    #[tokio::test]
    async fn test_finished_fires_exactly_once() {
        let q = queue(1);
        let (tx, rx) = oneshot::channel();
        q.queue_broadcast(Broadcast::Membership {
            node: "a".into(),
            kind: StateKind::Alive,
            incarnation: 1,
            msg: b"x".to_vec(),
            notify: Some(tx),
        });

        // One transmit reaches the limit and finalizes the item.
        q.get_broadcasts(0, 1024);
        rx.await.expect("notify should fire on finalize");
    }

    #[test]
    fn test_prune_drops_most_transmitted_first() {
        let q = queue(1000); // generous limit
        q.queue_broadcast(alive("a", 1, b"aa"));
        q.queue_broadcast(alive("b", 1, b"bb"));
        // Transmit both once so they rank below a fresh item.
        q.get_broadcasts(0, 1024);
        q.queue_broadcast(alive("c", 1, b"cc"));

        q.prune(1);
        assert_eq!(q.num_queued(), 1);
        let out = q.get_broadcasts(0, 1024);
        assert_eq!(out[0], b"cc");
    }
}
