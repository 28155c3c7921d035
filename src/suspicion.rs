//! Suspicion timers with confirmation-driven decay.
//!
//! When a peer is marked suspect, the timeout before declaring it dead starts
//! at a maximum and shrinks logarithmically as independent confirmations
//! arrive from other cluster members. A well-connected cluster converges on a
//! verdict quickly; a lone accuser waits the full window.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Invoked exactly once when the timer fires, with the number of independent
/// confirmations seen by then.
pub type FireFn = Box<dyn FnOnce(u32) + Send + 'static>;

pub struct Suspicion {
    /// Confirmations seen so far. Shared with the timer task so the fire
    /// callback observes the final count.
    n: Arc<AtomicU32>,
    /// Confirmations needed to reach the minimum timeout.
    k: u32,
    min: Duration,
    max: Duration,
    start: Instant,
    deadline_tx: watch::Sender<Instant>,
    /// Names that already confirmed; pre-seeded with the first accuser so a
    /// gossip echo of our own suspicion is not counted as new evidence.
    confirmers: Mutex<HashSet<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Suspicion {
    /// Start a timer accusing some node, first reported by `from`.
    pub fn new(from: &str, k: u32, min: Duration, max: Duration, fire: FireFn) -> Self {
        // With nobody around to confirm, skip straight to the floor.
        let initial = if k < 1 { min } else { max };

        let start = Instant::now();
        let (deadline_tx, mut deadline_rx) = watch::channel(start + initial);

        let n = Arc::new(AtomicU32::new(0));
        let n_task = Arc::clone(&n);
        let mut fire = Some(fire);

        // Single owner task: sleeps toward the current deadline, re-arms on
        // every published change, fires at most once.
        let task = tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow();
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if let Some(f) = fire.take() {
                            f(n_task.load(Ordering::SeqCst));
                        }
                        return;
                    }
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let mut confirmers = HashSet::new();
        confirmers.insert(from.to_string());

        Self {
            n,
            k,
            min,
            max,
            start,
            deadline_tx,
            confirmers: Mutex::new(confirmers),
            task: Mutex::new(Some(task)),
        }
    }

    /// Register a confirmation from `from`. Returns true if it was new
    /// information (and therefore worth re-gossiping).
    pub fn confirm(&self, from: &str) -> bool {
        if self.n.load(Ordering::SeqCst) >= self.k {
            return false;
        }
        {
            let mut confirmers = self.confirmers.lock().unwrap();
            if !confirmers.insert(from.to_string()) {
                return false;
            }
        }
        let n = self.n.fetch_add(1, Ordering::SeqCst) + 1;

        let timeout = remaining_timeout(self.k, n, self.min, self.max);
        let deadline = self.start + timeout;
        // Publishing a deadline in the past makes the timer task fire on its
        // next poll; the task stays the sole firer.
        let _ = self.deadline_tx.send(deadline.max(Instant::now()));
        true
    }

    pub fn confirmations(&self) -> u32 {
        self.n.load(Ordering::SeqCst)
    }

    /// Cancel the timer. Idempotent; a no-op if it already fired.
    pub fn dispose(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for Suspicion {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Total timeout after `n` of `k` confirmations, measured from the start of
/// suspicion: `max - (ln(n+1)/ln(k+1)) * (max - min)`, floored at `min`.
pub fn remaining_timeout(k: u32, n: u32, min: Duration, max: Duration) -> Duration {
    if k < 1 {
        return min;
    }
    let frac = ((n as f64) + 1.0).ln() / ((k as f64) + 1.0).ln();
    let raw = max.as_secs_f64() - frac * (max - min).as_secs_f64();
    Duration::from_secs_f64(raw.max(min.as_secs_f64()))
}

/// Floor of the suspicion window for a cluster of `n` nodes:
/// `mult * max(1, log10(n)) * probe_interval`.
pub fn suspicion_timeout(mult: u32, n: usize, probe_interval: Duration) -> Duration {
    let scale = (n.max(1) as f64).log10().max(1.0);
    probe_interval.mul_f64(mult as f64 * scale)
}
