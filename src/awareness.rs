//! Node self-awareness: a bounded health score that inflates timeouts when
//! the local node appears to be the problem (slow scheduling, saturated
//! links), so a degraded node does not flood the cluster with accusations.

use std::sync::Mutex;
use std::time::Duration;

pub struct Awareness {
    /// Exclusive upper bound for the score.
    max: u32,
    /// 0 means healthy; larger values stretch probe timeouts.
    score: Mutex<u32>,
}

impl Awareness {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            score: Mutex::new(0),
        }
    }

    /// Shift the score by `delta`, clamped to `[0, max)`.
    pub fn apply_delta(&self, delta: i32) {
        let mut score = self.score.lock().unwrap();
        let shifted = (*score as i64 + delta as i64).clamp(0, self.max as i64 - 1);
        *score = shifted as u32;
    }

    pub fn health_score(&self) -> u32 {
        *self.score.lock().unwrap()
    }

    /// Stretch `timeout` by the current health: `timeout * (score + 1)`.
    pub fn scale_timeout(&self, timeout: Duration) -> Duration {
        let score = *self.score.lock().unwrap();
        timeout * (score + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_clamps_to_range() {
        let a = Awareness::new(8);
        assert_eq!(a.health_score(), 0);

        a.apply_delta(-10);
        assert_eq!(a.health_score(), 0);

        a.apply_delta(3);
        assert_eq!(a.health_score(), 3);

        a.apply_delta(100);
        assert_eq!(a.health_score(), 7);

        a.apply_delta(-1);
        assert_eq!(a.health_score(), 6);
    }

    #[test]
    fn test_scale_timeout() {
        let a = Awareness::new(8);
        let base = Duration::from_millis(500);
        assert_eq!(a.scale_timeout(base), base);

        a.apply_delta(2);
        assert_eq!(a.scale_timeout(base), Duration::from_millis(1500));
    }

    #[test]
    fn test_arbitrary_delta_sequence_stays_bounded() {
        let a = Awareness::new(4);
        for delta in [5, -2, 7, -100, 1, 1, 1, 1, 1, -3, 2] {
            a.apply_delta(delta);
            assert!(a.health_score() < 4);
        }
    }
}
