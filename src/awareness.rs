//! Local health tracking ("awareness").
//!
//! A single bounded score estimates how well this node is keeping up with
//! the soft real-time demands of failure detection. Zero is healthiest.
//! Failed probes without corroborating nacks, and accusations against a
//! live self, raise the score; successful probes lower it. Every
//! probe-related timeout is stretched proportionally to the score, so a
//! degraded node accuses its peers more slowly instead of flooding the
//! cluster with false suspicion.

use std::sync::RwLock;
use std::time::Duration;

pub struct Awareness {
    max: i32,
    score: RwLock<i32>,
}

impl Awareness {
    /// `max` is the exclusive upper bound for the score.
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1) as i32,
            score: RwLock::new(0),
        }
    }

    /// Applies a delta to the score, clamped to `[0, max)`.
    pub fn apply_delta(&self, delta: i32) {
        let mut score = self.score.write().unwrap();
        let initial = *score;
        *score = (*score + delta).clamp(0, self.max - 1);
        if *score != initial {
            tracing::debug!(score = *score, "health score changed");
        }
    }

    /// Current raw health score.
    pub fn get_health_score(&self) -> i32 {
        *self.score.read().unwrap()
    }

    /// Scales a timeout by the current score: a node at score `s` waits
    /// `s + 1` times longer.
    pub fn scale_timeout(&self, timeout: Duration) -> Duration {
        let score = *self.score.read().unwrap();
        timeout * (score as u32 + 1)
    }
}
