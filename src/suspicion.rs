//! Suspicion timers with confirmation-driven acceleration.
//!
//! When a peer is marked suspect we arm a timer that starts at a generous
//! maximum and contracts logarithmically as independent peers corroborate
//! the accusation. Once `k` distinct confirmations arrive the deadline has
//! collapsed to the minimum, bounding how long a genuinely dead node can
//! linger while still giving a live node time to refute.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Invoked when the timer fires, with the confirmation count at that point.
pub type TimeoutFn = Arc<dyn Fn(u32) + Send + Sync>;

pub struct Suspicion {
    /// Independent confirmations seen so far. Atomic because the timer task
    /// reads it without holding the membership lock.
    n: Arc<AtomicU32>,
    /// Confirmations needed to drive the timer to its minimum.
    k: u32,
    min: Duration,
    max: Duration,
    /// Captured right after the initial timer is armed.
    start: Instant,
    timeout_fn: TimeoutFn,
    timer: JoinHandle<()>,
    /// Peers whose accusation has already been counted.
    confirmations: HashSet<String>,
}

impl Suspicion {
    /// Arms a timer at `max` that will contract towards `min` as
    /// confirmations arrive, or directly at `min` when no confirmations are
    /// expected (`k < 1`). The original accuser `from` is excluded, since
    /// our own suspect message may be gossiped back to us.
    pub fn new(
        from: &str,
        k: u32,
        min: Duration,
        max: Duration,
        timeout_fn: TimeoutFn,
    ) -> Self {
        let mut confirmations = HashSet::new();
        confirmations.insert(from.to_string());

        let n = Arc::new(AtomicU32::new(0));
        let timeout = if k < 1 { min } else { max };
        let timer = spawn_timer(timeout, n.clone(), timeout_fn.clone());

        // Start is captured after arming so any preemption in between errs
        // towards a slightly longer overall timeout.
        Self {
            n,
            k,
            min,
            max,
            start: Instant::now(),
            timeout_fn,
            timer,
            confirmations,
        }
    }

    /// Registers that `from` independently considers the node suspect.
    /// Returns true when this was new information, false on a duplicate
    /// confirmation or once enough confirmations have already been seen.
    pub fn confirm(&mut self, from: &str) -> bool {
        if self.n.load(Ordering::SeqCst) >= self.k {
            return false;
        }
        if !self.confirmations.insert(from.to_string()) {
            return false;
        }

        let n = self.n.fetch_add(1, Ordering::SeqCst) + 1;
        let total = total_suspicion_time(n, self.k, self.min, self.max);
        let elapsed = self.start.elapsed();

        let already_fired = self.timer.is_finished();
        self.timer.abort();
        if !already_fired {
            match total.checked_sub(elapsed) {
                Some(remaining) if remaining > Duration::ZERO => {
                    self.timer =
                        spawn_timer(remaining, self.n.clone(), self.timeout_fn.clone());
                }
                _ => {
                    // Overdue: dispatch on a separate task, the callback
                    // re-validates state under the membership lock.
                    let n_handle = self.n.clone();
                    let f = self.timeout_fn.clone();
                    self.timer = tokio::spawn(async move {
                        f(n_handle.load(Ordering::SeqCst));
                    });
                }
            }
        }
        true
    }

    /// Confirmations counted so far.
    pub fn confirmation_count(&self) -> u32 {
        self.n.load(Ordering::SeqCst)
    }
}

impl Drop for Suspicion {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

fn spawn_timer(after: Duration, n: Arc<AtomicU32>, f: TimeoutFn) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        f(n.load(Ordering::SeqCst));
    })
}

/// Overall timeout after `n` of `k` expected confirmations: interpolates
/// from `max` down to `min` on a log scale, floored to milliseconds.
fn total_suspicion_time(n: u32, k: u32, min: Duration, max: Duration) -> Duration {
    let frac = ((n as f64) + 1.0).ln() / ((k as f64) + 1.0).ln();
    let raw = max.as_secs_f64() - frac * (max.as_secs_f64() - min.as_secs_f64());
    let timeout = Duration::from_millis((raw * 1000.0).floor().max(0.0) as u64);
    timeout.max(min)
}
