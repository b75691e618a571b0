//! Delayed re-enqueue of failed work orders.
//!
//! The retry manager computes exponential-backoff delays with
//! proportional jitter and arms one cancellable timer per waiting work
//! order. When a timer fires it sends a [`RetryFired`] message; the
//! control plane owns the receiving end and performs the RETRY
//! transition plus the re-enqueue. Timers are in-memory only: pending
//! retries do not survive a process restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Proportional jitter: the computed delay is scaled by a uniform
    /// factor in `[1 - jitter, 1 + jitter]`.
    pub jitter_factor: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// The un-jittered delay for a 1-based attempt number:
    /// `min(base * multiplier^(attempt-1), max)`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let ms = self.base_delay_ms as f64 * self.multiplier.powi(exp as i32);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// The jittered delay actually scheduled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt).as_millis() as f64;
        let jitter = if self.jitter_factor > 0.0 {
            rand::rng().random_range(-self.jitter_factor..=self.jitter_factor)
        } else {
            0.0
        };
        Duration::from_millis((raw * (1.0 + jitter)).max(0.0) as u64)
    }

    /// Inclusive bounds every jittered delay must fall within.
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let raw = self.raw_delay(attempt).as_millis() as f64;
        let lo = raw * (1.0 - self.jitter_factor);
        let hi = raw * (1.0 + self.jitter_factor);
        (
            Duration::from_millis(lo.max(0.0) as u64),
            Duration::from_millis(hi.ceil() as u64),
        )
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Message sent when a retry timer fires.
#[derive(Debug, Clone)]
pub struct RetryFired {
    pub work_order_id: Uuid,
    /// 1-based attempt number this retry begins.
    pub attempt: u32,
}

/// A scheduled re-enqueue, one per order in `waiting_retry`.
#[derive(Debug)]
struct RetryEntry {
    attempt: u32,
    eligible_at: DateTime<Utc>,
    last_error: String,
    token: CancellationToken,
}

/// Stats view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    pub pending: usize,
    pub attempts: HashMap<Uuid, u32>,
}

/// Schedules and cancels retry timers.
pub struct RetryManager {
    policy: RetryPolicy,
    entries: Arc<Mutex<HashMap<Uuid, RetryEntry>>>,
    fired_tx: mpsc::UnboundedSender<RetryFired>,
}

impl RetryManager {
    /// Create the manager and the channel its timers fire into.
    pub fn new(policy: RetryPolicy) -> (Self, mpsc::UnboundedReceiver<RetryFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                policy,
                entries: Arc::new(Mutex::new(HashMap::new())),
                fired_tx,
            },
            fired_rx,
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Arm a one-shot timer for `work_order_id`.
    ///
    /// `attempt` is the 1-based attempt the fired retry will begin.
    /// Re-scheduling an order that already has a timer replaces it.
    /// Returns the scheduled delay.
    pub fn schedule(&self, work_order_id: Uuid, attempt: u32, last_error: &str) -> Duration {
        let delay = self.policy.delay_for(attempt);
        let token = CancellationToken::new();

        {
            let mut entries = self.entries.lock().expect("retry entries poisoned");
            if let Some(previous) = entries.insert(
                work_order_id,
                RetryEntry {
                    attempt,
                    eligible_at: Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_default(),
                    last_error: last_error.to_owned(),
                    token: token.clone(),
                },
            ) {
                previous.token.cancel();
            }
        }

        tracing::info!(
            %work_order_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        let entries = Arc::clone(&self.entries);
        let fired_tx = self.fired_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let still_armed = entries
                        .lock()
                        .expect("retry entries poisoned")
                        .remove(&work_order_id)
                        .is_some();
                    if still_armed {
                        let _ = fired_tx.send(RetryFired { work_order_id, attempt });
                    }
                }
                _ = token.cancelled() => {}
            }
        });

        delay
    }

    /// Disarm the timer for an order. Safe to call when absent.
    pub fn cancel(&self, work_order_id: Uuid) {
        let entry = self
            .entries
            .lock()
            .expect("retry entries poisoned")
            .remove(&work_order_id);
        if let Some(entry) = entry {
            entry.token.cancel();
            tracing::debug!(%work_order_id, attempt = entry.attempt, "retry cancelled");
        }
    }

    pub fn stats(&self) -> RetryStats {
        let entries = self.entries.lock().expect("retry entries poisoned");
        RetryStats {
            pending: entries.len(),
            attempts: entries.iter().map(|(id, e)| (*id, e.attempt)).collect(),
        }
    }

    /// The last recorded error for a waiting order, if any.
    pub fn last_error(&self, work_order_id: Uuid) -> Option<String> {
        self.entries
            .lock()
            .expect("retry entries poisoned")
            .get(&work_order_id)
            .map(|e| e.last_error.clone())
    }

    /// When the waiting order becomes eligible again.
    pub fn eligible_at(&self, work_order_id: Uuid) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .expect("retry entries poisoned")
            .get(&work_order_id)
            .map(|e| e.eligible_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.raw_delay(1), Duration::from_secs(5));
        assert_eq!(policy.raw_delay(2), Duration::from_secs(10));
        assert_eq!(policy.raw_delay(3), Duration::from_secs(20));
        // 5s * 2^9 = 2560s, capped at 300s.
        assert_eq!(policy.raw_delay(10), Duration::from_secs(300));
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            let (lo, hi) = policy.delay_bounds(attempt);
            for _ in 0..100 {
                let d = policy.delay_for(attempt);
                assert!(d >= lo && d <= hi, "attempt {attempt}: {d:?} not in [{lo:?}, {hi:?}]");
            }
        }
    }

    #[test]
    fn spec_bounds_for_first_attempts() {
        let policy = RetryPolicy::default();
        let (lo, hi) = policy.delay_bounds(1);
        assert_eq!(lo, Duration::from_millis(4_500));
        assert_eq!(hi, Duration::from_millis(5_500));
        let (lo, hi) = policy.delay_bounds(2);
        assert_eq!(lo, Duration::from_millis(9_000));
        assert_eq!(hi, Duration::from_millis(11_000));
        let (lo, hi) = policy.delay_bounds(3);
        assert_eq!(lo, Duration::from_millis(18_000));
        assert_eq!(hi, Duration::from_millis(22_000));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_and_clears_entry() {
        let (manager, mut fired_rx) = RetryManager::new(RetryPolicy::default());
        let id = Uuid::new_v4();

        manager.schedule(id, 1, "agent timed out");
        assert_eq!(manager.stats().pending, 1);
        assert_eq!(manager.last_error(id).as_deref(), Some("agent timed out"));

        // Past the jitter upper bound.
        tokio::time::advance(Duration::from_secs(6)).await;

        let fired = fired_rx.recv().await.unwrap();
        assert_eq!(fired.work_order_id, id);
        assert_eq!(fired.attempt, 1);
        assert_eq!(manager.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_disarms_timer() {
        let (manager, mut fired_rx) = RetryManager::new(RetryPolicy::default());
        let id = Uuid::new_v4();

        manager.schedule(id, 1, "transient");
        manager.cancel(id);
        assert_eq!(manager.stats().pending, 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(fired_rx.try_recv().is_err(), "cancelled timer must not fire");

        // Cancelling an absent entry is a no-op.
        manager.cancel(id);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_previous_timer() {
        let (manager, mut fired_rx) = RetryManager::new(RetryPolicy::default());
        let id = Uuid::new_v4();

        manager.schedule(id, 1, "first");
        manager.schedule(id, 2, "second");
        assert_eq!(manager.stats().pending, 1);
        assert_eq!(manager.stats().attempts[&id], 2);

        // Wait past both timers: only the replacement fires.
        tokio::time::advance(Duration::from_secs(15)).await;
        let fired = fired_rx.recv().await.unwrap();
        assert_eq!(fired.attempt, 2);
        assert!(fired_rx.try_recv().is_err());
    }
}
