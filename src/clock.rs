//! Clock & Timer service: one-shot timers keyed by
//! `(worker_key, purpose)`. Arming a timer for a key that already has one
//! cancels the previous one: a worker never has more than one deadline
//! pending at once.
//!
//! Grounded on `airssys-rt`'s backoff timer bookkeeping (sliding time
//! windows tracked alongside worker state) but implemented with plain
//! `tokio::time` one-shot tasks instead of a generic scheduler, since the
//! supervisor only ever needs the three purposes named below.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::worker::WorkerKey;

/// What a pending timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    Startup,
    Stop,
    Backoff,
}

/// A timer expiration, fed into the Supervisor Core's timer-event queue.
#[derive(Debug, Clone)]
pub struct TimerFired {
    pub key: WorkerKey,
    pub purpose: TimerPurpose,
}

/// Owns every worker's at-most-one-per-purpose pending timer.
pub struct Clock {
    sender: mpsc::UnboundedSender<TimerFired>,
    handles: HashMap<(WorkerKey, TimerPurpose), JoinHandle<()>>,
}

impl Clock {
    pub fn new(sender: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            sender,
            handles: HashMap::new(),
        }
    }

    /// Arms a timer for `key`/`purpose`, cancelling any previous one for the
    /// same pair first.
    pub fn arm(&mut self, key: WorkerKey, purpose: TimerPurpose, delay: Duration) {
        self.cancel(&key, purpose);
        let sender = self.sender.clone();
        let fired_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(TimerFired {
                key: fired_key,
                purpose,
            });
        });
        self.handles.insert((key, purpose), handle);
    }

    /// Cancels a pending timer, if any. A no-op if none is armed.
    pub fn cancel(&mut self, key: &WorkerKey, purpose: TimerPurpose) {
        if let Some(handle) = self.handles.remove(&(key.clone(), purpose)) {
            handle.abort();
        }
    }

    /// Cancels every pending timer for a worker, across all purposes.
    pub fn cancel_all(&mut self, key: &WorkerKey) {
        self.cancel(key, TimerPurpose::Startup);
        self.cancel(key, TimerPurpose::Stop);
        self.cancel(key, TimerPurpose::Backoff);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[tokio::test]
    async fn timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut clock = Clock::new(tx);
        let key = WorkerKey::new("web", 0);
        clock.arm(key.clone(), TimerPurpose::Startup, Duration::from_millis(10));
        let fired = rx.recv().await.expect("timer fires");
        assert_eq!(fired.key, key);
        assert_eq!(fired.purpose, TimerPurpose::Startup);
    }

    #[tokio::test]
    async fn rearming_cancels_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut clock = Clock::new(tx);
        let key = WorkerKey::new("web", 0);
        clock.arm(key.clone(), TimerPurpose::Stop, Duration::from_millis(500));
        clock.arm(key.clone(), TimerPurpose::Stop, Duration::from_millis(10));

        let fired = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("should fire well before the cancelled 500ms timer")
            .expect("channel open");
        assert_eq!(fired.purpose, TimerPurpose::Stop);

        // Only one firing should ever arrive for this key/purpose pair.
        let second = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(second.is_err(), "cancelled timer must not also fire");
    }

    #[tokio::test]
    async fn cancel_before_expiry_suppresses_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut clock = Clock::new(tx);
        let key = WorkerKey::new("web", 0);
        clock.arm(key.clone(), TimerPurpose::Backoff, Duration::from_millis(50));
        clock.cancel(&key, TimerPurpose::Backoff);
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err());
    }
}
