//! Session-owned deferred and periodic timers.
//!
//! Each timer is a Tokio task that posts a [`TimerFired`] onto the session's
//! timer channel. Cancelling aborts the task. The registry is the single
//! owner of every live timer handle, so tearing a session down means
//! draining it to empty.
//!
//! A fire event can already be queued when its timer is cancelled. The
//! driver therefore calls [`TimerRegistry::acknowledge`] on every dequeued
//! event and drops the ones for timers that are no longer registered.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

/// Opaque handle for a registered timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// What a timer is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerPurpose {
    /// Session-wide failsafe.
    Deadline,
    /// Upper bound on waiting for burst acknowledgements.
    LoadWait,
    /// WebSocket ping cadence.
    Keepalive,
}

/// A timer expiry delivered on the session's timer channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerFired {
    /// The timer that fired.
    pub id: TimerId,
    /// Why it was registered.
    pub purpose: TimerPurpose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    Deferred,
    Periodic,
}

struct TimerEntry {
    purpose: TimerPurpose,
    kind: TimerKind,
    task: JoinHandle<()>,
}

/// Registry of a session's outstanding timers.
pub struct TimerRegistry {
    next_id: u64,
    active: HashMap<TimerId, TimerEntry>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    cancelled_total: u64,
}

impl TimerRegistry {
    /// Create a registry posting expiries to `fired_tx`.
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            next_id: 0,
            active: HashMap::new(),
            fired_tx,
            cancelled_total: 0,
        }
    }

    /// Create a registry together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Fire once after `delay`.
    pub fn schedule_once(&mut self, purpose: TimerPurpose, delay: Duration) -> TimerId {
        let id = self.allocate();
        let tx = self.fired_tx.clone();
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(TimerFired { id, purpose });
        });
        self.insert(id, purpose, TimerKind::Deferred, task);
        id
    }

    /// Fire every `period`, first after one full period.
    pub fn schedule_every(&mut self, purpose: TimerPurpose, period: Duration) -> TimerId {
        let id = self.allocate();
        let tx = self.fired_tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let _ = ticker.tick().await;
                if tx.send(TimerFired { id, purpose }).is_err() {
                    break;
                }
            }
        });
        self.insert(id, purpose, TimerKind::Periodic, task);
        id
    }

    /// Cancel a timer. Returns `false` if it was already cancelled or has
    /// fired; that case is a no-op.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.active.remove(&id) {
            Some(entry) => {
                entry.task.abort();
                self.cancelled_total += 1;
                trace!(%id, purpose = ?entry.purpose, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Accept a dequeued fire event.
    ///
    /// Returns `false` for a stale event whose timer was cancelled after it
    /// posted. A deferred timer is unregistered here, so cancelling it
    /// later is a no-op.
    pub fn acknowledge(&mut self, fired: &TimerFired) -> bool {
        match self.active.get(&fired.id).map(|e| e.kind) {
            Some(TimerKind::Deferred) => {
                let _ = self.active.remove(&fired.id);
                true
            }
            Some(TimerKind::Periodic) => true,
            None => false,
        }
    }

    /// Cancel every registered timer except `keep`, looping until nothing
    /// else is left. Returns how many timers were cancelled.
    pub fn drain(&mut self, keep: Option<TimerId>) -> usize {
        let mut cancelled = 0;
        loop {
            let batch: Vec<TimerId> = self
                .active
                .keys()
                .copied()
                .filter(|id| Some(*id) != keep)
                .collect();
            if batch.is_empty() {
                return cancelled;
            }
            for id in batch {
                if self.cancel(id) {
                    cancelled += 1;
                }
            }
        }
    }

    /// Whether the timer is still registered.
    pub fn is_active(&self, id: TimerId) -> bool {
        self.active.contains_key(&id)
    }

    /// Purpose of a registered timer.
    pub fn purpose(&self, id: TimerId) -> Option<TimerPurpose> {
        self.active.get(&id).map(|e| e.purpose)
    }

    /// Number of registered timers.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no timers are registered.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Total cancellations performed over the registry's lifetime.
    pub fn cancelled_total(&self) -> u64 {
        self.cancelled_total
    }

    fn allocate(&mut self) -> TimerId {
        self.next_id += 1;
        TimerId(self.next_id)
    }

    fn insert(&mut self, id: TimerId, purpose: TimerPurpose, kind: TimerKind, task: JoinHandle<()>) {
        trace!(%id, ?purpose, ?kind, "timer registered");
        let _ = self.active.insert(id, TimerEntry { purpose, kind, task });
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        for entry in self.active.values() {
            entry.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deferred_timer_fires_once() {
        let (mut timers, mut rx) = TimerRegistry::channel();
        let id = timers.schedule_once(TimerPurpose::LoadWait, Duration::from_millis(100));

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, TimerFired { id, purpose: TimerPurpose::LoadWait });
        assert!(timers.acknowledge(&fired));
        assert!(!timers.is_active(id));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (mut timers, _rx) = TimerRegistry::channel();
        let id = timers.schedule_once(TimerPurpose::LoadWait, Duration::from_secs(5));

        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert_eq!(timers.cancelled_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_is_noop() {
        let (mut timers, mut rx) = TimerRegistry::channel();
        let id = timers.schedule_once(TimerPurpose::Deadline, Duration::from_millis(10));
        let fired = rx.recv().await.unwrap();
        assert!(timers.acknowledge(&fired));

        assert!(!timers.cancel(id));
        assert_eq!(timers.cancelled_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut timers, mut rx) = TimerRegistry::channel();
        let id = timers.schedule_once(TimerPurpose::LoadWait, Duration::from_millis(50));
        assert!(timers.cancel(id));

        time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fire_is_rejected() {
        let (mut timers, mut rx) = TimerRegistry::channel();
        let id = timers.schedule_once(TimerPurpose::LoadWait, Duration::from_millis(10));

        // Let the event land in the channel, then cancel before dequeuing.
        time::sleep(Duration::from_millis(20)).await;
        assert!(timers.cancel(id));

        let fired = rx.recv().await.unwrap();
        assert!(!timers.acknowledge(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_keeps_firing_until_cancelled() {
        let (mut timers, mut rx) = TimerRegistry::channel();
        let id = timers.schedule_every(TimerPurpose::Keepalive, Duration::from_millis(100));

        for _ in 0..3 {
            let fired = rx.recv().await.unwrap();
            assert_eq!(fired.purpose, TimerPurpose::Keepalive);
            assert!(timers.acknowledge(&fired));
            assert!(timers.is_active(id));
        }

        assert!(timers.cancel(id));
        time::sleep(Duration::from_millis(500)).await;
        while let Ok(stale) = rx.try_recv() {
            assert!(!timers.acknowledge(&stale));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_empties_registry() {
        let (mut timers, _rx) = TimerRegistry::channel();
        let _ = timers.schedule_once(TimerPurpose::LoadWait, Duration::from_secs(1));
        let _ = timers.schedule_every(TimerPurpose::Keepalive, Duration::from_secs(1));
        let _ = timers.schedule_once(TimerPurpose::Deadline, Duration::from_secs(9));

        assert_eq!(timers.drain(None), 3);
        assert!(timers.is_empty());
        assert_eq!(timers.drain(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_keeps_excluded_timer() {
        let (mut timers, _rx) = TimerRegistry::channel();
        let deadline = timers.schedule_once(TimerPurpose::Deadline, Duration::from_secs(9));
        let _ = timers.schedule_every(TimerPurpose::Keepalive, Duration::from_secs(1));

        assert_eq!(timers.drain(Some(deadline)), 1);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.purpose(deadline), Some(TimerPurpose::Deadline));
    }

    #[test]
    fn timer_id_display() {
        assert_eq!(TimerId(7).to_string(), "timer#7");
    }
}
