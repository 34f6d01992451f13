//! Coalescing, rate-limited work queue of namespace names.
//!
//! # Invariants
//!
//! - [INV-QUEUE-001] A name is at most once in the ready list.
//! - [INV-QUEUE-002] A name handed out by [`WorkQueue::get`] is not handed out
//!   again until [`WorkQueue::done`] is called for it. Adds that arrive in the
//!   meantime are folded into one re-queue on `done`.
//! - [INV-QUEUE-003] The queue is idle only when nothing is ready, in flight
//!   or waiting on a delayed re-add.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hnc_core::BackoffConfig;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    active: HashSet<String>,
    dirty: HashSet<String>,
    delayed: usize,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Work queue shared by the watch loop and the workers.
#[derive(Debug)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    backoff: BackoffConfig,
}

impl WorkQueue {
    /// Creates an empty queue retrying failures with `backoff`.
    #[must_use]
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Schedules `name`, coalescing with any pending entry.
    pub fn add(&self, name: &str) {
        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }
        if inner.active.contains(name) {
            inner.dirty.insert(name.to_string());
            return;
        }
        if inner.queued.insert(name.to_string()) {
            inner.ready.push_back(name.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Schedules `name` after `delay`. The queue is not idle while the delay
    /// is pending.
    pub fn add_after(self: &Arc<Self>, name: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(name);
            return;
        }
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            inner.delayed += 1;
        }
        let queue = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.lock().delayed -= 1;
            queue.add(&name);
        });
    }

    /// Records a failure for `name` and re-adds it after the backoff for its
    /// consecutive failure count. Returns the delay applied.
    pub fn add_rate_limited(self: &Arc<Self>, name: &str) -> Duration {
        let attempt = {
            let mut inner = self.lock();
            let failures = inner.failures.entry(name.to_string()).or_insert(0);
            *failures = failures.saturating_add(1);
            *failures
        };
        let delay = self.backoff.delay_for_attempt(attempt);
        self.add_after(name, delay);
        delay
    }

    /// Clears the failure count of `name`.
    pub fn forget(&self, name: &str) {
        self.lock().failures.remove(name);
    }

    /// Consecutive failures recorded for `name`.
    #[must_use]
    pub fn failures(&self, name: &str) -> u32 {
        self.lock().failures.get(name).copied().unwrap_or(0)
    }

    /// Waits for the next ready name. Returns `None` once the queue is shut
    /// down and empty.
    pub async fn get(&self) -> Option<String> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(name) = Self::pop(&mut inner) {
                    let more = !inner.ready.is_empty();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(name);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Returns the next ready name without waiting.
    pub fn try_get(&self) -> Option<String> {
        Self::pop(&mut self.lock())
    }

    /// Marks `name` as finished, re-queueing it if it was added while in
    /// flight.
    pub fn done(&self, name: &str) {
        let mut inner = self.lock();
        inner.active.remove(name);
        if inner.dirty.remove(name) && !inner.shutting_down && inner.queued.insert(name.to_string())
        {
            inner.ready.push_back(name.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Returns `true` if nothing is ready, in flight or delayed.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.ready.is_empty() && inner.active.is_empty() && inner.delayed == 0
    }

    /// Number of ready names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Returns `true` if no name is ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting work and wakes every waiter. Names already ready are
    /// still handed out.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Returns `true` once [`Self::shut_down`] was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    fn pop(inner: &mut Inner) -> Option<String> {
        let name = inner.ready.pop_front()?;
        inner.queued.remove(&name);
        inner.active.insert(name.clone());
        Some(name)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(BackoffConfig::Exponential {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }))
    }

    #[test]
    fn adds_are_coalesced() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_get().as_deref(), Some("a"));
        assert_eq!(q.try_get().as_deref(), Some("b"));
        assert_eq!(q.try_get(), None);
    }

    #[test]
    fn in_flight_name_is_requeued_once_on_done() {
        let q = queue();
        q.add("a");
        let name = q.try_get().unwrap();

        q.add("a");
        q.add("a");
        assert!(q.try_get().is_none(), "in-flight name must not be handed out");

        q.done(&name);
        assert_eq!(q.try_get().as_deref(), Some("a"));
        q.done("a");
        assert!(q.try_get().is_none());
        assert!(q.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_delays_grow_and_reset() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(20));
        assert_eq!(q.failures("a"), 2);
        assert!(!q.is_idle());
        assert!(q.try_get().is_none());

        let name = q.get().await.unwrap();
        assert_eq!(name, "a");
        q.done(&name);
        q.forget(&name);
        assert_eq!(q.failures("a"), 0);
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_keeps_queue_busy_until_it_fires() {
        let q = queue();
        q.add_after("a", Duration::from_secs(5));
        assert!(!q.is_idle());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(q.len(), 1);
        let name = q.try_get().unwrap();
        q.done(&name);
        assert!(q.is_idle());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_returns_already_ready_items_after_shutdown() {
        let q = queue();
        q.add("a");
        q.shut_down();
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }
}
