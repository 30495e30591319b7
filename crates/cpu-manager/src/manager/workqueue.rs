//! Deduplicating work queue with per-item exponential backoff.
//!
//! An item is queued at most once. While an item is being processed it is
//! not handed out again; re-adding it marks it dirty and it is queued when
//! [`WorkQueue::done`] is called. Delayed items wait in a priority queue
//! ordered by their ready time.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use priority_queue::PriorityQueue;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

struct Inner<T: Hash + Eq> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    waiting: PriorityQueue<T, Reverse<Instant>>,
    shutting_down: bool,
}

pub struct WorkQueue<T: Hash + Eq> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    backoff: Backoff,
}

impl<T> WorkQueue<T>
where
    T: Hash + Eq + Clone,
{
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                waiting: PriorityQueue::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, item: T) {
        let mut inner = self.lock();
        if Self::enqueue(&mut inner, item) {
            drop(inner);
            self.notify.notify_one();
        }
    }

    fn enqueue(inner: &mut Inner<T>, item: T) -> bool {
        if inner.shutting_down || inner.dirty.contains(&item) {
            return false;
        }
        inner.dirty.insert(item.clone());
        if inner.processing.contains(&item) {
            return false;
        }
        inner.queue.push_back(item);
        true
    }

    /// Queues `item` once `delay` has passed. An item already waiting keeps
    /// the earlier of the two ready times.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }
        let ready_at = Instant::now() + delay;
        inner.waiting.push_increase(item, Reverse(ready_at));
        drop(inner);
        // Wake a waiter so it re-arms its timer for the new deadline.
        self.notify.notify_one();
    }

    /// Queues `item` after its backoff delay and records one more failure.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut inner = self.lock();
            let failures = inner.failures.entry(item.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(item, delay);
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready = {
                let mut inner = self.lock();
                Self::promote_ready(&mut inner);
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
                if inner.shutting_down {
                    return None;
                }
                inner.waiting.peek().map(|(_, Reverse(at))| *at)
            };

            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn promote_ready(inner: &mut Inner<T>) {
        let now = Instant::now();
        while let Some((_, Reverse(at))) = inner.waiting.peek() {
            if *at > now {
                break;
            }
            if let Some((item, _)) = inner.waiting.pop() {
                Self::enqueue(inner, item);
            }
        }
    }

    /// Marks `item` as processed. If it was re-added meanwhile it is queued
    /// again.
    pub fn done(&self, item: &T) {
        let mut inner = self.lock();
        inner.processing.remove(item);
        if inner.dirty.contains(item) {
            inner.queue.push_back(item.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stops handing out items. Pending `get` calls return `None`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Items ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(40), DEFAULT_MAX_DELAY);
        assert_eq!(backoff.delay(u32::MAX), DEFAULT_MAX_DELAY);
    }

    #[test(tokio::test)]
    async fn duplicate_adds_are_collapsed() {
        let queue = WorkQueue::default();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
    }

    #[test(tokio::test)]
    async fn item_in_flight_is_requeued_after_done() {
        let queue = WorkQueue::default();
        queue.add("a");
        let item = queue.get().await.expect("item");

        queue.add("a");
        assert!(queue.is_empty(), "in-flight item must not be handed out");

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[test(tokio::test(start_paused = true))]
    async fn rate_limited_items_come_back_after_backoff() {
        let queue = WorkQueue::default();
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 2);
        assert!(queue.is_empty());

        let item = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("item becomes ready");
        assert_eq!(item, Some("a"));

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[test(tokio::test)]
    async fn shutdown_releases_waiters() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        assert_eq!(waiter.await.expect("join"), None);

        queue.add("late");
        assert!(queue.is_empty());
    }
}
