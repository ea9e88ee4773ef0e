//! A de-duplicating queue of object keys
use ahash::{AHashMap, AHashSet};
use futures::future;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    pin::pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tokio_util::time::{delay_queue, DelayQueue};

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, whether queued or parked behind an in-flight run
    dirty: AHashSet<String>,
    /// Keys handed out by [`WorkQueue::get`] and not yet marked [`WorkQueue::done`]
    processing: AHashSet<String>,
    /// Keys scheduled by [`WorkQueue::add_after`], at most one entry per key
    delayed: DelayQueue<String>,
    scheduled: AHashMap<String, delay_queue::Key>,
    shutting_down: bool,
}

impl State {
    /// Queue `key` unless it is already waiting, returning whether it became ready
    fn push(&mut self, key: String) -> bool {
        if self.shutting_down || !self.dirty.insert(key.clone()) {
            return false;
        }
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn schedule(&mut self, key: String, deadline: Instant) {
        match self.scheduled.get(&key) {
            Some(slot) => {
                // a repeated schedule only ever brings the key forward
                if self.delayed.deadline(slot) > deadline {
                    self.delayed.reset_at(slot, deadline);
                }
            }
            None => {
                let slot = self.delayed.insert_at(key.clone(), deadline);
                self.scheduled.insert(key, slot);
            }
        }
    }

    /// Move every delayed key whose deadline passed into the queue
    ///
    /// Registers `cx` to be woken when the next deadline passes.
    fn promote_expired(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(expired)) = self.delayed.poll_expired(cx) {
            let key = expired.into_inner();
            self.scheduled.remove(&key);
            self.push(key);
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// A FIFO of keys where each key is queued at most once
///
/// A key added while it is being processed is parked and queued again once the worker
/// calls [`WorkQueue::done`], so no key is ever handed to two workers at once.
#[derive(Clone, Default)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// An empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: impl Into<String>) {
        let ready = self.inner.state.lock().push(key.into());
        if ready {
            self.inner.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed
    ///
    /// Scheduling a key that is already scheduled keeps the earlier of the two deadlines.
    /// Must be called from within a tokio runtime.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            return self.add(key);
        }
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.schedule(key, Instant::now() + delay);
        }
        // an idle worker has to pick up the new deadline
        self.inner.notify.notify_one();
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        let mut notified = pin!(self.inner.notify.notified());
        future::poll_fn(|cx| loop {
            if notified.as_mut().poll(cx).is_ready() {
                notified.set(self.inner.notify.notified());
                continue;
            }
            let mut state = self.inner.state.lock();
            state.promote_expired(cx);
            if let Some(key) = state.queue.pop_front() {
                state.dirty.remove(&key);
                state.processing.insert(key.clone());
                // hand the timer and any remaining keys over to another worker
                let more = !state.queue.is_empty() || !state.delayed.is_empty();
                drop(state);
                if more {
                    self.inner.notify.notify_one();
                }
                return Poll::Ready(Some(key));
            }
            if state.shutting_down {
                return Poll::Ready(None);
            }
            return Poll::Pending;
        })
        .await
    }

    /// Mark `key` as processed, requeueing it if it was added in the meantime
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    ///
    /// Delayed keys that have not come due are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.delayed.clear();
            state.scheduled.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no key is ready to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys waiting for their delay to pass
    pub fn scheduled(&self) -> usize {
        self.inner.state.lock().scheduled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::WorkQueue;
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_keys_are_coalesced() {
        let queue = WorkQueue::new();
        queue.add("ns/a");
        queue.add("ns/b");
        queue.add("ns/a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_processing_is_parked_until_done() {
        let queue = WorkQueue::new();
        queue.add("ns/a");
        let key = queue.get().await.unwrap();

        queue.add("ns/a");
        queue.add("ns/a");
        assert!(queue.is_empty(), "in-flight key must not be handed out twice");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        queue.done("ns/a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shut_down_wakes_waiting_workers() {
        let queue = WorkQueue::new();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("ns/a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shut_down_drains_queued_keys_first() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.shut_down();
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_keys_arrive_after_the_delay() {
        let queue = WorkQueue::new();
        queue.add_after("ns/a", Duration::from_secs(10));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_delays_for_a_key_are_merged() {
        let queue = WorkQueue::new();
        queue.add_after("ns1/foo", Duration::from_millis(80));
        queue.add_after("ns1/foo", Duration::from_millis(20));
        queue.add_after("ns1/foo", Duration::from_millis(140));
        assert_eq!(queue.scheduled(), 1);

        let started = tokio::time::Instant::now();
        assert_eq!(queue.get().await.as_deref(), Some("ns1/foo"));
        assert!(started.elapsed() < Duration::from_millis(80), "earliest deadline wins");
        queue.done("ns1/foo");

        let again = tokio::time::timeout(Duration::from_secs(1), queue.get()).await;
        assert!(again.is_err(), "later schedules must not run the key again");
        assert_eq!(queue.scheduled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_keys_reach_a_worker_that_was_already_waiting() {
        let queue = WorkQueue::new();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;
        queue.add_after("ns/a", Duration::from_secs(5));
        assert_eq!(waiter.await.unwrap().as_deref(), Some("ns/a"));
    }
}
