//! Deduplicating work queue with delayed requeue.
//!
//! Keys, not events, are queued: ten changes to the same task before a
//! worker gets to it still mean one pass. A key handed to a worker is
//! "processing" until `done`; adding it meanwhile marks it dirty and it is
//! queued again once `done` is called, so no key is ever processed by two
//! workers at the same time.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::retry::RequeuePolicy;

/// Entry waiting for its requeue time.
#[derive(Debug)]
struct Delayed<K> {
    ready_at: Instant,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the heap pops the earliest entry first.
        other.ready_at.cmp(&self.ready_at)
    }
}

struct State<K> {
    ready: VecDeque<K>,
    /// Keys present in `ready`.
    queued: HashSet<K>,
    processing: HashSet<K>,
    /// Keys added while processing.
    dirty: HashSet<K>,
    delayed: BinaryHeap<Delayed<K>>,
    failures: HashMap<K, u32>,
    shut_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn add(&mut self, key: K) -> bool {
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(entry) = self.delayed.pop() {
                self.add(entry.key);
            }
        }
    }
}

pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    policy: RequeuePolicy,
}

impl<K: Clone + Eq + Hash + Send> WorkQueue<K> {
    pub fn new(policy: RequeuePolicy) -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                delayed: BinaryHeap::new(),
                failures: HashMap::new(),
                shut_down: false,
            }),
            notify: Notify::new(),
            policy,
        }
    }

    pub async fn add(&self, key: K) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }
        if state.add(key) {
            self.notify.notify_one();
        }
    }

    pub async fn add_after(&self, key: K, delay: Duration) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }
        state.delayed.push(Delayed {
            ready_at: Instant::now() + delay,
            key,
        });
        // Wake a waiter so it re-arms its timer for the new deadline.
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            // Registered before looking at the state so a wakeup between the
            // check and the wait is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock().await;
                if state.shut_down {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                state.delayed.peek().map(|d| d.ready_at)
            };

            match deadline {
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

    /// Mark `key` as no longer processing, re-queueing it if it was added
    /// in the meantime.
    pub async fn done(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shut_down && state.add(key.clone()) {
            self.notify.notify_one();
        }
    }

    /// Schedule another pass for a key that failed, backing off with each
    /// consecutive failure. Returns the chosen delay.
    ///
    /// Adds that arrived while the failing pass ran are folded into the
    /// delayed pass, so `done` does not make the key ready right away.
    pub async fn retry(&self, key: K) -> Duration {
        let failures = {
            let mut state = self.state.lock().await;
            state.dirty.remove(&key);
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.policy.next_delay(failures);
        self.add_after(key, delay).await;
        delay
    }

    /// Reset the failure count of `key` after a successful pass.
    pub async fn forget(&self, key: &K) {
        self.state.lock().await.failures.remove(key);
    }

    pub async fn failures(&self, key: &K) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of keys ready to be handed out.
    pub async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop handing out keys and wake every waiter.
    pub async fn shutdown(&self) {
        self.state.lock().await.shut_down = true;
        self.notify.notify_waiters();
    }
}
