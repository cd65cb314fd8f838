use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(30);

struct QueueState<T> {
    queue: VecDeque<T>,
    // pending items; an item here is either queued or will be re-queued on Done
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
}

/// Deduplicating work queue with per-item exponential back-off.
///
/// An item added while queued collapses into the queued instance; an item
/// added while being processed is parked and re-queued when the worker calls
/// [`WorkQueue::done`], so a single worker at a time processes any given
/// item and per-item events stay serialized.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
            }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueues `item` unless it is already pending.
    pub fn add(&self, item: T) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            // parked; done() will queue it
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Blocks until an item is available or the queue has been shut down and
    /// drained, in which case `None` is returned.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if self.shutdown.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases `item` after processing; if it was re-added meanwhile it is
    /// queued again.
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Schedules a retry of `item` after an exponential per-item back-off.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let requeues = {
            let mut state = self.state.lock().unwrap();
            let requeues = state.failures.entry(item.clone()).or_insert(0);
            *requeues += 1;
            *requeues
        };
        let delay = backoff(requeues);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Resets the back-off for `item` after a successful round.
    pub fn forget(&self, item: &T) {
        self.state.lock().unwrap().failures.remove(item);
    }

    pub fn requeues(&self, item: &T) -> u32 {
        self.state
            .lock()
            .unwrap()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Stops accepting new work and wakes blocked workers once the queue is
    /// drained.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn backoff(requeues: u32) -> Duration {
    let exp = requeues.saturating_sub(1).min(16);
    let delay = BASE_DELAY.saturating_mul(1 << exp);
    delay.min(MAX_DELAY)
}
