//! Blocking work queue shared by the batch workers.
//!
//! Items are either ready (FIFO) or parked in a min-heap until their
//! backoff expires. [`RetryQueue::get`] blocks on a condition variable
//! until an item is ready, the queue is shut down, or the caller's context
//! is done.

mod rate_limit;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use resource::{OpContext, ResourceRef};

use crate::types::BatchWorkItem;

pub use rate_limit::{
    BackoffConfig, ItemRateLimiter, RateLimitConfig, RateLimitStats, TokenBucket,
};

/// Upper bound on one condvar wait, so context cancellation (which does not
/// signal the condvar) is noticed promptly.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Parked {
    ready_at: Instant,
    seq: u64,
    item: BatchWorkItem,
}

impl PartialEq for Parked {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Parked {}

impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest deadline first.
impl Ord for Parked {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<BatchWorkItem>,
    parked: BinaryHeap<Parked>,
    next_seq: u64,
    shut_down: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while self.parked.peek().is_some_and(|p| p.ready_at <= now) {
            if let Some(parked) = self.parked.pop() {
                self.ready.push_back(parked.item);
            }
        }
    }
}

/// Rate-limited retry queue.
#[derive(Debug)]
pub struct RetryQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    limiter: ItemRateLimiter,
    bucket: TokenBucket,
}

impl RetryQueue {
    pub fn new(backoff: BackoffConfig, rate: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            limiter: ItemRateLimiter::new(backoff),
            bucket: TokenBucket::new(rate),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make `item` ready now. Ignored after shutdown.
    pub fn add(&self, item: BatchWorkItem) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.ready.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    /// Make `item` ready once `delay` has passed.
    pub fn add_after(&self, item: BatchWorkItem, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.parked.push(Parked {
            ready_at: Instant::now() + delay,
            seq,
            item,
        });
        drop(state);
        // Waiters recompute their timeout against the new earliest deadline.
        self.available.notify_all();
    }

    /// Requeue after the longer of the item's backoff and the bucket's wait.
    /// Returns the delay applied.
    pub fn add_rate_limited(&self, item: BatchWorkItem) -> Duration {
        let delay = self.limiter.when(&item.resource).max(self.bucket.reserve());
        self.add_after(item, delay);
        delay
    }

    /// Drop the backoff history of a resource that reached a final outcome.
    pub fn forget(&self, resource: &ResourceRef) {
        self.limiter.forget(resource);
    }

    pub fn num_requeues(&self, resource: &ResourceRef) -> u32 {
        self.limiter.num_requeues(resource)
    }

    /// Block for the next ready item. `None` once the queue is shut down or
    /// `ctx` is done.
    pub fn get(&self, ctx: &OpContext) -> Option<BatchWorkItem> {
        let mut state = self.lock();
        loop {
            if state.shut_down || ctx.is_done() {
                return None;
            }
            let now = Instant::now();
            state.promote_due(now);
            if let Some(item) = state.ready.pop_front() {
                return Some(item);
            }

            let mut wait = CANCEL_POLL;
            if let Some(next) = state.parked.peek() {
                wait = wait.min(next.ready_at.saturating_duration_since(now));
            }
            if let Some(remaining) = ctx.remaining() {
                wait = wait.min(remaining);
            }
            state = match self.available.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Wake every waiter and refuse further items. Pending items are dropped.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        state.ready.clear();
        state.parked.clear();
        drop(state);
        self.available.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Ready plus parked items.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        self.bucket.stats()
    }
}
