//! # Priority blocking queue
//!
//! Unbounded, so `put` never waits. `take` waits while the queue is empty and returns the least element by the comparator.
//! [PriorityBlockingQueue::new] uses the natural order, wrap elements into `std::cmp::Reverse` to get the greatest first.
//!
//! Equal elements come out in insertion order: every entry carries a sequence number that breaks ties.

use std::{cmp::Ordering, time::Duration};

use crate::{
    backoff::deadline_after,
    cancel::{wait_while_cancellable, CancellationToken},
    condvar::Condvar,
    errors::RecvError,
    heap::Heap,
    mutex::{Mutex, MutexGuard},
};

/// The comparator of [PriorityBlockingQueue::new]: `Ord::cmp`
pub type NaturalOrder<Y> = fn(&Y, &Y) -> Ordering;

struct Entry<Y> {
    item: Y,
    seq: u64,
}

struct Pending<Y> {
    heap: Heap<Entry<Y>>,
    next_seq: u64,
}

pub struct PriorityBlockingQueue<Y, C = NaturalOrder<Y>> {
    /// guards the heap and the sequence counter
    pending: Mutex<Pending<Y>>,
    available: Condvar,
    order: C,
}

impl<Y: Ord> PriorityBlockingQueue<Y> {
    pub fn new() -> Self {
        Self::with_comparator(Y::cmp)
    }
}

impl<Y: Ord> Default for PriorityBlockingQueue<Y> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Y, C> PriorityBlockingQueue<Y, C>
where
    C: Fn(&Y, &Y) -> Ordering,
{
    pub fn with_comparator(order: C) -> Self {
        tracing::debug!("priority queue created");
        Self {
            pending: Mutex::new(Pending {
                heap: Heap::new(),
                next_seq: 0,
            }),
            available: Condvar::new(),
            order,
        }
    }

    pub fn put(&self, item: Y) {
        let mut pending = self.pending.lock();
        let seq = pending.next_seq;
        pending.next_seq += 1;
        pending.heap.push(Entry { item, seq }, |a, b| self.compare(a, b));
        self.available.notify_one();
    }

    pub fn take(&self) -> Y {
        let pending = self
            .available
            .wait_while(self.pending.lock(), |p| p.heap.is_empty());
        self.pop(pending)
    }

    pub fn poll(&self) -> Option<Y> {
        let pending = self.pending.lock();
        if pending.heap.is_empty() {
            return None;
        }
        Some(self.pop(pending))
    }

    pub fn try_take(&self, timeout: Duration) -> Result<Y, RecvError> {
        let (pending, result) = self.available.wait_until_while(
            self.pending.lock(),
            deadline_after(timeout),
            |p| p.heap.is_empty(),
        );
        if result.timed_out() {
            tracing::trace!(?timeout, "take timed out");
            return Err(RecvError::Timeout);
        }
        Ok(self.pop(pending))
    }

    pub fn take_cancellable(&self, token: &CancellationToken) -> Result<Y, RecvError> {
        let (pending, cancelled) =
            wait_while_cancellable(&self.available, self.pending.lock(), token, |p| {
                p.heap.is_empty()
            });
        if cancelled {
            tracing::warn!("take cancelled");
            return Err(RecvError::Cancelled);
        }
        Ok(self.pop(pending))
    }

    /// Moves up to `max` elements into `sink`, least first, under one lock.
    pub fn drain_to<E: Extend<Y>>(&self, sink: &mut E, max: usize) -> usize {
        let mut pending = self.pending.lock();
        let n = pending.heap.len().min(max);
        sink.extend((0..n).filter_map(|_| {
            pending
                .heap
                .pop(|a, b| self.compare(a, b))
                .map(|e| e.item)
        }));
        tracing::debug!(drained = n, "batch drained");
        n
    }

    pub fn len(&self) -> usize {
        self.pending.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn compare(&self, a: &Entry<Y>, b: &Entry<Y>) -> Ordering {
        (self.order)(&a.item, &b.item).then(a.seq.cmp(&b.seq))
    }

    fn pop(&self, mut pending: MutexGuard<'_, Pending<Y>>) -> Y {
        let Some(entry) = pending.heap.pop(|a, b| self.compare(a, b)) else {
            unreachable!("pop is only called on a non-empty heap");
        };
        entry.item
    }
}

/// Jobs come out by urgency, ties by arrival
pub fn run() {
    use std::cmp::Reverse;

    let queue = PriorityBlockingQueue::new();
    for (urgency, job) in [(1, "sweep"), (5, "page oncall"), (3, "rotate logs"), (5, "restart db")] {
        queue.put((Reverse(urgency), job));
    }
    while let Some((Reverse(urgency), job)) = queue.poll() {
        tracing::info!(urgency, job, "running");
    }
}
