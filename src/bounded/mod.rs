//! # Bounded blocking queue
//!
//! A fixed-capacity ring buffer behind one [Mutex] and two condvars:
//! - `not_full` - producers wait here while all the slots are taken
//! - `not_empty` - consumers wait here while there's nothing to take
//!
//! A full queue makes producers wait, which is the backpressure: nobody can run ahead of the consumers by more than the capacity.
//!
//! Elements come out in the order their `put`s completed.
//! Which of several blocked producers (or consumers) goes first is unspecified.
//!
//! There's no `close`. To stop a consumer, send it a sentinel ("poison pill") it recognizes, see [run].

use std::time::Duration;

use crate::{
    backoff::deadline_after,
    cancel::{wait_while_cancellable, CancellationToken},
    condvar::Condvar,
    errors::{CapacityError, RecvError, SendError},
    mutex::{Mutex, MutexGuard},
};

/// The backing store. An element is present iff it's in `[head, head + count)` mod capacity.
struct Ring<Y> {
    slots: Box<[Option<Y>]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<Y> Ring<Y> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn push(&mut self, item: Y) {
        debug_assert!(!self.is_full());
        debug_assert!(self.slots[self.tail].is_none());
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.count += 1;
    }

    fn pop(&mut self) -> Option<Y> {
        // take() clears the slot so the queue doesn't keep the element alive
        let item = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        Some(item)
    }
}

pub struct BoundedBlockingQueue<Y> {
    /// guards the ring, nothing touches it without this lock
    ring: Mutex<Ring<Y>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<Y> BoundedBlockingQueue<Y> {
    /// Fails right away for a zero capacity. The capacity never changes afterwards.
    pub fn new(capacity: usize) -> Result<Self, CapacityError> {
        if capacity == 0 {
            return Err(CapacityError::Zero);
        }
        tracing::debug!(capacity, "bounded queue created");
        Ok(Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        })
    }

    /// Waits for as long as it takes to get a free slot.
    pub fn put(&self, item: Y) {
        let mut ring = self.ring.lock();
        if ring.is_full() {
            tracing::trace!("queue is full, producer waits");
            ring = self.not_full.wait_while(ring, |r| r.is_full());
        }
        self.enqueue(ring, item);
    }

    /// Waits for as long as it takes to get an element.
    pub fn take(&self) -> Y {
        let mut ring = self.ring.lock();
        if ring.is_empty() {
            tracing::trace!("queue is empty, consumer waits");
            ring = self.not_empty.wait_while(ring, |r| r.is_empty());
        }
        self.dequeue(ring)
    }

    /// Never blocks: a full queue hands the item back.
    pub fn offer(&self, item: Y) -> Result<(), Y> {
        let ring = self.ring.lock();
        if ring.is_full() {
            return Err(item);
        }
        self.enqueue(ring, item);
        Ok(())
    }

    /// Never blocks: `None` for an empty queue.
    pub fn poll(&self) -> Option<Y> {
        let ring = self.ring.lock();
        if ring.is_empty() {
            return None;
        }
        Some(self.dequeue(ring))
    }

    pub fn try_put(&self, item: Y, timeout: Duration) -> Result<(), SendError<Y>> {
        let deadline = deadline_after(timeout);
        let (ring, result) = self
            .not_full
            .wait_until_while(self.ring.lock(), deadline, |r| r.is_full());
        if result.timed_out() {
            tracing::trace!(?timeout, "put timed out");
            return Err(SendError::Timeout(item));
        }
        self.enqueue(ring, item);
        Ok(())
    }

    pub fn try_take(&self, timeout: Duration) -> Result<Y, RecvError> {
        let deadline = deadline_after(timeout);
        let (ring, result) = self
            .not_empty
            .wait_until_while(self.ring.lock(), deadline, |r| r.is_empty());
        if result.timed_out() {
            tracing::trace!(?timeout, "take timed out");
            return Err(RecvError::Timeout);
        }
        Ok(self.dequeue(ring))
    }

    pub fn put_cancellable(&self, item: Y, token: &CancellationToken) -> Result<(), SendError<Y>> {
        let (ring, cancelled) =
            wait_while_cancellable(&self.not_full, self.ring.lock(), token, |r| r.is_full());
        if cancelled {
            tracing::warn!("put cancelled");
            return Err(SendError::Cancelled(item));
        }
        self.enqueue(ring, item);
        Ok(())
    }

    pub fn take_cancellable(&self, token: &CancellationToken) -> Result<Y, RecvError> {
        let (ring, cancelled) =
            wait_while_cancellable(&self.not_empty, self.ring.lock(), token, |r| r.is_empty());
        if cancelled {
            tracing::warn!("take cancelled");
            return Err(RecvError::Cancelled);
        }
        Ok(self.dequeue(ring))
    }

    /// Moves up to `max` elements into `sink` in FIFO order, all under one lock.
    /// Returns how many were moved. Never blocks on an empty queue.
    pub fn drain_to<E: Extend<Y>>(&self, sink: &mut E, max: usize) -> usize {
        let mut ring = self.ring.lock();
        let n = ring.count.min(max);
        sink.extend((0..n).filter_map(|_| ring.pop()));
        if n > 0 {
            // n slots got free at once
            self.not_full.notify_all();
        }
        tracing::debug!(drained = n, "batch drained");
        n
    }

    /// A snapshot, other threads may change it right after the lock is released.
    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many more elements fit right now. Just a snapshot like [Self::len]:
    /// a `put` that relies on it may still block, as other producers can fill the room first.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    // both helpers notify while still holding the lock, the guard drops on return

    fn enqueue(&self, mut ring: MutexGuard<'_, Ring<Y>>, item: Y) {
        ring.push(item);
        self.not_empty.notify_one();
    }

    fn dequeue(&self, mut ring: MutexGuard<'_, Ring<Y>>) -> Y {
        let Some(item) = ring.pop() else {
            unreachable!("dequeue is only called on a non-empty ring");
        };
        self.not_full.notify_one();
        item
    }
}

/// Producer / consumer with a poison pill: `None` tells the consumer to stop.
pub fn run() {
    use std::thread;

    let queue = match BoundedBlockingQueue::<Option<u32>>::new(2) {
        Ok(queue) => queue,
        Err(e) => {
            tracing::error!(%e, "can't build the queue");
            return;
        }
    };

    thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=5 {
                queue.put(Some(i));
                tracing::info!(i, "produced");
            }
            queue.put(None);
        });
        s.spawn(|| {
            while let Some(i) = queue.take() {
                tracing::info!(i, "consumed");
                thread::sleep(Duration::from_millis(20));
            }
            tracing::info!("poison pill received, consumer stops");
        });
    });
}
