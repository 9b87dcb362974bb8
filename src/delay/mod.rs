//! # Delay blocking queue
//!
//! Unbounded, elements are released by time: `take` returns the element with the earliest release time,
//! but not before that time has come.
//! Elements released at the same instant come out in insertion order.
//!
//! A taker sleeps until the head's release time, and re-computes the wait on every wakeup:
//! a `put` of an earlier element becomes the new head and notifies, so the sleeper doesn't oversleep.
//! A taker that got an element notifies the next one, as the new head may be due already.

use std::{
    cmp::Ordering,
    time::{Duration, Instant},
};

use crate::{
    backoff::deadline_after,
    cancel::{CancellationToken, POLL_INTERVAL},
    condvar::Condvar,
    errors::RecvError,
    heap::Heap,
    mutex::{Mutex, MutexGuard},
};

struct Scheduled<Y> {
    release_at: Instant,
    seq: u64,
    item: Y,
}

fn by_release_time<Y>(a: &Scheduled<Y>, b: &Scheduled<Y>) -> Ordering {
    a.release_at
        .cmp(&b.release_at)
        .then(a.seq.cmp(&b.seq))
}

struct Schedule<Y> {
    heap: Heap<Scheduled<Y>>,
    next_seq: u64,
}

impl<Y> Schedule<Y> {
    /// release time of the head, if any
    fn next_release(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.release_at)
    }

    fn head_is_due(&self, now: Instant) -> bool {
        self.next_release().is_some_and(|at| at <= now)
    }
}

pub struct DelayBlockingQueue<Y> {
    /// guards the heap and the sequence counter
    schedule: Mutex<Schedule<Y>>,
    available: Condvar,
}

impl<Y> DelayBlockingQueue<Y> {
    pub fn new() -> Self {
        tracing::debug!("delay queue created");
        Self {
            schedule: Mutex::new(Schedule {
                heap: Heap::new(),
                next_seq: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Schedules `item` for release after `delay`.
    pub fn put(&self, item: Y, delay: Duration) {
        self.put_at(item, deadline_after(delay));
    }

    /// Schedules `item` for release at `release_at`. Past instants are due right away.
    pub fn put_at(&self, item: Y, release_at: Instant) {
        let mut schedule = self.schedule.lock();
        let seq = schedule.next_seq;
        schedule.next_seq += 1;
        schedule.heap.push(
            Scheduled {
                release_at,
                seq,
                item,
            },
            by_release_time,
        );
        // only a new head changes what the takers wait for
        if schedule.heap.peek().is_some_and(|head| head.seq == seq) {
            self.available.notify_one();
        }
    }

    /// Waits for the earliest element to become due.
    pub fn take(&self) -> Y {
        let mut schedule = self.schedule.lock();
        loop {
            match schedule.next_release() {
                None => schedule = self.available.wait(schedule),
                Some(at) if at <= Instant::now() => return self.pop(schedule),
                Some(at) => {
                    tracing::trace!(wait = ?at.saturating_duration_since(Instant::now()), "head not due yet");
                    schedule = self.available.wait_until(schedule, at).0;
                }
            }
        }
    }

    /// A due element, if there's one right now.
    pub fn poll(&self) -> Option<Y> {
        let schedule = self.schedule.lock();
        if !schedule.head_is_due(Instant::now()) {
            return None;
        }
        Some(self.pop(schedule))
    }

    pub fn try_take(&self, timeout: Duration) -> Result<Y, RecvError> {
        let deadline = deadline_after(timeout);
        let mut schedule = self.schedule.lock();
        loop {
            let now = Instant::now();
            if schedule.head_is_due(now) {
                return Ok(self.pop(schedule));
            }
            if now >= deadline {
                tracing::trace!(?timeout, "take timed out");
                return Err(RecvError::Timeout);
            }
            let wake_at = schedule
                .next_release()
                .map_or(deadline, |at| at.min(deadline));
            schedule = self.available.wait_until(schedule, wake_at).0;
        }
    }

    pub fn take_cancellable(&self, token: &CancellationToken) -> Result<Y, RecvError> {
        let mut schedule = self.schedule.lock();
        loop {
            let now = Instant::now();
            if schedule.head_is_due(now) {
                return Ok(self.pop(schedule));
            }
            if token.is_cancelled() {
                tracing::warn!("take cancelled");
                return Err(RecvError::Cancelled);
            }
            let slice_end = now + POLL_INTERVAL;
            let wake_at = schedule
                .next_release()
                .map_or(slice_end, |at| at.min(slice_end));
            schedule = self.available.wait_until(schedule, wake_at).0;
        }
    }

    /// Moves up to `max` due elements into `sink`, earliest first. Pending ones stay.
    pub fn drain_to<E: Extend<Y>>(&self, sink: &mut E, max: usize) -> usize {
        let mut schedule = self.schedule.lock();
        let now = Instant::now();
        let mut n = 0;
        while n < max && schedule.head_is_due(now) {
            match schedule.heap.pop(by_release_time) {
                Some(e) => sink.extend(Some(e.item)),
                None => break,
            }
            n += 1;
        }
        tracing::debug!(drained = n, "due elements drained");
        n
    }

    /// All the elements, due or not.
    pub fn len(&self) -> usize {
        self.schedule.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How long until the head is due, zero if it's due already.
    pub fn next_delay(&self) -> Option<Duration> {
        self.schedule
            .lock()
            .next_release()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn pop(&self, mut schedule: MutexGuard<'_, Schedule<Y>>) -> Y {
        let Some(entry) = schedule.heap.pop(by_release_time) else {
            unreachable!("pop is only called with a due head");
        };
        // the next head may be due already, let another taker look at it
        if !schedule.heap.is_empty() {
            self.available.notify_one();
        }
        entry.item
    }
}

impl<Y> Default for DelayBlockingQueue<Y> {
    fn default() -> Self {
        Self::new()
    }
}

/// Retries scheduled out of order come out by due time
pub fn run() {
    let queue = DelayBlockingQueue::new();
    let start = Instant::now();
    queue.put("retry #3", Duration::from_millis(150));
    queue.put("retry #1", Duration::from_millis(50));
    queue.put("retry #2", Duration::from_millis(100));
    for _ in 0..3 {
        let job = queue.take();
        tracing::info!(job, elapsed = ?start.elapsed(), "released");
    }
}
