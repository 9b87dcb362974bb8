//! # Condition variable
//!
//! The condvar's interface consists of the wait method that unlocks the mutex, waits for a signal then locks the mutex back.
//! There're 2 notification modes:
//! - "notify one" / signal
//! - "notify all" / broadcast
//!
//! As the futex, the condvar may wake spuriously and it re-locks the mutex in this case too.
//! Callers re-check their predicate in a loop, [Condvar::wait_while] does exactly that.
//!
//! The futex's atomic is used as a notification counter.
//! A waiter remembers the counter while still holding the mutex, so any notification sent after the unlock changes it
//! and the futex wait either doesn't block or gets woken.
//!
//! ## Avoiding syscalls
//!
//! Waiting is the expected thing for condvars, but waking nobody isn't.
//! `num_waiters` lets the notifiers skip the wake call when nobody waits.
//! Waiters register while holding the mutex, so a notifier that locked the mutex afterwards always sees them.
//! That's why notifying must happen while holding the mutex, or at least after locking it once.
//!
//! ## Timed waits
//!
//! The futex wait can't time out, so a timed waiter parks its thread until the deadline instead.
//! It registers its thread handle in `timed_waiters` before unlocking, and every notification unparks all of them.
//! An unpark that comes before the park isn't lost: the park returns right away on it.
//! A notify_one may thus wake a futex sleeper and every timed waiter: that's just spurious wakeups.
//!
//! ## One mutex
//!
//! The condvar remembers the address of the mutex while anybody waits on it, and waiting with another mutex meanwhile panics.
//! The last waiter to leave forgets the address, so moving the condvar together with its mutex between waits is fine.
//!
//! ## Counter overflow
//!
//! A waiter misses its wakeup if exactly 2^32 notifications happen while it's between the load and the wait.
//! We consider that negligible.

use std::{
    sync::atomic::{
        AtomicU32, AtomicUsize,
        Ordering::{Acquire, Relaxed},
    },
    thread::{self, Thread},
    time::{Duration, Instant},
};

use atomic_wait::{wait, wake_all, wake_one};

use crate::{
    backoff::deadline_after,
    mutex::{Mutex, MutexGuard},
};

/// Why a timed wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

impl WaitResult {
    pub fn timed_out(self) -> bool {
        self == WaitResult::TimedOut
    }
}

pub struct Condvar {
    counter: AtomicU32,
    // no worries about overflows, it can count all the threads there are
    num_waiters: AtomicUsize,
    /// threads in a timed wait, unparked on every notification
    timed_waiters: Mutex<Vec<Thread>>,
    /// address of the mutex the current waiters use, 0 when nobody waits
    mutex: AtomicUsize,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
            num_waiters: AtomicUsize::new(0),
            timed_waiters: Mutex::new(Vec::new()),
            mutex: AtomicUsize::new(0),
        }
    }

    pub fn notify_one(&self) {
        if self.num_waiters.load(Relaxed) > 0 {
            self.counter.fetch_add(1, Relaxed);
            wake_one(&self.counter);
            self.unpark_timed_waiters();
        }
    }

    pub fn notify_all(&self) {
        if self.num_waiters.load(Relaxed) > 0 {
            self.counter.fetch_add(1, Relaxed);
            wake_all(&self.counter);
            self.unpark_timed_waiters();
        }
    }

    /// Takes and returns a guard as a proof that the mutex is locked.
    /// May return without a notification.
    pub fn wait<'a, Y>(&self, guard: MutexGuard<'a, Y>) -> MutexGuard<'a, Y> {
        self.bind(&guard);
        self.num_waiters.fetch_add(1, Relaxed);

        let original_counter_value = self.counter.load(Relaxed);
        let mutex = guard.mutex;
        drop(guard);

        // sleeps only if nothing was notified since the load
        wait(&self.counter, original_counter_value);

        self.leave();
        mutex.lock()
    }

    /// Waits until `condition` turns false. Spurious wakeups are absorbed here.
    pub fn wait_while<'a, Y, F>(
        &self,
        mut guard: MutexGuard<'a, Y>,
        mut condition: F,
    ) -> MutexGuard<'a, Y>
    where
        F: FnMut(&mut Y) -> bool,
    {
        while condition(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    pub fn wait_for<'a, Y>(
        &self,
        guard: MutexGuard<'a, Y>,
        timeout: Duration,
    ) -> (MutexGuard<'a, Y>, WaitResult) {
        self.wait_until(guard, deadline_after(timeout))
    }

    /// A single wait, bounded by `deadline`. The mutex is locked again in either case.
    pub fn wait_until<'a, Y>(
        &self,
        guard: MutexGuard<'a, Y>,
        deadline: Instant,
    ) -> (MutexGuard<'a, Y>, WaitResult) {
        self.bind(&guard);
        self.num_waiters.fetch_add(1, Relaxed);
        let me = thread::current();
        self.timed_waiters.lock().push(me.clone());

        let original_counter_value = self.counter.load(Relaxed);
        let mutex = guard.mutex;
        drop(guard);

        let (result, _) = self.park_until(original_counter_value, deadline);

        {
            let mut timed = self.timed_waiters.lock();
            if let Some(i) = timed.iter().position(|t| t.id() == me.id()) {
                timed.swap_remove(i);
            }
        }
        self.leave();
        (mutex.lock(), result)
    }

    /// Waits while `condition` holds, for `timeout` in total.
    /// Returns [WaitResult::TimedOut] only if the condition still holds at the end.
    pub fn wait_for_while<'a, Y, F>(
        &self,
        guard: MutexGuard<'a, Y>,
        timeout: Duration,
        condition: F,
    ) -> (MutexGuard<'a, Y>, WaitResult)
    where
        F: FnMut(&mut Y) -> bool,
    {
        self.wait_until_while(guard, deadline_after(timeout), condition)
    }

    pub fn wait_until_while<'a, Y, F>(
        &self,
        mut guard: MutexGuard<'a, Y>,
        deadline: Instant,
        mut condition: F,
    ) -> (MutexGuard<'a, Y>, WaitResult)
    where
        F: FnMut(&mut Y) -> bool,
    {
        while condition(&mut guard) {
            let (g, result) = self.wait_until(guard, deadline);
            guard = g;
            if result.timed_out() && condition(&mut guard) {
                return (guard, WaitResult::TimedOut);
            }
        }
        (guard, WaitResult::Signaled)
    }

    /// Parks until the counter moves away from `original` or the deadline passes.
    /// Also returns the number of parks it took.
    fn park_until(&self, original: u32, deadline: Instant) -> (WaitResult, u32) {
        let mut parks = 0;
        loop {
            if self.counter.load(Acquire) != original {
                return (WaitResult::Signaled, parks);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return (WaitResult::TimedOut, parks);
            }
            thread::park_timeout(left);
            parks += 1;
        }
    }

    fn unpark_timed_waiters(&self) {
        for t in self.timed_waiters.lock().iter() {
            t.unpark();
        }
    }

    fn leave(&self) {
        if self.num_waiters.fetch_sub(1, Relaxed) == 1 {
            // nobody waits anymore, the owner may move the mutex elsewhere
            self.mutex.store(0, Relaxed);
        }
    }

    /// Concurrent waiters must all use the same mutex.
    fn bind<Y>(&self, guard: &MutexGuard<'_, Y>) {
        let addr = guard.mutex as *const _ as usize;
        if let Err(bound) = self.mutex.compare_exchange(0, addr, Relaxed, Relaxed) {
            assert_eq!(
                bound, addr,
                "a condition variable must always be used with the same mutex"
            );
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

/// A two-thread handshake over a flag
pub fn run() {
    let ready = Mutex::new(false);
    let cv = Condvar::new();
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(100));
            *ready.lock() = true;
            cv.notify_one();
        });
        let (_, result) = cv.wait_for_while(ready.lock(), Duration::from_secs(1), |r| !*r);
        tracing::info!(?result, "waited for the flag");
    });
}

#[cfg(test)]
mod test {
    use std::{
        sync::Arc,
        thread::{scope, sleep},
    };

    use super::*;

    #[test]
    fn test_condvar() {
        let mutex = Mutex::new(0);
        let condvar = Condvar::new();

        let mut wakeups = 0;
        scope(|s| {
            s.spawn(|| {
                // simulate some work here to let the other thread lock
                sleep(Duration::from_millis(200));
                let mut g = mutex.lock();
                *g = 123;
                condvar.notify_one();
            });

            let mut g = mutex.lock();
            while *g < 100 {
                g = condvar.wait(g);
                wakeups += 1;
            }

            assert_eq!(*g, 123);
        });

        // the waiting actually happened (plus maybe a couple of spurious wakeups)
        assert!(wakeups < 10);
    }

    #[test]
    fn notify_all_wakes_everybody() {
        let go = Mutex::new(false);
        let done = Mutex::new(0);
        let cv = Condvar::new();
        scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let _g = cv.wait_while(go.lock(), |go| !*go);
                    *done.lock() += 1;
                });
            }
            sleep(Duration::from_millis(100));
            let mut g = go.lock();
            *g = true;
            cv.notify_all();
        });
        assert_eq!(*done.lock(), 4);
    }

    #[test]
    fn timed_wait_times_out() {
        let m = Mutex::new(());
        let cv = Condvar::new();
        let start = Instant::now();
        let (_g, result) = cv.wait_for(m.lock(), Duration::from_millis(100));
        assert_eq!(result, WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn timed_wait_gets_signaled() {
        let m = Mutex::new(false);
        let cv = Condvar::new();
        scope(|s| {
            s.spawn(|| {
                sleep(Duration::from_millis(50));
                let mut g = m.lock();
                *g = true;
                cv.notify_one();
            });
            let (g, result) = cv.wait_for_while(m.lock(), Duration::from_secs(5), |ready| !*ready);
            assert_eq!(result, WaitResult::Signaled);
            assert!(*g);
        });
    }

    #[test]
    fn no_wake_calls_without_waiters() {
        let cv = Condvar::new();
        cv.notify_one();
        cv.notify_all();
        assert_eq!(cv.counter.load(Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "same mutex")]
    fn two_mutexes_is_a_bug() {
        let a = Mutex::new(());
        let b = Mutex::new(());
        let cv = Condvar::new();
        scope(|s| {
            s.spawn(|| cv.wait_for(a.lock(), Duration::from_millis(300)).1);
            sleep(Duration::from_millis(50));
            let _ = cv.wait_for(b.lock(), Duration::from_millis(1));
        });
    }

    #[test]
    fn moving_between_waits() {
        let m = Mutex::new(0);
        let cv = Condvar::new();
        let _ = cv.wait_for(m.lock(), Duration::from_millis(1));

        let pair = Arc::new((m, cv));
        scope(|s| {
            s.spawn(|| {
                sleep(Duration::from_millis(50));
                *pair.0.lock() = 1;
                pair.1.notify_all();
            });
            let (m, cv) = &*pair;
            let g = cv.wait_while(m.lock(), |v| *v == 0);
            assert_eq!(*g, 1);
        });
    }

    #[test]
    fn timed_wait_sleeps_instead_of_polling() {
        let cv = Condvar::new();
        let start = Instant::now();
        let (result, parks) =
            cv.park_until(cv.counter.load(Relaxed), start + Duration::from_millis(200));
        assert_eq!(result, WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(200));
        // one park for the whole wait, a few more for spurious returns at most
        assert!(parks < 10, "parked {parks} times");
    }

    #[test]
    fn long_timed_wait_is_woken_promptly() {
        let m = Mutex::new(false);
        let cv = Condvar::new();
        scope(|s| {
            s.spawn(|| {
                sleep(Duration::from_millis(50));
                *m.lock() = true;
                cv.notify_one();
            });
            let start = Instant::now();
            let (g, result) = cv.wait_for_while(m.lock(), Duration::from_secs(30), |ready| !*ready);
            assert_eq!(result, WaitResult::Signaled);
            assert!(*g);
            assert!(start.elapsed() < Duration::from_secs(5));
        });
        assert!(cv.timed_waiters.lock().is_empty());
    }
}
