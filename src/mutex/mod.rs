//! # Mutex
//!
//! A futex-style mutex over a single `AtomicU32`, woken through the [atomic-wait](https://crates.io/crates/atomic-wait) crate:
//! - `wait(&AtomicU32, u32)` - blocks only if the atomic still holds the value, may wake up spuriously
//! - `wake_one(&AtomicU32)` - wakes a single thread waiting on the atomic
//!
//! The state has 3 values:
//! - `0` - unlocked
//! - `1` - locked, nobody is waiting
//! - `2` - locked, other threads may be waiting
//!
//! Uncontended lock and unlock never make a syscall. Unlock only wakes if the state says somebody's waiting.
//! A contended lock spins for a short while first, as most critical sections are short.
//!
//! ## Timed and cancellable locking
//!
//! The futex wait can't time out, so [Mutex::try_lock_for] and [Mutex::lock_cancellable] poll with a [Backoff] instead.
//! They never switch the state to `2`, as they never sleep on the futex.
//! That's fine: a thread that does sleep on it always leaves a `2` behind, so no wakeup gets lost.
//!
//! ## Hazards
//!
//! The mutex isn't reentrant. Locking it twice from the same thread deadlocks.
//! Unlocking happens by dropping the guard, so only the owner can ever unlock.
//! There's no fairness: a waking thread competes with newcomers, whichever is first wins.

use std::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicU32,
        Ordering::{Acquire, Relaxed, Release},
    },
    time::{Duration, Instant},
};

use atomic_wait::{wait, wake_one};

use crate::{
    backoff::{deadline_after, Backoff},
    cancel::CancellationToken,
    errors::LockError,
};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

pub struct Mutex<Y> {
    state: AtomicU32,
    value: UnsafeCell<Y>,
}

/// promise to the compiler that it's safe to share if the underlying value is safe to send
unsafe impl<Y> Sync for Mutex<Y> where Y: Send {}

impl<Y> Mutex<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            value: UnsafeCell::new(value),
        }
    }

    /// Blocks until the lock is ours.
    pub fn lock(&self) -> MutexGuard<'_, Y> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_err()
        {
            Self::lock_contended(&self.state);
        }
        MutexGuard { mutex: self }
    }

    /// Takes the lock only if it's free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Y>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .ok()
            .map(|_| MutexGuard { mutex: self })
    }

    /// Gives up with `None` if the lock isn't ours within `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, Y>> {
        self.try_lock_until(deadline_after(timeout))
    }

    pub fn try_lock_until(&self, deadline: Instant) -> Option<MutexGuard<'_, Y>> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return Some(guard);
            }
            if Instant::now() >= deadline {
                tracing::trace!("timed out waiting for a mutex");
                return None;
            }
            backoff.snooze(Some(deadline));
        }
    }

    /// Like [Mutex::lock], but stops waiting as soon as `token` is cancelled.
    /// A free lock is taken even if the token is already cancelled.
    pub fn lock_cancellable(
        &self,
        token: &CancellationToken,
    ) -> Result<MutexGuard<'_, Y>, LockError> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return Ok(guard);
            }
            if token.is_cancelled() {
                tracing::warn!("mutex acquisition cancelled");
                return Err(LockError::Cancelled);
            }
            backoff.snooze(None);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Relaxed) != UNLOCKED
    }

    /// no locking needed - having `self` by value proves nobody else holds it
    pub fn into_inner(self) -> Y {
        self.value.into_inner()
    }

    /// same story, `&mut self` is exclusive already
    pub fn get_mut(&mut self) -> &mut Y {
        self.value.get_mut()
    }

    /// The waiting logic for a locked mutex:
    /// - spin for some cycles
    /// - engage the wait syscall if still locked
    #[cold]
    fn lock_contended(state: &AtomicU32) {
        let mut spin_count = 0;

        // use load here, as compare_exchange has an impact on cache perf
        // only check for 1, as 2 means that the other threads already gave up spinning
        while state.load(Relaxed) == LOCKED && spin_count < 100 {
            spin_count += 1;
            hint::spin_loop();
        }

        if state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_ok()
        {
            return;
        }

        // leave 2 behind, there may be other sleepers we can't see
        while state.swap(CONTENDED, Acquire) != UNLOCKED {
            wait(state, CONTENDED);
        }
    }
}

impl<Y: Default> Default for Mutex<Y> {
    fn default() -> Self {
        Self::new(Y::default())
    }
}

/// Proof of holding the lock. Dropping it is the only way to unlock.
pub struct MutexGuard<'a, Y> {
    pub(crate) mutex: &'a Mutex<Y>,
}

unsafe impl<Y> Send for MutexGuard<'_, Y> where Y: Send {}
unsafe impl<Y> Sync for MutexGuard<'_, Y> where Y: Sync {}

impl<Y> Deref for MutexGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: existence of the guard means the lock is ours
        unsafe { &*self.mutex.value.get() }
    }
}

impl<Y> DerefMut for MutexGuard<'_, Y> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: existence of the guard means the lock is ours
        unsafe { &mut *self.mutex.value.get() }
    }
}

/// There're no guarantees that the lock will be obtained by the thread we wake up.
impl<Y> Drop for MutexGuard<'_, Y> {
    fn drop(&mut self) {
        // wake only if someone switched the state to 2
        if self.mutex.state.swap(UNLOCKED, Release) == CONTENDED {
            wake_one(&self.mutex.state);
        }
    }
}

/// A small tour, see the tests for the rest
pub fn run() {
    use std::thread;

    let counter = Mutex::new(0u64);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..10_000 {
                    *counter.lock() += 1;
                }
            });
        }
    });
    tracing::info!(total = *counter.lock(), "4 threads x 10k increments");

    let held = counter.lock();
    let attempt = thread::scope(|s| {
        s.spawn(|| counter.try_lock_for(Duration::from_millis(50)).is_some())
            .join()
            .unwrap_or(false)
    });
    tracing::info!(acquired = attempt, "timed lock while the mutex is held elsewhere");
    drop(held);
}

#[cfg(test)]
mod test {
    use std::{
        thread::{scope, sleep},
        time::Instant,
    };

    use super::*;

    #[test]
    fn counts_under_contention() {
        let m = Mutex::new(0);
        scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..5_000 {
                        *m.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(m.into_inner(), 40_000);
    }

    #[test]
    fn try_lock_does_not_block() {
        let m = Mutex::new(());
        let g = m.lock();
        assert!(m.is_locked());
        scope(|s| {
            s.spawn(|| assert!(m.try_lock().is_none()));
        });
        drop(g);
        assert!(!m.is_locked());
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn timed_lock_gives_up() {
        let m = Mutex::new(());
        let _g = m.lock();
        scope(|s| {
            s.spawn(|| {
                let start = Instant::now();
                assert!(m.try_lock_for(Duration::from_millis(100)).is_none());
                assert!(start.elapsed() >= Duration::from_millis(100));
            });
        });
    }

    #[test]
    fn timed_lock_succeeds_once_released() {
        let m = Mutex::new(1);
        scope(|s| {
            let g = m.lock();
            let waiter = s.spawn(|| m.try_lock_for(Duration::from_secs(5)).map(|g| *g));
            sleep(Duration::from_millis(50));
            drop(g);
            assert_eq!(waiter.join().unwrap(), Some(1));
        });
    }

    #[test]
    fn cancellable_lock() {
        let m = Mutex::new(());
        let token = CancellationToken::new();
        let g = m.lock();
        scope(|s| {
            let waiter = s.spawn(|| m.lock_cancellable(&token).map(|_| ()));
            sleep(Duration::from_millis(50));
            token.cancel();
            assert_eq!(waiter.join().unwrap(), Err(LockError::Cancelled));
        });
        drop(g);
        // a free lock is taken even with a cancelled token
        assert!(m.lock_cancellable(&token).is_ok());
    }

    #[test]
    fn sleepers_get_woken() {
        // the main thread holds the lock long enough for the others to reach the futex wait
        let m = Mutex::new(Vec::new());
        scope(|s| {
            let g = m.lock();
            for i in 0..4 {
                let m = &m;
                s.spawn(move || m.lock().push(i));
            }
            sleep(Duration::from_millis(100));
            drop(g);
        });
        let mut v = m.into_inner();
        v.sort();
        assert_eq!(v, [0, 1, 2, 3]);
    }

    #[test]
    fn get_mut_skips_locking() {
        let mut m = Mutex::new(5);
        *m.get_mut() += 1;
        assert_eq!(*m.lock(), 6);
    }
}
