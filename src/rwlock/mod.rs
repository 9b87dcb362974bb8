//! # Read-write lock
//!
//! It works similarly to the [Mutex](crate::mutex::Mutex), but allows 2 kinds of locking:
//! - exclusive / write - one at a time, allows modifications
//! - shared / read - there can be many, but they don't allow modifications
//!
//! Only one kind is held at any moment.
//!
//! A single `AtomicU32` tracks everything:
//! - `0` - not locked
//! - `N` - number of readers
//! - `u32::MAX` - write-locked
//!
//! All the memory ordering below is for the users: Release on unlocking and Acquire on locking.
//!
//! ## Downgrade
//!
//! [WriteGuard::downgrade] turns the write lock into a read lock by storing `1` over `u32::MAX`.
//! The state never passes through `0`, so no other writer can squeeze in between.
//!
//! ## No upgrade
//!
//! There's no read -> write upgrade. Two readers upgrading at once would wait for each other forever.
//! Drop the read guard, take the write lock and re-check whatever was read before.

use std::{
    cell::UnsafeCell,
    mem,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicU32,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use atomic_wait::{wait, wake_all, wake_one};

const WRITE_LOCKED: u32 = u32::MAX;

pub struct RwLock<Y> {
    state: AtomicU32,
    value: UnsafeCell<Y>,
}

/// Readers on different threads see the same `&Y` at once,
/// so Y has to be not only Send, but also Sync
unsafe impl<Y> Sync for RwLock<Y> where Y: Send + Sync {}

impl<Y> RwLock<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            state: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Shared lock, waits while a writer holds the lock.
    pub fn read(&self) -> ReadGuard<'_, Y> {
        let mut s = self.state.load(Relaxed);
        loop {
            if s < WRITE_LOCKED {
                // don't let readers count up into the write-locked value
                assert!(s < WRITE_LOCKED - 2, "too many readers!");
                // weak is fine, a spurious failure is just another round
                match self.state.compare_exchange_weak(s, s + 1, Acquire, Relaxed) {
                    Ok(_) => return ReadGuard { lock: self },
                    Err(e) => s = e,
                }
            }
            if s == WRITE_LOCKED {
                wait(&self.state, WRITE_LOCKED);
                s = self.state.load(Relaxed);
            }
        }
    }

    /// Exclusive lock, waits until there're no readers and no writer.
    pub fn write(&self) -> WriteGuard<'_, Y> {
        while let Err(s) = self
            .state
            .compare_exchange(0, WRITE_LOCKED, Acquire, Relaxed)
        {
            // hang on the observed value until it changes
            wait(&self.state, s);
        }
        WriteGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_, Y>> {
        let mut s = self.state.load(Relaxed);
        while s < WRITE_LOCKED - 2 {
            match self.state.compare_exchange_weak(s, s + 1, Acquire, Relaxed) {
                Ok(_) => return Some(ReadGuard { lock: self }),
                Err(e) => s = e,
            }
        }
        None
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_, Y>> {
        self.state
            .compare_exchange(0, WRITE_LOCKED, Acquire, Relaxed)
            .ok()
            .map(|_| WriteGuard { lock: self })
    }

    pub fn reader_count(&self) -> u32 {
        match self.state.load(Relaxed) {
            WRITE_LOCKED => 0,
            n => n,
        }
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Relaxed) == WRITE_LOCKED
    }

    pub fn into_inner(self) -> Y {
        self.value.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut Y {
        self.value.get_mut()
    }
}

impl<Y: Default> Default for RwLock<Y> {
    fn default() -> Self {
        Self::new(Y::default())
    }
}

pub struct ReadGuard<'a, Y> {
    lock: &'a RwLock<Y>,
}

/// Read guard's main purpose - provide &Y
impl<Y> Deref for ReadGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: a read guard exists => no writer does
        unsafe { &*self.lock.value.get() }
    }
}

/// Decrement the readers and, if it was the last one, wake one (any) of the writers
impl<Y> Drop for ReadGuard<'_, Y> {
    fn drop(&mut self) {
        let previous = self.lock.state.fetch_sub(1, Release);
        debug_assert!(
            previous != 0 && previous != WRITE_LOCKED,
            "read unlock of a lock that isn't read-locked"
        );
        if previous == 1 {
            wake_one(&self.lock.state);
        }
    }
}

pub struct WriteGuard<'a, Y> {
    lock: &'a RwLock<Y>,
}

impl<'a, Y> WriteGuard<'a, Y> {
    /// Turns the write lock into a read lock with no gap where another writer could get in.
    pub fn downgrade(self) -> ReadGuard<'a, Y> {
        let lock = self.lock;
        // we're in charge of the unlocking from now on, skip the write guard's drop
        mem::forget(self);
        lock.state.store(1, Release);
        // readers blocked on the writer may join us now
        wake_all(&lock.state);
        ReadGuard { lock }
    }
}

/// Write guard also allows to just read the data
impl<Y> Deref for WriteGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: a write guard is exclusive
        unsafe { &*self.lock.value.get() }
    }
}

/// write guard's main purpose - get &mut Y
impl<Y> DerefMut for WriteGuard<'_, Y> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: a write guard is exclusive
        unsafe { &mut *self.lock.value.get() }
    }
}

/// We can't tell who and how many are waiting for the lock, so tell 'em all
impl<Y> Drop for WriteGuard<'_, Y> {
    fn drop(&mut self) {
        debug_assert_eq!(self.lock.state.load(Relaxed), WRITE_LOCKED);
        self.lock.state.store(0, Release);
        wake_all(&self.lock.state);
    }
}

/// A cache refresh: write, then keep reading what we wrote
pub fn run() {
    use std::thread;

    let cache = RwLock::new(Vec::<u32>::new());
    thread::scope(|s| {
        for id in 0..3 {
            let cache = &cache;
            s.spawn(move || {
                let mut w = cache.write();
                w.push(id);
                let r = w.downgrade();
                tracing::info!(id, len = r.len(), "refreshed, reading under the downgraded lock");
            });
        }
    });
    tracing::info!(entries = ?*cache.read(), "final cache");
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
        thread::{scope, sleep},
        time::Duration,
    };

    use super::*;

    #[test]
    fn readers_share() {
        let lock = RwLock::new(5);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 10);
        assert_eq!(lock.reader_count(), 2);
        assert!(lock.try_write().is_none());
        drop((a, b));
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = RwLock::new(0);
        let mut w = lock.write();
        assert!(lock.is_write_locked());
        assert!(lock.try_read().is_none());
        scope(|s| {
            let reader = s.spawn(|| *lock.read());
            sleep(Duration::from_millis(50));
            *w = 9;
            drop(w);
            assert_eq!(reader.join().unwrap(), 9);
        });
    }

    #[test]
    fn exclusivity_under_load() {
        let lock = RwLock::new(());
        let readers = AtomicUsize::new(0);
        let writers = AtomicUsize::new(0);
        let max_readers = AtomicUsize::new(0);
        scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let _r = lock.read();
                        let now = readers.fetch_add(1, SeqCst) + 1;
                        max_readers.fetch_max(now, SeqCst);
                        assert_eq!(writers.load(SeqCst), 0);
                        readers.fetch_sub(1, SeqCst);
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let _w = lock.write();
                        assert_eq!(writers.fetch_add(1, SeqCst), 0);
                        assert_eq!(readers.load(SeqCst), 0);
                        writers.fetch_sub(1, SeqCst);
                    }
                });
            }
        });
        assert!(max_readers.load(SeqCst) <= 4);
    }

    #[test]
    fn downgrade_keeps_writers_out() {
        let lock = RwLock::new(0);
        let mut w = lock.write();
        *w = 1;
        let r = w.downgrade();
        assert_eq!(lock.reader_count(), 1);
        // other readers are welcome, writers are not
        assert!(lock.try_read().is_some());
        assert!(lock.try_write().is_none());
        assert_eq!(*r, 1);
        drop(r);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn downgrade_wakes_blocked_readers() {
        let lock = RwLock::new(0);
        scope(|s| {
            let mut w = lock.write();
            let reader = s.spawn(|| *lock.read());
            sleep(Duration::from_millis(50));
            *w = 3;
            let r = w.downgrade();
            // the reader gets in while we still hold the downgraded lock
            assert_eq!(reader.join().unwrap(), 3);
            drop(r);
        });
    }
}
