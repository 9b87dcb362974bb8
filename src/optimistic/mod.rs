//! # Optimistic (stamped) lock
//!
//! A read-write lock whose readers may skip locking altogether:
//! take a stamp, read the data into locals, then [OptimisticLock::validate] the stamp.
//! If a writer got in meanwhile, the stamp doesn't validate and the reader falls back to a proper [OptimisticLock::lock_read].
//! An optimistic read writes nothing to shared memory, so readers don't fight over a cache line.
//!
//! One `AtomicU64` holds the whole state:
//! - bits 0..=30 - number of readers
//! - bit 31 - write-locked
//! - bits 32..=63 - version, bumped by every write unlock
//!
//! A stamp is the state with the reader bits cleared, plus the mode it was issued for.
//! An optimistic stamp validates iff the lock is still at the same version and not write-locked.
//!
//! ## Memory ordering
//!
//! The writer publishes the write bit before touching the data (a release fence after the acquiring CAS),
//! and bumps the version with a Release store after it's done.
//! The reader loads the state with Acquire before reading, and puts an Acquire fence between the reads and the validation.
//! So a reader that overlapped a write in any way either sees the write bit or the new version.
//!
//! ## Sleeping
//!
//! Blocked lockers sleep on a separate futex counter, `wakeups`, same trick as the condvar's.
//! `sleepers` lets unlockers skip the wake call when nobody sleeps.
//! Sleeper registration and unlocking are separated by SeqCst fences, so either the sleeper sees the unlock or the unlocker sees the sleeper.
//!
//! ## Misuse
//!
//! Unlocking with a stamp of the wrong mode or from another lock state panics, as the lock state can't be trusted afterwards.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{
        fence, AtomicU32, AtomicU64,
        Ordering::{Acquire, Relaxed, Release, SeqCst},
    },
};

use atomic_wait::{wait, wake_all};

const READERS: u64 = (1 << 31) - 1;
const WRITER: u64 = 1 << 31;
const VERSION_ONE: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampMode {
    Optimistic,
    Read,
    Write,
}

/// Issued by [OptimisticLock], opaque otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    bits: u64,
    mode: StampMode,
}

impl Stamp {
    pub fn mode(&self) -> StampMode {
        self.mode
    }

    fn version(&self) -> u64 {
        self.bits & !(WRITER | READERS)
    }
}

pub struct OptimisticLock {
    state: AtomicU64,
    wakeups: AtomicU32,
    sleepers: AtomicU32,
}

impl OptimisticLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            wakeups: AtomicU32::new(0),
            sleepers: AtomicU32::new(0),
        }
    }

    /// Never blocks. The stamp won't validate if a writer holds the lock right now.
    pub fn try_optimistic_read(&self) -> Stamp {
        let s = self.state.load(Acquire);
        Stamp {
            bits: s & !READERS,
            mode: StampMode::Optimistic,
        }
    }

    /// Whether no write happened since `stamp` was issued.
    /// Call it after reading the protected data into locals, and use them only on `true`.
    pub fn validate(&self, stamp: Stamp) -> bool {
        // keep the data reads above the state load
        fence(Acquire);
        let current = self.state.load(Relaxed) & !READERS;
        match stamp.mode {
            StampMode::Write => current == stamp.bits,
            StampMode::Optimistic | StampMode::Read => {
                stamp.bits & WRITER == 0 && current == stamp.bits
            }
        }
    }

    pub fn lock_read(&self) -> Stamp {
        loop {
            if let Some(stamp) = self.try_lock_read() {
                return stamp;
            }
            self.sleep_while(|s| s & WRITER != 0);
        }
    }

    pub fn try_lock_read(&self) -> Option<Stamp> {
        let mut s = self.state.load(Relaxed);
        while s & WRITER == 0 {
            assert!(s & READERS < READERS, "too many readers!");
            match self.state.compare_exchange_weak(s, s + 1, Acquire, Relaxed) {
                Ok(_) => {
                    return Some(Stamp {
                        bits: s & !READERS,
                        mode: StampMode::Read,
                    })
                }
                Err(e) => s = e,
            }
        }
        None
    }

    /// # Panics
    /// - if `stamp` isn't a read stamp of this lock's current version
    pub fn unlock_read(&self, stamp: Stamp) {
        assert_eq!(stamp.mode, StampMode::Read, "unlock_read needs a read stamp");
        let mut s = self.state.load(Relaxed);
        loop {
            assert!(
                s & WRITER == 0 && s & READERS != 0 && s & !READERS == stamp.bits,
                "unlock_read with a stamp that doesn't hold a read lock"
            );
            match self.state.compare_exchange_weak(s, s - 1, Release, Relaxed) {
                Ok(_) => break,
                Err(e) => s = e,
            }
        }
        if s & READERS == 1 {
            self.wake_sleepers();
        }
    }

    pub fn lock_write(&self) -> Stamp {
        loop {
            if let Some(stamp) = self.try_lock_write() {
                return stamp;
            }
            self.sleep_while(|s| s & (WRITER | READERS) != 0);
        }
    }

    pub fn try_lock_write(&self) -> Option<Stamp> {
        let s = self.state.load(Relaxed);
        if s & (WRITER | READERS) != 0 {
            return None;
        }
        self.acquire_write(s)
    }

    /// Bumps the version, which invalidates every outstanding optimistic stamp.
    ///
    /// # Panics
    /// - if `stamp` isn't the one returned by the matching `lock_write`
    pub fn unlock_write(&self, stamp: Stamp) {
        assert_eq!(stamp.mode, StampMode::Write, "unlock_write needs a write stamp");
        let s = self.state.load(Relaxed);
        assert_eq!(
            s, stamp.bits,
            "unlock_write with a stamp that doesn't hold the write lock"
        );
        // clears the writer bit too
        self.state
            .store(stamp.version().wrapping_add(VERSION_ONE), Release);
        self.wake_sleepers();
    }

    /// Tries to turn `stamp` into a write stamp without blocking:
    /// - a write stamp is returned as is
    /// - a read stamp converts if we're the only reader
    /// - an optimistic stamp converts if it's still valid and nobody holds the lock
    ///
    /// On `None` the caller keeps whatever `stamp` held, e.g. a read stamp still has to be unlocked.
    pub fn try_convert_to_write(&self, stamp: Stamp) -> Option<Stamp> {
        match stamp.mode {
            StampMode::Write => (self.state.load(Relaxed) == stamp.bits).then_some(stamp),
            StampMode::Read => {
                let write = Stamp {
                    bits: stamp.bits | WRITER,
                    mode: StampMode::Write,
                };
                self.state
                    .compare_exchange(stamp.bits | 1, write.bits, Acquire, Relaxed)
                    .ok()
                    .map(|_| {
                        fence(Release);
                        write
                    })
            }
            StampMode::Optimistic => {
                if stamp.bits & WRITER != 0 {
                    return None;
                }
                self.acquire_write(stamp.bits)
            }
        }
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Relaxed) & WRITER != 0
    }

    pub fn reader_count(&self) -> u32 {
        (self.state.load(Relaxed) & READERS) as u32
    }

    /// write-locks iff the state is exactly `unlocked`
    fn acquire_write(&self, unlocked: u64) -> Option<Stamp> {
        let bits = unlocked | WRITER;
        self.state
            .compare_exchange(unlocked, bits, Acquire, Relaxed)
            .ok()?;
        // the writer bit must be visible before any of the data writes
        fence(Release);
        Some(Stamp {
            bits,
            mode: StampMode::Write,
        })
    }

    fn sleep_while(&self, blocked: impl Fn(u64) -> bool) {
        self.sleepers.fetch_add(1, Relaxed);
        fence(SeqCst);
        let seen = self.wakeups.load(Acquire);
        if blocked(self.state.load(Relaxed)) {
            wait(&self.wakeups, seen);
        }
        self.sleepers.fetch_sub(1, Relaxed);
    }

    fn wake_sleepers(&self) {
        fence(SeqCst);
        if self.sleepers.load(Relaxed) > 0 {
            self.wakeups.fetch_add(1, Release);
            wake_all(&self.wakeups);
        }
    }
}

impl Default for OptimisticLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A `Copy` value behind an [OptimisticLock]: loads try the optimistic path first.
///
/// The optimistic copy races with writers the way every seqlock does (crossbeam's `AtomicCell` included):
/// formally a data race, relied upon only for plain bytes that get discarded unless the stamp validates.
pub struct OptimisticCell<Y> {
    lock: OptimisticLock,
    value: UnsafeCell<Y>,
}

unsafe impl<Y> Sync for OptimisticCell<Y> where Y: Copy + Send {}

impl<Y: Copy> OptimisticCell<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            lock: OptimisticLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn load(&self) -> Y {
        let stamp = self.lock.try_optimistic_read();
        if stamp.bits & WRITER == 0 {
            // SAFETY: this is the usual seqlock read. A concurrent `update` may write the value
            // while we copy it, which is a data race and formally UB in the Rust memory model
            // even through read_volatile and MaybeUninit. In practice the copy is just bytes:
            // it's only assumed init once the stamp validates, i.e. no write overlapped it,
            // and a torn copy is dropped unread. Y: Copy, so dropping it runs no code.
            let copy = unsafe { ptr::read_volatile(self.value.get() as *const MaybeUninit<Y>) };
            if self.lock.validate(stamp) {
                return unsafe { copy.assume_init() };
            }
        }
        tracing::trace!("optimistic read failed, falling back to a read lock");
        let stamp = self.lock.lock_read();
        // SAFETY: the read lock keeps writers out
        let value = unsafe { *self.value.get() };
        self.lock.unlock_read(stamp);
        value
    }

    pub fn store(&self, value: Y) {
        self.update(|_| value);
    }

    /// Replaces the value with `f(old)` under the write lock, returns the new value.
    pub fn update(&self, f: impl FnOnce(Y) -> Y) -> Y {
        let stamp = self.lock.lock_write();
        // SAFETY: the write lock is exclusive
        let new = unsafe {
            let slot = &mut *self.value.get();
            *slot = f(*slot);
            *slot
        };
        self.lock.unlock_write(stamp);
        new
    }

    pub fn lock(&self) -> &OptimisticLock {
        &self.lock
    }
}

/// A point moved by one thread and sampled by another, the pair must never be torn
pub fn run() {
    use std::thread;

    let point = OptimisticCell::new((0i64, 0i64));
    thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=1_000 {
                point.store((i, -i));
            }
        });
        s.spawn(|| {
            let mut torn = 0;
            for _ in 0..1_000 {
                let (x, y) = point.load();
                if x != -y {
                    torn += 1;
                }
            }
            tracing::info!(torn, "sampled the point 1000 times");
        });
    });
    tracing::info!(point = ?point.load(), "final");
}

#[cfg(test)]
mod test {
    use std::{
        thread::{scope, sleep},
        time::Duration,
    };

    use super::*;

    #[test]
    fn validates_without_writes() {
        let lock = OptimisticLock::new();
        let stamp = lock.try_optimistic_read();
        assert_eq!(stamp.mode(), StampMode::Optimistic);
        // readers don't invalidate optimistic stamps
        let r = lock.lock_read();
        assert!(lock.validate(stamp));
        lock.unlock_read(r);
        assert!(lock.validate(stamp));
    }

    #[test]
    fn write_invalidates() {
        let lock = OptimisticLock::new();
        let stamp = lock.try_optimistic_read();
        let w = lock.lock_write();
        // invalid while the writer is in
        assert!(!lock.validate(stamp));
        lock.unlock_write(w);
        // and after it left too
        assert!(!lock.validate(stamp));
        assert!(lock.validate(lock.try_optimistic_read()));
    }

    #[test]
    fn stamp_taken_during_a_write_never_validates() {
        let lock = OptimisticLock::new();
        let w = lock.lock_write();
        let stamp = lock.try_optimistic_read();
        assert!(!lock.validate(stamp));
        lock.unlock_write(w);
        assert!(!lock.validate(stamp));
    }

    #[test]
    fn readers_and_writers_exclude() {
        let lock = OptimisticLock::new();
        let a = lock.lock_read();
        let b = lock.lock_read();
        assert_eq!(lock.reader_count(), 2);
        assert!(lock.try_lock_write().is_none());
        lock.unlock_read(a);
        lock.unlock_read(b);
        let w = lock.try_lock_write().unwrap();
        assert!(lock.is_write_locked());
        assert!(lock.try_lock_read().is_none());
        lock.unlock_write(w);
    }

    #[test]
    fn blocked_writer_wakes_up() {
        let lock = OptimisticLock::new();
        let r = lock.lock_read();
        scope(|s| {
            let writer = s.spawn(|| {
                let w = lock.lock_write();
                lock.unlock_write(w);
            });
            sleep(Duration::from_millis(50));
            assert!(!writer.is_finished());
            lock.unlock_read(r);
        });
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn blocked_reader_wakes_up() {
        let lock = OptimisticLock::new();
        let w = lock.lock_write();
        scope(|s| {
            s.spawn(|| {
                let r = lock.lock_read();
                lock.unlock_read(r);
            });
            sleep(Duration::from_millis(50));
            lock.unlock_write(w);
        });
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn convert_sole_reader() {
        let lock = OptimisticLock::new();
        let r = lock.lock_read();
        let w = lock.try_convert_to_write(r).unwrap();
        assert_eq!(w.mode(), StampMode::Write);
        assert!(lock.is_write_locked());
        lock.unlock_write(w);
    }

    #[test]
    fn convert_fails_with_other_readers() {
        let lock = OptimisticLock::new();
        let a = lock.lock_read();
        let b = lock.lock_read();
        assert!(lock.try_convert_to_write(a).is_none());
        // still holding both read locks
        assert_eq!(lock.reader_count(), 2);
        lock.unlock_read(a);
        lock.unlock_read(b);
    }

    #[test]
    fn convert_optimistic() {
        let lock = OptimisticLock::new();
        let stamp = lock.try_optimistic_read();
        let w = lock.try_convert_to_write(stamp).unwrap();
        lock.unlock_write(w);
        // the version moved on, the old stamp is stale
        assert!(lock.try_convert_to_write(stamp).is_none());
    }

    #[test]
    fn convert_write_is_identity() {
        let lock = OptimisticLock::new();
        let w = lock.lock_write();
        assert_eq!(lock.try_convert_to_write(w), Some(w));
        lock.unlock_write(w);
    }

    #[test]
    #[should_panic(expected = "doesn't hold the write lock")]
    fn stale_write_stamp_panics() {
        let lock = OptimisticLock::new();
        let w = lock.lock_write();
        lock.unlock_write(w);
        lock.unlock_write(w);
    }

    #[test]
    #[should_panic(expected = "needs a read stamp")]
    fn wrong_mode_panics() {
        let lock = OptimisticLock::new();
        let stamp = lock.try_optimistic_read();
        lock.unlock_read(stamp);
    }

    #[test]
    fn cell_is_never_torn() {
        let cell = OptimisticCell::new([0u64; 4]);
        scope(|s| {
            s.spawn(|| {
                for i in 1..=2_000 {
                    cell.store([i; 4]);
                }
            });
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..2_000 {
                        let v = cell.load();
                        assert!(v.iter().all(|x| *x == v[0]), "torn read {v:?}");
                    }
                });
            }
        });
        assert_eq!(cell.load(), [2_000; 4]);
        assert_eq!(cell.update(|v| [v[0] + 1; 4]), [2_001; 4]);
    }
}
