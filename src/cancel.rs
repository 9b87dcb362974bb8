//! # Cancellation
//!
//! The locks and condvars have no notion of cancellation on their own.
//! A blocked thread that should be stoppable waits in short slices and checks a [CancellationToken] after every wake.
//! It's the same idea as a shared `STOP` flag for a background worker, just wrapped into a type.
//!
//! If the awaited condition and the cancellation show up together, the condition wins: no element is left behind.

use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering::{Acquire, Release},
        },
        Arc,
    },
    time::Duration,
};

use crate::{condvar::Condvar, mutex::MutexGuard};

/// how often a cancellable wait re-checks its token
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A cloneable "please stop" flag. All clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Acquire)
    }
}

/// Waits on `condvar` while `blocked` holds, giving up once `token` is cancelled.
/// The returned flag is true if the wait was abandoned because of the token.
pub(crate) fn wait_while_cancellable<'a, Y, F>(
    condvar: &Condvar,
    mut guard: MutexGuard<'a, Y>,
    token: &CancellationToken,
    mut blocked: F,
) -> (MutexGuard<'a, Y>, bool)
where
    F: FnMut(&mut Y) -> bool,
{
    while blocked(&mut guard) {
        if token.is_cancelled() {
            return (guard, true);
        }
        guard = condvar.wait_for(guard, POLL_INTERVAL).0;
    }
    (guard, false)
}
