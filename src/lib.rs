pub mod bounded;
pub mod cancel;
pub mod condvar;
pub mod delay;
pub mod errors;
pub mod mutex;
pub mod optimistic;
pub mod priority;
pub mod rendezvous;
pub mod rwlock;

mod backoff;
mod heap;

pub use bounded::BoundedBlockingQueue;
pub use cancel::CancellationToken;
pub use condvar::{Condvar, WaitResult};
pub use delay::DelayBlockingQueue;
pub use errors::{CapacityError, LockError, RecvError, SendError};
pub use mutex::{Mutex, MutexGuard};
pub use optimistic::{OptimisticCell, OptimisticLock, Stamp, StampMode};
pub use priority::PriorityBlockingQueue;
pub use rendezvous::RendezvousChannel;
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
