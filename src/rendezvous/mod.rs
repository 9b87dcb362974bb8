//! # Rendezvous channel
//!
//! A zero-capacity channel: `send` returns only once a receiver has taken the value.
//! There's a single hand-over slot, it holds the value of the one sender that's currently handing over.
//! Other senders queue up until the slot is free again.
//!
//! The sender counts its deposit with a ticket and waits until the receivers' `taken` counter reaches it.
//! As only one deposit sits in the slot at a time, `taken >= ticket` means exactly "my value was taken".
//!
//! A timed-out sender withdraws its value from the slot and gets it back, so nothing is ever half-sent.
//! [RendezvousChannel::offer] only succeeds if some receiver is already waiting.
//! A waiting receiver always takes a value that's in the slot, even if it's timing out or cancelled at the same moment.

use std::time::{Duration, Instant};

use crate::{
    backoff::deadline_after,
    cancel::{CancellationToken, POLL_INTERVAL},
    condvar::Condvar,
    errors::{RecvError, SendError},
    mutex::{Mutex, MutexGuard},
};

struct Handoff<Y> {
    slot: Option<Y>,
    /// values deposited into the slot so far
    deposited: u64,
    /// values taken out of the slot so far
    taken: u64,
    /// receivers blocked in a receive call
    waiting_receivers: usize,
}

pub struct RendezvousChannel<Y> {
    /// guards the slot and the counters
    state: Mutex<Handoff<Y>>,
    /// a value appeared in the slot
    item_ready: Condvar,
    /// the slot got empty, the next sender may deposit
    slot_free: Condvar,
    /// a deposited value was taken by a receiver
    item_taken: Condvar,
}

enum Giveup {
    Timeout,
    Cancelled,
}

impl<Y> RendezvousChannel<Y> {
    pub fn new() -> Self {
        tracing::debug!("rendezvous channel created");
        Self {
            state: Mutex::new(Handoff {
                slot: None,
                deposited: 0,
                taken: 0,
                waiting_receivers: 0,
            }),
            item_ready: Condvar::new(),
            slot_free: Condvar::new(),
            item_taken: Condvar::new(),
        }
    }

    /// Blocks until a receiver has taken `item`.
    pub fn send(&self, item: Y) {
        let mut state = self.slot_free.wait_while(self.state.lock(), |h| h.slot.is_some());
        let ticket = self.deposit(&mut state, item);
        let _state = self.item_taken.wait_while(state, |h| h.taken < ticket);
    }

    /// Blocks until a sender hands over a value.
    pub fn receive(&self) -> Y {
        let mut state = self.state.lock();
        state.waiting_receivers += 1;
        let mut state = self.item_ready.wait_while(state, |h| h.slot.is_none());
        state.waiting_receivers -= 1;
        self.take_slot(&mut state)
    }

    /// Hands `item` over only if a receiver is waiting right now.
    pub fn offer(&self, item: Y) -> Result<(), Y> {
        let mut state = self.state.lock();
        if state.slot.is_some() || state.waiting_receivers == 0 {
            return Err(item);
        }
        // a waiting receiver never leaves a filled slot behind, so this is as good as taken
        self.deposit(&mut state, item);
        Ok(())
    }

    /// Takes a value only if a sender is handing one over right now.
    pub fn poll(&self) -> Option<Y> {
        let mut state = self.state.lock();
        state.slot.is_some().then(|| self.take_slot(&mut state))
    }

    pub fn try_send(&self, item: Y, timeout: Duration) -> Result<(), SendError<Y>> {
        let deadline = deadline_after(timeout);
        self.send_until(item, || Instant::now() >= deadline, Some(deadline))
            .map_err(|item| {
                tracing::trace!(?timeout, "send timed out");
                SendError::Timeout(item)
            })
    }

    pub fn send_cancellable(&self, item: Y, token: &CancellationToken) -> Result<(), SendError<Y>> {
        self.send_until(item, || token.is_cancelled(), None)
            .map_err(|item| {
                tracing::warn!("send cancelled");
                SendError::Cancelled(item)
            })
    }

    pub fn try_receive(&self, timeout: Duration) -> Result<Y, RecvError> {
        let deadline = deadline_after(timeout);
        self.receive_until(|| (Instant::now() >= deadline).then_some(Giveup::Timeout), Some(deadline))
    }

    pub fn receive_cancellable(&self, token: &CancellationToken) -> Result<Y, RecvError> {
        self.receive_until(|| token.is_cancelled().then_some(Giveup::Cancelled), None)
    }

    /// Whether a receiver is blocked waiting for a value.
    pub fn has_waiting_receiver(&self) -> bool {
        self.state.lock().waiting_receivers > 0
    }

    /// Both halves of a bounded send: get the slot, then wait for the take.
    /// On giving up the value is always returned, withdrawn from the slot if needed.
    fn send_until<F>(&self, item: Y, give_up: F, deadline: Option<Instant>) -> Result<(), Y>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock();
        while state.slot.is_some() {
            if give_up() {
                return Err(item);
            }
            state = self.wait_slice(&self.slot_free, state, deadline);
        }

        let ticket = self.deposit(&mut state, item);
        while state.taken < ticket {
            if give_up() {
                // nobody took it, so it's still ours and still in the slot
                let Some(item) = state.slot.take() else {
                    unreachable!("an untaken deposit is always in the slot");
                };
                state.deposited -= 1;
                self.slot_free.notify_one();
                return Err(item);
            }
            state = self.wait_slice(&self.item_taken, state, deadline);
        }
        Ok(())
    }

    fn receive_until<F>(&self, give_up: F, deadline: Option<Instant>) -> Result<Y, RecvError>
    where
        F: Fn() -> Option<Giveup>,
    {
        let mut state = self.state.lock();
        state.waiting_receivers += 1;
        let outcome = loop {
            // a value in the slot wins over giving up
            if state.slot.is_some() {
                break Ok(());
            }
            if let Some(reason) = give_up() {
                break Err(reason);
            }
            state = self.wait_slice(&self.item_ready, state, deadline);
        };
        state.waiting_receivers -= 1;
        match outcome {
            Ok(()) => Ok(self.take_slot(&mut state)),
            Err(Giveup::Timeout) => Err(RecvError::Timeout),
            Err(Giveup::Cancelled) => {
                tracing::warn!("receive cancelled");
                Err(RecvError::Cancelled)
            }
        }
    }

    /// one bounded wait: up to the deadline if there's one, a cancellation poll slice otherwise
    fn wait_slice<'a>(
        &self,
        condvar: &Condvar,
        state: MutexGuard<'a, Handoff<Y>>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, Handoff<Y>> {
        match deadline {
            Some(deadline) => condvar.wait_until(state, deadline).0,
            None => condvar.wait_for(state, POLL_INTERVAL).0,
        }
    }

    fn deposit(&self, state: &mut MutexGuard<'_, Handoff<Y>>, item: Y) -> u64 {
        debug_assert!(state.slot.is_none());
        state.slot = Some(item);
        state.deposited += 1;
        self.item_ready.notify_one();
        state.deposited
    }

    fn take_slot(&self, state: &mut MutexGuard<'_, Handoff<Y>>) -> Y {
        let Some(item) = state.slot.take() else {
            unreachable!("take_slot is only called with a filled slot");
        };
        state.taken += 1;
        // only the depositor waits for this, but timed waiters poll the counter anyway
        self.item_taken.notify_all();
        self.slot_free.notify_one();
        item
    }
}

impl<Y> Default for RendezvousChannel<Y> {
    fn default() -> Self {
        Self::new()
    }
}

/// Every send returns only after the receiver got the value
pub fn run() {
    use std::thread;

    let channel = RendezvousChannel::new();
    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..3 {
                channel.send(i);
                tracing::info!(i, "handed over");
            }
        });
        s.spawn(|| {
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(50));
                let i = channel.receive();
                tracing::info!(i, "received");
            }
        });
    });
    tracing::info!(accepted = channel.offer(99).is_ok(), "offer without a receiver");
}

#[cfg(test)]
mod test {
    use std::thread::{scope, sleep};

    use super::*;

    #[test]
    fn send_returns_only_after_the_take() {
        let ch = RendezvousChannel::new();
        scope(|s| {
            let sender = s.spawn(|| ch.send(1));
            sleep(Duration::from_millis(100));
            // no receiver yet => the sender is stuck
            assert!(!sender.is_finished());
            assert_eq!(ch.receive(), 1);
        });
    }

    #[test]
    fn many_senders_many_receivers() {
        let ch = RendezvousChannel::new();
        let mut got = scope(|s| {
            for i in 0..4 {
                let ch = &ch;
                s.spawn(move || {
                    for j in 0..25 {
                        ch.send(i * 100 + j);
                    }
                });
            }
            let receivers: Vec<_> = (0..2)
                .map(|_| s.spawn(|| (0..50).map(|_| ch.receive()).collect::<Vec<_>>()))
                .collect();
            receivers
                .into_iter()
                .flat_map(|r| r.join().unwrap())
                .collect::<Vec<_>>()
        });
        got.sort();
        let expected: Vec<_> = (0..4).flat_map(|i| (0..25).map(move |j| i * 100 + j)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn offer_needs_a_waiting_receiver() {
        let ch = RendezvousChannel::new();
        assert_eq!(ch.offer(1), Err(1));
        scope(|s| {
            let receiver = s.spawn(|| ch.receive());
            while !ch.has_waiting_receiver() {
                sleep(Duration::from_millis(1));
            }
            assert_eq!(ch.offer(2), Ok(()));
            assert_eq!(receiver.join().unwrap(), 2);
        });
    }

    #[test]
    fn poll_needs_a_waiting_sender() {
        let ch = RendezvousChannel::new();
        assert_eq!(ch.poll(), None);
        scope(|s| {
            s.spawn(|| ch.send(5));
            let mut got = None;
            while got.is_none() {
                sleep(Duration::from_millis(1));
                got = ch.poll();
            }
            assert_eq!(got, Some(5));
        });
    }

    #[test]
    fn timed_send_gets_the_value_back() {
        let ch = RendezvousChannel::new();
        let e = ch.try_send(String::from("late"), Duration::from_millis(50)).unwrap_err();
        assert!(e.is_timeout());
        assert_eq!(e.into_inner(), "late");
        // the withdrawn value is really gone
        assert_eq!(ch.poll(), None);
        // and the counters are consistent for the next sender
        scope(|s| {
            s.spawn(|| ch.send(String::from("next")));
            assert_eq!(ch.receive(), "next");
        });
    }

    #[test]
    fn timed_receive() {
        let ch = RendezvousChannel::<u8>::new();
        assert_eq!(ch.try_receive(Duration::from_millis(30)), Err(RecvError::Timeout));
        assert!(!ch.has_waiting_receiver());
        scope(|s| {
            s.spawn(|| ch.send(8));
            assert_eq!(ch.try_receive(Duration::from_secs(5)), Ok(8));
        });
    }

    #[test]
    fn cancellation() {
        let ch = RendezvousChannel::<u8>::new();
        let token = CancellationToken::new();
        scope(|s| {
            let receiver = s.spawn(|| ch.receive_cancellable(&token));
            let sender = s.spawn(|| ch.send_cancellable(1, &token));
            // let them meet first
            sleep(Duration::from_millis(50));
            token.cancel();
            let received = receiver.join().unwrap();
            let sent = sender.join().unwrap();
            // a hand-over either happened on both sides or on neither
            assert_eq!(received.is_ok(), sent.is_ok());
        });
        assert_eq!(
            ch.send_cancellable(2, &token).map_err(|e| e.is_cancelled()),
            Err(true)
        );
        assert_eq!(ch.receive_cancellable(&token), Err(RecvError::Cancelled));
    }
}
