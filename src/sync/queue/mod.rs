//! An asynchronous FIFO queue with a choice of surplus strategies.
//!
//! - [`Queue::bounded`] suspends offers while the buffer is full.
//! - [`Queue::dropping`] discards new items while the buffer is full.
//! - [`Queue::sliding`] discards the oldest items to make room.
//! - [`Queue::unbounded`] never refuses an item.
//!
//! A take on an empty queue suspends until an item is offered; an offer
//! with a taker already waiting hands the item over directly. Offers and
//! takes are each served in arrival order.
//!
//! After [`Queue::shutdown`], every pending and later `offer`, `take`, and
//! `size` fails with interruption.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: UIO<Vec<i32>> = Queue::bounded(2).flat_map(|queue| {
//!     let consumer = queue.clone();
//!     let producer: UIO<bool> = queue.offer_all(vec![1, 2, 3]);
//!     producer
//!         .fork()
//!         .then(Effect::foreach(0..3, move |_| consumer.take()))
//! });
//! assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec![1, 2, 3]));
//! ```

mod ring_buffer;
mod strategy;

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

pub use strategy::Strategy;

use super::{Promise, interrupted};
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::FiberId;
use ring_buffer::RingBuffer;
use strategy::Surplus;

// =============================================================================
// Internal state
// =============================================================================

/// The slot through which an item is handed to a suspended taker.
struct Handoff<A> {
    slot: Arc<Mutex<Option<A>>>,
    ready: Promise<Infallible, ()>,
}

impl<A> Clone for Handoff<A> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            ready: self.ready.clone(),
        }
    }
}

struct Taker<A> {
    id: u64,
    handoff: Handoff<A>,
}

/// A parked item. `accepted` is `None` for an item given back by a
/// cancelled taker while the buffer was full; no offer waits on it.
struct Putter<A> {
    id: u64,
    item: A,
    accepted: Option<Promise<Infallible, bool>>,
}

/// Promises to complete once the state lock is released.
#[derive(Default)]
struct Wakeups {
    takers: Vec<Promise<Infallible, ()>>,
    putters: Vec<Promise<Infallible, bool>>,
}

impl Wakeups {
    fn fire(self) {
        for taker in self.takers {
            taker.done_now(Exit::succeed(()));
        }
        for putter in self.putters {
            putter.done_now(Exit::succeed(true));
        }
    }
}

struct State<A> {
    buffer: RingBuffer<A>,
    takers: VecDeque<Taker<A>>,
    putters: VecDeque<Putter<A>>,
    shut_down: bool,
    next_id: u64,
}

impl<A> State<A> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn hand_to(taker: Taker<A>, item: A, wakeups: &mut Wakeups) {
        *taker.handoff.slot.lock() = Some(item);
        wakeups.takers.push(taker.handoff.ready);
    }

    /// Moves parked items into the buffer and buffered items to waiting
    /// takers until neither can make progress.
    fn rebalance(&mut self, wakeups: &mut Wakeups) {
        loop {
            let mut progressed = false;
            while !self.buffer.is_full() {
                let Some(putter) = self.putters.pop_front() else {
                    break;
                };
                if let Err(item) = self.buffer.offer(putter.item) {
                    self.putters.push_front(Putter { item, ..putter });
                    break;
                }
                wakeups.putters.extend(putter.accepted);
                progressed = true;
            }
            while !self.buffer.is_empty() {
                let Some(taker) = self.takers.pop_front() else {
                    break;
                };
                if let Some(item) = self.buffer.poll() {
                    Self::hand_to(taker, item, wakeups);
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
    }
}

enum OfferAttempt {
    Done(bool),
    Park(u64, Promise<Infallible, bool>),
    ShutDown,
}

enum TakeAttempt<A> {
    Ready(A),
    Wait(u64, Handoff<A>),
    ShutDown,
}

struct Inner<A> {
    state: Mutex<State<A>>,
    strategy: Strategy,
    shutdown_hook: Promise<Infallible, ()>,
}

// =============================================================================
// Queue
// =============================================================================

/// A shared asynchronous queue of `A`.
pub struct Queue<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        formatter
            .debug_struct("Queue")
            .field("strategy", &self.inner.strategy)
            .field("capacity", &state.buffer.capacity())
            .field("buffered", &state.buffer.len())
            .field("takers", &state.takers.len())
            .field("putters", &state.putters.len())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl<A: Send + 'static> Queue<A> {
    fn with_buffer(buffer: RingBuffer<A>, strategy: Strategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buffer,
                    takers: VecDeque::new(),
                    putters: VecDeque::new(),
                    shut_down: false,
                    next_id: 0,
                }),
                strategy,
                shutdown_hook: Promise::new(),
            }),
        }
    }

    fn make<R: 'static, E: Send + 'static>(capacity: usize, strategy: Strategy) -> Effect<R, E, Self> {
        Effect::total(move || Self::with_buffer(RingBuffer::bounded(capacity.max(1)), strategy))
    }

    /// A queue holding at most `capacity` items that suspends offers while
    /// full. A capacity of zero is raised to one.
    pub fn bounded<R: 'static, E: Send + 'static>(capacity: usize) -> Effect<R, E, Self> {
        Self::make(capacity, Strategy::BackPressure)
    }

    /// A queue holding at most `capacity` items that discards new items
    /// while full.
    pub fn dropping<R: 'static, E: Send + 'static>(capacity: usize) -> Effect<R, E, Self> {
        Self::make(capacity, Strategy::Dropping)
    }

    /// A queue holding at most `capacity` items that discards the oldest
    /// item to make room.
    pub fn sliding<R: 'static, E: Send + 'static>(capacity: usize) -> Effect<R, E, Self> {
        Self::make(capacity, Strategy::Sliding)
    }

    /// A queue without a capacity.
    pub fn unbounded<R: 'static, E: Send + 'static>() -> Effect<R, E, Self> {
        Effect::total(|| Self::with_buffer(RingBuffer::unbounded(), Strategy::BackPressure))
    }

    /// The capacity, or `None` for an unbounded queue.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.state.lock().buffer.capacity()
    }

    /// The surplus strategy.
    pub fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    // =========================================================================
    // Offering
    // =========================================================================

    fn try_offer(&self, item: A) -> OfferAttempt {
        let mut wakeups = Wakeups::default();
        let attempt = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return OfferAttempt::ShutDown;
            }
            if let Some(taker) = state.takers.pop_front() {
                State::hand_to(taker, item, &mut wakeups);
                OfferAttempt::Done(true)
            } else {
                match state.buffer.offer(item) {
                    Ok(()) => OfferAttempt::Done(true),
                    Err(item) => match self.inner.strategy.handle_surplus(&mut state.buffer, item) {
                        Surplus::Accepted => OfferAttempt::Done(true),
                        Surplus::Dropped => OfferAttempt::Done(false),
                        Surplus::Park(item) => {
                            let id = state.next_id();
                            let accepted = Promise::new();
                            state.putters.push_back(Putter {
                                id,
                                item,
                                accepted: Some(accepted.clone()),
                            });
                            OfferAttempt::Park(id, accepted)
                        }
                    },
                }
            }
        };
        wakeups.fire();
        attempt
    }

    fn cancel_putter(&self, id: u64) {
        self.inner
            .state
            .lock()
            .putters
            .retain(|putter| putter.id != id);
    }

    /// Offers an item.
    ///
    /// Succeeds with `true` once the item is in the queue or handed to a
    /// taker, and with `false` if a dropping queue discarded it. A bounded
    /// queue suspends the caller while it is full.
    pub fn offer<R: 'static, E: Send + 'static>(&self, item: A) -> Effect<R, E, bool> {
        let queue = self.clone();
        Effect::uninterruptible_mask(move |restore| match queue.try_offer(item) {
            OfferAttempt::Done(accepted) => Effect::pure(accepted),
            OfferAttempt::ShutDown => interrupted(),
            OfferAttempt::Park(id, accepted) => restore
                .apply(accepted.await_::<R>().widen_err::<E>())
                .on_interrupt(Effect::total(move || queue.cancel_putter(id))),
        })
    }

    /// Offers every item in order. Succeeds with `true` if all of them were
    /// accepted.
    pub fn offer_all<R: 'static, E: Send + 'static>(&self, items: Vec<A>) -> Effect<R, E, bool> {
        let queue = self.clone();
        Effect::foreach(items, move |item| queue.offer(item))
            .fmap(|accepted| accepted.into_iter().all(|accepted| accepted))
    }

    // =========================================================================
    // Taking
    // =========================================================================

    fn try_take(&self) -> TakeAttempt<A> {
        let mut wakeups = Wakeups::default();
        let attempt = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return TakeAttempt::ShutDown;
            }
            if let Some(item) = state.buffer.poll() {
                state.rebalance(&mut wakeups);
                TakeAttempt::Ready(item)
            } else {
                let id = state.next_id();
                let handoff = Handoff {
                    slot: Arc::new(Mutex::new(None)),
                    ready: Promise::new(),
                };
                state.takers.push_back(Taker {
                    id,
                    handoff: handoff.clone(),
                });
                TakeAttempt::Wait(id, handoff)
            }
        };
        wakeups.fire();
        attempt
    }

    /// Withdraws an interrupted taker. An item that was already handed to
    /// it goes back to the front of the queue, or to the next taker, or, if
    /// the buffer filled up meanwhile, to the head of the parked offers.
    fn cancel_taker(&self, id: u64, handoff: &Handoff<A>) {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.inner.state.lock();
            state.takers.retain(|taker| taker.id != id);
            if let Some(item) = handoff.slot.lock().take()
                && !state.shut_down
            {
                if let Err(item) = state.buffer.push_front(item) {
                    if let Some(taker) = state.takers.pop_front() {
                        State::hand_to(taker, item, &mut wakeups);
                    } else {
                        let parked = state.next_id();
                        state.putters.push_front(Putter {
                            id: parked,
                            item,
                            accepted: None,
                        });
                    }
                }
                state.rebalance(&mut wakeups);
            }
        }
        wakeups.fire();
    }

    /// Takes the oldest item, suspending while the queue is empty.
    pub fn take<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, A> {
        let queue = self.clone();
        Effect::uninterruptible_mask(move |restore| match queue.try_take() {
            TakeAttempt::Ready(item) => Effect::pure(item),
            TakeAttempt::ShutDown => interrupted(),
            TakeAttempt::Wait(id, handoff) => {
                let cancelled = handoff.clone();
                restore
                    .apply(handoff.ready.await_::<R>().widen_err::<E>())
                    .on_interrupt(Effect::total(move || queue.cancel_taker(id, &cancelled)))
                    .flat_map(move |()| {
                        Effect::suspend(move || match handoff.slot.lock().take() {
                            Some(item) => Effect::pure(item),
                            None => interrupted(),
                        })
                    })
            }
        })
    }

    fn drain(&self, limit: usize) -> Option<Vec<A>> {
        let mut wakeups = Wakeups::default();
        let items = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return None;
            }
            let items = state.buffer.poll_up_to(limit);
            state.rebalance(&mut wakeups);
            items
        };
        wakeups.fire();
        Some(items)
    }

    /// Takes every buffered item without suspending.
    pub fn take_all<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, Vec<A>> {
        self.take_up_to(usize::MAX)
    }

    /// Takes at most `limit` buffered items without suspending.
    pub fn take_up_to<R: 'static, E: Send + 'static>(&self, limit: usize) -> Effect<R, E, Vec<A>> {
        let queue = self.clone();
        Effect::suspend(move || match queue.drain(limit) {
            Some(items) => Effect::pure(items),
            None => interrupted(),
        })
    }

    /// Takes the oldest item if there is one, without suspending.
    pub fn poll<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, Option<A>> {
        self.take_up_to(1).fmap(|items| items.into_iter().next())
    }

    // =========================================================================
    // Inspection and shutdown
    // =========================================================================

    /// Buffered items, minus suspended takers, plus suspended offers.
    ///
    /// The buffered count never exceeds the capacity; only parked offers
    /// push the total above it, and only suspended takers push it below
    /// zero.
    pub fn size<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, i64> {
        let queue = self.clone();
        Effect::suspend(move || {
            let state = queue.inner.state.lock();
            if state.shut_down {
                return interrupted();
            }
            let buffered = i64::try_from(state.buffer.len()).unwrap_or(i64::MAX);
            let takers = i64::try_from(state.takers.len()).unwrap_or(i64::MAX);
            let putters = i64::try_from(state.putters.len()).unwrap_or(i64::MAX);
            Effect::pure(buffered - takers + putters)
        })
    }

    /// Whether the queue was shut down.
    pub fn is_shutdown<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, bool> {
        let queue = self.clone();
        Effect::total(move || queue.inner.state.lock().shut_down)
    }

    fn shutdown_now(&self, by: FiberId) {
        let (takers, putters) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.buffer.clear();
            (
                std::mem::take(&mut state.takers),
                std::mem::take(&mut state.putters),
            )
        };
        tracing::debug!(
            by = %by,
            takers = takers.len(),
            putters = putters.len(),
            "queue shut down"
        );
        for taker in takers {
            taker.handoff.ready.done_now(Exit::interrupt(by));
        }
        for accepted in putters.into_iter().filter_map(|putter| putter.accepted) {
            accepted.done_now(Exit::interrupt(by));
        }
        self.inner.shutdown_hook.done_now(Exit::succeed(()));
    }

    /// Shuts the queue down, interrupting every suspended taker and offer.
    pub fn shutdown<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, ()> {
        let queue = self.clone();
        Effect::<R, E, FiberId>::fiber_id()
            .flat_map(move |by| Effect::total(move || queue.shutdown_now(by)))
    }

    /// Suspends until the queue is shut down.
    pub fn await_shutdown<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, ()> {
        self.inner.shutdown_hook.await_::<R>().widen_err()
    }
}

static_assertions::assert_impl_all!(Queue<i32>: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn queue(capacity: usize, strategy: Strategy) -> Queue<i32> {
        Queue::with_buffer(RingBuffer::bounded(capacity), strategy)
    }

    #[rstest]
    fn offers_hand_over_directly_to_waiting_takers() {
        let queue = queue(1, Strategy::BackPressure);
        let TakeAttempt::Wait(_, handoff) = queue.try_take() else {
            panic!("expected to wait");
        };
        assert!(matches!(queue.try_offer(7), OfferAttempt::Done(true)));
        assert_eq!(*handoff.slot.lock(), Some(7));
        assert!(handoff.ready.is_done_now());
        assert_eq!(queue.inner.state.lock().buffer.len(), 0);
    }

    #[rstest]
    fn a_cancelled_taker_gives_its_item_back() {
        let queue = queue(2, Strategy::BackPressure);
        let TakeAttempt::Wait(id, handoff) = queue.try_take() else {
            panic!("expected to wait");
        };
        assert!(matches!(queue.try_offer(1), OfferAttempt::Done(true)));
        assert!(matches!(queue.try_offer(2), OfferAttempt::Done(true)));
        queue.cancel_taker(id, &handoff);
        assert_eq!(queue.drain(10), Some(vec![1, 2]));
    }

    #[rstest]
    fn a_cancelled_taker_never_overfills_the_buffer() {
        let queue = queue(1, Strategy::BackPressure);
        let TakeAttempt::Wait(id, handoff) = queue.try_take() else {
            panic!("expected to wait");
        };
        assert!(matches!(queue.try_offer(1), OfferAttempt::Done(true)));
        assert!(matches!(queue.try_offer(2), OfferAttempt::Done(true)));
        queue.cancel_taker(id, &handoff);
        {
            let state = queue.inner.state.lock();
            assert_eq!(state.buffer.len(), 1);
            assert_eq!(state.putters.len(), 1);
        }
        assert_eq!(queue.drain(10), Some(vec![2]));
        assert_eq!(queue.inner.state.lock().buffer.len(), 1);
        assert_eq!(queue.drain(10), Some(vec![1]));
        assert!(queue.inner.state.lock().putters.is_empty());
    }

    #[rstest]
    fn taking_frees_room_for_parked_offers() {
        let queue = queue(1, Strategy::BackPressure);
        assert!(matches!(queue.try_offer(1), OfferAttempt::Done(true)));
        let OfferAttempt::Park(_, accepted) = queue.try_offer(2) else {
            panic!("expected to park");
        };
        assert!(matches!(queue.try_take(), TakeAttempt::Ready(1)));
        assert!(accepted.is_done_now());
        assert!(matches!(queue.try_take(), TakeAttempt::Ready(2)));
    }

    #[rstest]
    #[case(Strategy::Dropping, false, vec![1])]
    #[case(Strategy::Sliding, true, vec![2])]
    fn surplus_strategies(
        #[case] strategy: Strategy,
        #[case] accepted: bool,
        #[case] remaining: Vec<i32>,
    ) {
        let queue = queue(1, strategy);
        assert!(matches!(queue.try_offer(1), OfferAttempt::Done(true)));
        assert!(matches!(queue.try_offer(2), OfferAttempt::Done(result) if result == accepted));
        assert_eq!(queue.drain(10), Some(remaining));
    }

    #[rstest]
    fn shutdown_is_final() {
        let queue = queue(1, Strategy::BackPressure);
        queue.shutdown_now(FiberId::NONE);
        assert!(matches!(queue.try_offer(1), OfferAttempt::ShutDown));
        assert!(matches!(queue.try_take(), TakeAttempt::ShutDown));
        assert_eq!(queue.drain(1), None);
        assert!(queue.inner.shutdown_hook.is_done_now());
    }
}
