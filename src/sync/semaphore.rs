//! A FIFO counting semaphore.
//!
//! Waiters are served strictly in arrival order: a large request at the
//! head of the line is not overtaken by smaller ones behind it. A waiter
//! that is interrupted leaves the line; if its permits had already been
//! granted they are given back.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Promise;
use crate::effect::Effect;
use crate::exit::Exit;

struct Waiter {
    id: u64,
    permits: usize,
    granted: Promise<Infallible, ()>,
}

struct State {
    available: usize,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

enum Acquisition {
    Acquired,
    Waiting(u64, Promise<Infallible, ()>),
}

/// A counting semaphore with fair, first-come first-served waiters.
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        formatter
            .debug_struct("Semaphore")
            .field("available", &state.available)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl Semaphore {
    /// Creates a semaphore outside of any fiber.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                available: permits,
                waiters: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    /// Creates a semaphore with `permits` permits.
    pub fn make<R: 'static, E: Send + 'static>(permits: usize) -> Effect<R, E, Self> {
        Effect::total(move || Self::new(permits))
    }

    /// The number of permits not currently held.
    pub fn available<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, usize> {
        let semaphore = self.clone();
        Effect::total(move || semaphore.state.lock().available)
    }

    fn try_acquire(&self, permits: usize) -> Acquisition {
        let mut state = self.state.lock();
        if state.waiters.is_empty() && state.available >= permits {
            state.available -= permits;
            return Acquisition::Acquired;
        }
        let id = state.next_id;
        state.next_id += 1;
        let granted = Promise::new();
        state.waiters.push_back(Waiter {
            id,
            permits,
            granted: granted.clone(),
        });
        Acquisition::Waiting(id, granted)
    }

    /// Hands permits to waiters at the head of the line. The promises are
    /// completed after the lock is released.
    fn grant(state: &mut State) -> Vec<Promise<Infallible, ()>> {
        let mut granted = Vec::new();
        while let Some(waiter) = state.waiters.front() {
            if waiter.permits > state.available {
                break;
            }
            state.available -= waiter.permits;
            if let Some(waiter) = state.waiters.pop_front() {
                granted.push(waiter.granted);
            }
        }
        granted
    }

    fn release_now(&self, permits: usize) {
        let granted = {
            let mut state = self.state.lock();
            state.available += permits;
            Self::grant(&mut state)
        };
        for promise in granted {
            promise.done_now(Exit::succeed(()));
        }
    }

    fn cancel(&self, id: u64, permits: usize) {
        let granted = {
            let mut state = self.state.lock();
            let waiting = state.waiters.len();
            state.waiters.retain(|waiter| waiter.id != id);
            if state.waiters.len() == waiting {
                state.available += permits;
            }
            Self::grant(&mut state)
        };
        for promise in granted {
            promise.done_now(Exit::succeed(()));
        }
    }

    /// Acquires `permits` permits, suspending until they are available.
    pub fn acquire_n<R: 'static, E: Send + 'static>(&self, permits: usize) -> Effect<R, E, ()> {
        let semaphore = self.clone();
        Effect::uninterruptible_mask(move |restore| match semaphore.try_acquire(permits) {
            Acquisition::Acquired => Effect::unit(),
            Acquisition::Waiting(id, granted) => restore
                .apply(granted.await_::<R>().widen_err::<E>())
                .on_interrupt(Effect::total(move || semaphore.cancel(id, permits))),
        })
    }

    /// Acquires one permit.
    pub fn acquire<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, ()> {
        self.acquire_n(1)
    }

    /// Returns `permits` permits, waking waiters that can now proceed.
    pub fn release_n<R: 'static, E: Send + 'static>(&self, permits: usize) -> Effect<R, E, ()> {
        let semaphore = self.clone();
        Effect::total(move || semaphore.release_now(permits))
    }

    /// Returns one permit.
    pub fn release<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, ()> {
        self.release_n(1)
    }

    /// Runs `effect` holding `permits` permits, returning them however the
    /// effect ends.
    pub fn with_permits<R, E, A>(&self, permits: usize, effect: Effect<R, E, A>) -> Effect<R, E, A>
    where
        R: 'static,
        E: Send + 'static,
        A: Send + 'static,
    {
        let semaphore = self.clone();
        Effect::uninterruptible_mask(move |restore| {
            let release = semaphore.release_n::<R, Infallible>(permits);
            restore
                .apply(semaphore.acquire_n(permits))
                .then(restore.apply(effect).ensuring(release))
        })
    }

    /// Runs `effect` holding one permit.
    pub fn with_permit<R, E, A>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A>
    where
        R: 'static,
        E: Send + 'static,
        A: Send + 'static,
    {
        self.with_permits(1, effect)
    }

    /// A resource holding one permit for as long as it is in use.
    #[cfg(feature = "managed")]
    pub fn with_permit_managed<R, E>(&self) -> crate::managed::Managed<R, E, ()>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        let semaphore = self.clone();
        crate::managed::Managed::make(self.acquire(), move |()| semaphore.release())
    }
}

static_assertions::assert_impl_all!(Semaphore: Send, Sync, Clone);
