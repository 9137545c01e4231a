//! A single-assignment rendezvous between fibers.
//!
//! A [`Promise`] starts pending. Fibers that [`await_`](Promise::await_) it
//! suspend until it is completed; completion resumes every waiter, in the
//! order they started waiting. A promise is completed at most once: later
//! attempts are no-ops that report `false`.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: IO<String, (bool, bool, i32)> = Promise::<String, i32>::make().flat_map(|promise| {
//!     let waiter = promise.clone();
//!     let second = promise.clone();
//!     waiter.await_().fork().flat_map(move |fiber| {
//!         promise.succeed(1).flat_map(move |first| {
//!             second.succeed(2).flat_map(move |again| {
//!                 fiber.join().fmap(move |value| (first, again, value))
//!             })
//!         })
//!     })
//! });
//! assert_eq!(runtime.run_blocking_exit(program), Exit::succeed((true, false, 1)));
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{Callback, Effect, IO, UIO};
use crate::exit::Exit;
use crate::fiber::FiberId;

type Factory<E, A> = Arc<dyn Fn() -> IO<E, A> + Send + Sync>;

enum Outcome<E, A> {
    Exit(Exit<E, A>),
    Effect(Factory<E, A>),
}

impl<E, A> Outcome<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    fn to_effect(&self) -> IO<E, A> {
        match self {
            Self::Exit(exit) => IO::done(exit.clone()),
            Self::Effect(factory) => {
                let factory = Arc::clone(factory);
                IO::suspend(move || factory())
            }
        }
    }
}

enum State<E, A> {
    Pending(Vec<(u64, Callback<E, A>)>),
    Done(Outcome<E, A>),
}

struct Inner<E, A> {
    state: Mutex<State<E, A>>,
    next_waiter: AtomicU64,
}

/// A variable that is completed once with an [`Exit`] and can be awaited by
/// many fibers.
pub struct Promise<E, A> {
    inner: Arc<Inner<E, A>>,
}

impl<E, A> Clone for Promise<E, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E, A> fmt::Debug for Promise<E, A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Pending(waiters) => format!("Pending({} waiters)", waiters.len()),
            State::Done(_) => "Done".to_string(),
        };
        formatter.debug_tuple("Promise").field(&state).finish()
    }
}

impl<E, A> Default for Promise<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, A> Promise<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Creates a pending promise outside of any fiber.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                next_waiter: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a pending promise.
    pub fn make<R: 'static, E2: Send + 'static>() -> Effect<R, E2, Self> {
        Effect::total(Self::new)
    }

    /// Suspends until the promise is completed, then succeeds or fails as
    /// it was completed.
    ///
    /// An interrupted waiter is removed from the promise.
    pub fn await_<R: 'static>(&self) -> Effect<R, E, A> {
        let promise = self.clone();
        Effect::async_interrupt(move |callback| promise.register(callback))
    }

    fn register(&self, callback: Callback<E, A>) -> Option<UIO<()>> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Done(outcome) => {
                let effect = outcome.to_effect();
                drop(state);
                callback.resume_with(effect);
                None
            }
            State::Pending(waiters) => {
                let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
                waiters.push((id, callback));
                let promise = self.clone();
                Some(UIO::total(move || promise.remove_waiter(id)))
            }
        }
    }

    fn remove_waiter(&self, id: u64) {
        if let State::Pending(waiters) = &mut *self.inner.state.lock() {
            waiters.retain(|(waiter, _)| *waiter != id);
        }
    }

    /// The completion, as an effect to run, if the promise is completed.
    pub fn poll<R: 'static, E2: Send + 'static>(&self) -> Effect<R, E2, Option<IO<E, A>>> {
        let promise = self.clone();
        Effect::total(move || match &*promise.inner.state.lock() {
            State::Done(outcome) => Some(outcome.to_effect()),
            State::Pending(_) => None,
        })
    }

    /// Whether the promise is completed.
    pub fn is_done<R: 'static, E2: Send + 'static>(&self) -> Effect<R, E2, bool> {
        let promise = self.clone();
        Effect::total(move || promise.is_done_now())
    }

    /// Whether the promise is completed, checked outside of any fiber.
    pub fn is_done_now(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// Completes the promise with `exit`. Returns `false` if it was already
    /// completed.
    pub fn done<R: 'static, E2: Send + 'static>(&self, exit: Exit<E, A>) -> Effect<R, E2, bool> {
        let promise = self.clone();
        Effect::total(move || promise.done_now(exit))
    }

    /// Completes the promise synchronously. Every waiter is resumed before
    /// this returns.
    pub fn done_now(&self, exit: Exit<E, A>) -> bool {
        self.complete_now(Outcome::Exit(exit))
    }

    fn complete_now(&self, outcome: Outcome<E, A>) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    let effects: Vec<IO<E, A>> = waiters.iter().map(|_| outcome.to_effect()).collect();
                    *state = State::Done(outcome);
                    waiters.into_iter().zip(effects).collect::<Vec<_>>()
                }
            }
        };
        for ((_, callback), effect) in waiters {
            callback.resume_with(effect);
        }
        true
    }

    /// Completes the promise with a value.
    pub fn succeed<R: 'static, E2: Send + 'static>(&self, value: A) -> Effect<R, E2, bool> {
        self.done(Exit::succeed(value))
    }

    /// Completes the promise with a typed failure.
    pub fn fail<R: 'static, E2: Send + 'static>(&self, error: E) -> Effect<R, E2, bool> {
        self.done(Exit::fail(error))
    }

    /// Completes the promise with a defect.
    pub fn die<R: 'static, E2: Send + 'static>(&self, defect: Defect) -> Effect<R, E2, bool> {
        self.done(Exit::die(defect))
    }

    /// Completes the promise with an arbitrary cause.
    pub fn halt<R: 'static, E2: Send + 'static>(&self, cause: Cause<E>) -> Effect<R, E2, bool> {
        self.done(Exit::halt(cause))
    }

    /// Completes the promise with an interruption by the calling fiber.
    pub fn interrupt<R: 'static, E2: Send + 'static>(&self) -> Effect<R, E2, bool> {
        let promise = self.clone();
        Effect::<R, E2, FiberId>::fiber_id().flat_map(move |fiber_id| promise.interrupt_as(fiber_id))
    }

    /// Completes the promise with an interruption by `fiber_id`.
    pub fn interrupt_as<R: 'static, E2: Send + 'static>(
        &self,
        fiber_id: FiberId,
    ) -> Effect<R, E2, bool> {
        self.done(Exit::interrupt(fiber_id))
    }

    /// Runs `effect` and completes the promise with its exit.
    pub fn complete<R: 'static, E2: Send + 'static>(
        &self,
        effect: Effect<R, E, A>,
    ) -> Effect<R, E2, bool> {
        effect.to(self)
    }

    /// Completes the promise with an effect that every waiter runs itself.
    ///
    /// `factory` builds a fresh effect for each waiter, so the effect is not
    /// memoized.
    pub fn complete_with<R: 'static, E2: Send + 'static, F>(&self, factory: F) -> Effect<R, E2, bool>
    where
        F: Fn() -> IO<E, A> + Send + Sync + 'static,
    {
        let promise = self.clone();
        Effect::total(move || promise.complete_now(Outcome::Effect(Arc::new(factory))))
    }
}

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Runs this effect and completes `promise` with its exit.
    ///
    /// Only the effect itself is interruptible; once it has an exit the
    /// promise is completed even if the fiber is being interrupted.
    pub fn to<E2: Send + 'static>(self, promise: &Promise<E, A>) -> Effect<R, E2, bool> {
        let promise = promise.clone();
        Effect::uninterruptible_mask(move |restore| {
            restore
                .apply(self)
                .exit::<E2>()
                .flat_map(move |exit| promise.done(exit))
        })
    }
}

static_assertions::assert_impl_all!(Promise<String, i32>: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn done_now_accepts_only_the_first_completion() {
        let promise: Promise<String, i32> = Promise::new();
        assert!(!promise.is_done_now());
        assert!(promise.done_now(Exit::succeed(1)));
        assert!(!promise.done_now(Exit::succeed(2)));
        assert!(promise.is_done_now());
    }

    #[rstest]
    fn removing_an_unknown_waiter_is_harmless() {
        let promise: Promise<String, i32> = Promise::new();
        promise.remove_waiter(42);
        assert!(promise.done_now(Exit::fail("e".to_string())));
    }
}
