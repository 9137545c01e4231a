//! A mutable cell updated by effects, one update at a time.
//!
//! [`RefM`] pairs a [`Ref`] with a one-permit [`Semaphore`]. An update may
//! suspend (sleep, await a promise, fork) while it computes the next value;
//! other updates queue behind it in arrival order. Reads never wait.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: IO<String, i32> = RefM::make(1).flat_map(|cell| {
//!     cell.update(|value| IO::pure(value * 10))
//!         .then(cell.modify(|value| IO::pure((value + 1, value))))
//! });
//! assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(11));
//! ```

use std::fmt;

use super::{Ref, Semaphore};
use crate::effect::Effect;

/// A shared cell whose updates are effects, serialized in FIFO order.
pub struct RefM<A> {
    reference: Ref<A>,
    semaphore: Semaphore,
}

impl<A> Clone for RefM<A> {
    fn clone(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            semaphore: self.semaphore.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for RefM<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RefM")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

impl<A> RefM<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates a cell outside of any fiber.
    pub fn new(value: A) -> Self {
        Self {
            reference: Ref::new(value),
            semaphore: Semaphore::new(1),
        }
    }

    /// Creates a cell.
    pub fn make<R: 'static, E: Send + 'static>(value: A) -> Effect<R, E, Self> {
        Effect::total(move || Self::new(value))
    }

    /// Reads the current value without waiting for updates in flight.
    pub fn get<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, A> {
        self.reference.get()
    }

    /// Replaces the value once the updates ahead of it have finished.
    pub fn set<R: 'static, E: Send + 'static>(&self, value: A) -> Effect<R, E, ()> {
        self.semaphore.with_permit(self.reference.set(value))
    }

    /// Runs `function` on the current value and stores the value it
    /// produces, returning its result.
    ///
    /// If `function` fails or is interrupted the value is left unchanged.
    pub fn modify<R, E, B, F>(&self, function: F) -> Effect<R, E, B>
    where
        R: 'static,
        E: Send + 'static,
        B: Send + 'static,
        F: FnOnce(A) -> Effect<R, E, (B, A)> + Send + 'static,
    {
        let reference = self.reference.clone();
        let update = self
            .reference
            .get()
            .flat_map(function)
            .flat_map(move |(result, next)| reference.set(next).as_(result));
        self.semaphore.with_permit(update)
    }

    /// Like [`RefM::modify`], but returns `default` and leaves the value
    /// untouched when `function` returns `None`.
    pub fn modify_some<R, E, B, F>(&self, default: B, function: F) -> Effect<R, E, B>
    where
        R: 'static,
        E: Send + 'static,
        B: Send + 'static,
        F: FnOnce(&A) -> Option<Effect<R, E, (B, A)>> + Send + 'static,
    {
        self.modify(move |current| match function(&current) {
            Some(update) => update,
            None => Effect::pure((default, current)),
        })
    }

    /// Replaces the value by the one `function` produces.
    pub fn update<R, E, F>(&self, function: F) -> Effect<R, E, ()>
    where
        R: 'static,
        E: Send + 'static,
        F: FnOnce(A) -> Effect<R, E, A> + Send + 'static,
    {
        self.modify(move |current| function(current).fmap(|next| ((), next)))
    }

    /// Replaces the value and returns the new one.
    pub fn update_and_get<R, E, F>(&self, function: F) -> Effect<R, E, A>
    where
        R: 'static,
        E: Send + 'static,
        F: FnOnce(A) -> Effect<R, E, A> + Send + 'static,
    {
        self.modify(move |current| function(current).fmap(|next| (next.clone(), next)))
    }

    /// Replaces the value and returns the previous one.
    pub fn get_and_update<R, E, F>(&self, function: F) -> Effect<R, E, A>
    where
        R: 'static,
        E: Send + 'static,
        F: FnOnce(A) -> Effect<R, E, A> + Send + 'static,
    {
        self.modify(move |current| {
            let previous = current.clone();
            function(current).fmap(move |next| (previous, next))
        })
    }
}

static_assertions::assert_impl_all!(RefM<i32>: Send, Sync, Clone);
