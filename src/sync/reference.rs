//! An atomically updated mutable cell.
//!
//! Every update is a compare-and-swap retry loop: the current value and its
//! version are read, the update function runs without holding the lock,
//! and the new value is written only if the version did not change in the
//! meantime. Update functions are therefore `Fn` and may run more than once
//! under contention.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: UIO<(i32, i32)> = Ref::make(1).flat_map(|counter| {
//!     counter
//!         .update(|value| value + 10)
//!         .then(counter.modify(|value| (value * 2, value + 1)))
//!         .flat_map(move |doubled| counter.get().fmap(move |current| (doubled, current)))
//! });
//! assert_eq!(runtime.run_blocking_exit(program), Exit::succeed((22, 12)));
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;

struct Versioned<A> {
    version: u64,
    value: A,
}

/// A shared mutable cell updated atomically.
pub struct Ref<A> {
    cell: Arc<Mutex<Versioned<A>>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell.lock();
        formatter
            .debug_struct("Ref")
            .field("value", &cell.value)
            .field("version", &cell.version)
            .finish()
    }
}

impl<A> Ref<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates a cell outside of any fiber.
    pub fn new(value: A) -> Self {
        Self {
            cell: Arc::new(Mutex::new(Versioned { version: 0, value })),
        }
    }

    /// Creates a cell.
    pub fn make<R: 'static, E: Send + 'static>(value: A) -> Effect<R, E, Self> {
        Effect::total(move || Self::new(value))
    }

    fn read(&self) -> (u64, A) {
        let cell = self.cell.lock();
        (cell.version, cell.value.clone())
    }

    /// Runs the compare-and-swap loop. `None` from `function` leaves the
    /// cell untouched.
    fn modify_now<B, F>(&self, function: &F) -> B
    where
        F: Fn(A) -> (B, Option<A>),
    {
        loop {
            let (version, current) = self.read();
            let (result, next) = function(current);
            let Some(next) = next else {
                return result;
            };
            let mut cell = self.cell.lock();
            if cell.version == version {
                cell.value = next;
                cell.version = cell.version.wrapping_add(1);
                return result;
            }
        }
    }

    /// Reads the current value.
    pub fn get<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, A> {
        let reference = self.clone();
        Effect::total(move || reference.read().1)
    }

    /// Replaces the value.
    pub fn set<R: 'static, E: Send + 'static>(&self, value: A) -> Effect<R, E, ()> {
        let reference = self.clone();
        Effect::total(move || {
            let mut cell = reference.cell.lock();
            cell.value = value;
            cell.version = cell.version.wrapping_add(1);
        })
    }

    /// Atomically computes a result and the next value from the current
    /// one.
    pub fn modify<R, E, B, F>(&self, function: F) -> Effect<R, E, B>
    where
        R: 'static,
        E: Send + 'static,
        B: Send + 'static,
        F: Fn(A) -> (B, A) + Send + 'static,
    {
        let reference = self.clone();
        Effect::total(move || {
            reference.modify_now(&|current| {
                let (result, next) = function(current);
                (result, Some(next))
            })
        })
    }

    /// Like [`Ref::modify`], but leaves the value untouched and returns
    /// `default` when `function` returns `None`.
    pub fn modify_some<R, E, B, F>(&self, default: B, function: F) -> Effect<R, E, B>
    where
        R: 'static,
        E: Send + 'static,
        B: Clone + Send + 'static,
        F: Fn(&A) -> Option<(B, A)> + Send + 'static,
    {
        let reference = self.clone();
        Effect::total(move || {
            reference.modify_now(&|current| match function(&current) {
                Some((result, next)) => (result, Some(next)),
                None => (default.clone(), None),
            })
        })
    }

    /// Atomically applies `function` to the value.
    pub fn update<R, E, F>(&self, function: F) -> Effect<R, E, ()>
    where
        R: 'static,
        E: Send + 'static,
        F: Fn(A) -> A + Send + 'static,
    {
        self.modify(move |current| ((), function(current)))
    }

    /// Atomically applies `function` where it is defined.
    pub fn update_some<R, E, F>(&self, function: F) -> Effect<R, E, ()>
    where
        R: 'static,
        E: Send + 'static,
        F: Fn(&A) -> Option<A> + Send + 'static,
    {
        self.modify_some((), move |current| function(current).map(|next| ((), next)))
    }

    /// Atomically applies `function` and returns the new value.
    pub fn update_and_get<R, E, F>(&self, function: F) -> Effect<R, E, A>
    where
        R: 'static,
        E: Send + 'static,
        F: Fn(A) -> A + Send + 'static,
    {
        self.modify(move |current| {
            let next = function(current);
            (next.clone(), next)
        })
    }

    /// Replaces the value and returns the previous one.
    pub fn get_and_set<R: 'static, E: Send + 'static>(&self, value: A) -> Effect<R, E, A> {
        self.modify(move |current| (current, value.clone()))
    }

    /// Atomically applies `function` and returns the previous value.
    pub fn get_and_update<R, E, F>(&self, function: F) -> Effect<R, E, A>
    where
        R: 'static,
        E: Send + 'static,
        F: Fn(A) -> A + Send + 'static,
    {
        self.modify(move |current| (current.clone(), function(current)))
    }
}

static_assertions::assert_impl_all!(Ref<i32>: Send, Sync, Clone);
