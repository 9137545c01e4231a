//! Effect descriptions and their combinators.
//!
//! [`Effect<R, E, A>`] describes a program that needs an environment `R`,
//! may fail with `E`, and succeeds with `A`. Building an effect never runs
//! it: effects are values, and a [`Runtime`](crate::runtime::Runtime) turns
//! them into running fibers.
//!
//! - [`IO<E, A>`] is an effect with no environment.
//! - [`UIO<A>`] is an effect with no environment that cannot fail with a
//!   typed error (it may still die or be interrupted).
//!
//! # Errors as values
//!
//! Failures are tracked as [`Cause`](crate::cause::Cause) values: typed
//! failures, defects (panics), and interruption are kept apart. `catch_all`
//! only ever sees typed failures; `catch_all_cause` sees everything.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//!
//! let program: IO<String, i32> = IO::pure(10)
//!     .fmap(|x| x * 2)
//!     .flat_map(|x| IO::pure(x + 1));
//! assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(21));
//!
//! let recovered: IO<String, usize> = IO::<String, usize>::fail("error".to_string())
//!     .catch_all(|error| IO::pure(error.len()));
//! assert_eq!(runtime.run_blocking_exit(recovered), Exit::succeed(5));
//! ```
//!
//! # Environment-free effects in other environments
//!
//! Constructors are generic over `R` and `E`, so most effects adapt to the
//! surrounding chain by inference. An effect that was already fixed to
//! `IO`/`UIO` can be moved into another environment with
//! [`Effect::lift_env`], and an infallible effect can adopt any error type
//! with [`Effect::widen_err`].

mod combinators;
mod concurrency;
mod constructors;
pub(crate) mod instruction;
mod schedule;

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;

pub use constructors::{Callback, InterruptRestore};
pub use schedule::{Decision, Schedule};

use instruction::Instruction;

/// A description of a program that needs `R`, may fail with `E`, and
/// succeeds with `A`.
#[must_use = "effects do nothing unless run"]
pub struct Effect<R, E, A> {
    pub(crate) instruction: Instruction,
    marker: PhantomData<fn(R) -> (E, A)>,
}

/// An effect that needs no environment.
pub type IO<E, A> = Effect<(), E, A>;

/// An effect that needs no environment and has no typed failures.
pub type UIO<A> = Effect<(), Infallible, A>;

impl<R, E, A> Effect<R, E, A> {
    pub(crate) const fn from_instruction(instruction: Instruction) -> Self {
        Self {
            instruction,
            marker: PhantomData,
        }
    }

    pub(crate) fn into_instruction(self) -> Instruction {
        self.instruction
    }
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Effect(<deferred>)")
    }
}

impl<E, A> Effect<(), E, A> {
    /// Runs this environment-free effect inside any environment.
    pub fn lift_env<R>(self) -> Effect<R, E, A> {
        Effect::from_instruction(self.instruction.with_unit_environment())
    }
}

impl<R, A> Effect<R, Infallible, A> {
    /// Views an effect without typed failures as an effect failing with any
    /// error type.
    pub fn widen_err<E>(self) -> Effect<R, E, A> {
        Effect::from_instruction(self.instruction)
    }
}

impl<A> Effect<(), Infallible, A> {
    /// Combines [`Effect::lift_env`] and [`Effect::widen_err`].
    pub fn widen<R, E>(self) -> Effect<R, E, A> {
        self.lift_env().widen_err()
    }
}

static_assertions::assert_impl_all!(Effect<(), String, i32>: Send);
