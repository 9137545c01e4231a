//! The final outcome of an effect or fiber.
//!
//! An [`Exit`] is either a success value or a [`Cause`] describing the
//! failure. Every fiber produces exactly one `Exit`.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::exit::Exit;
//!
//! let left: Exit<String, i32> = Exit::succeed(1);
//! let right: Exit<String, i32> = Exit::fail("boom".to_string());
//!
//! let zipped = left.zip(right);
//! assert!(zipped.is_failure());
//! ```

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;

/// The payload-free exit observed by finalizers.
pub type AnyExit = Exit<(), ()>;

/// Success with a value or failure with a cause.
#[derive(Clone, Debug, PartialEq)]
pub enum Exit<E, A> {
    /// The effect produced a value.
    Success(A),
    /// The effect failed.
    Failure(Cause<E>),
}

impl<E, A> Exit<E, A> {
    /// Creates a successful exit.
    pub const fn succeed(value: A) -> Self {
        Self::Success(value)
    }

    /// Creates an exit failed with a typed error.
    pub const fn fail(error: E) -> Self {
        Self::Failure(Cause::Fail(error))
    }

    /// Creates an exit failed with an arbitrary cause.
    pub const fn halt(cause: Cause<E>) -> Self {
        Self::Failure(cause)
    }

    /// Creates an exit failed with a defect.
    pub const fn die(defect: Defect) -> Self {
        Self::Failure(Cause::Die(defect))
    }

    /// Creates an exit interrupted by `fiber_id`.
    pub const fn interrupt(fiber_id: FiberId) -> Self {
        Self::Failure(Cause::Interrupt(fiber_id))
    }

    /// Returns `true` on success.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns `true` on failure.
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns `true` if the failure cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Success(_) => false,
            Self::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// Returns the success value, if any.
    pub const fn value(&self) -> Option<&A> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    /// Returns the failure cause, if any.
    pub const fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Converts into a `Result`, keeping the whole cause on failure.
    ///
    /// # Errors
    ///
    /// Returns the failure cause when the exit is not a success.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(cause) => Err(cause),
        }
    }

    /// Transforms the success value.
    pub fn map<B, F: FnOnce(A) -> B>(self, function: F) -> Exit<E, B> {
        match self {
            Self::Success(value) => Exit::Success(function(value)),
            Self::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transforms every typed failure inside the cause.
    pub fn map_err<E2, F: FnMut(E) -> E2>(self, function: F) -> Exit<E2, A> {
        match self {
            Self::Success(value) => Exit::Success(value),
            Self::Failure(cause) => Exit::Failure(cause.map(function)),
        }
    }

    /// Transforms the failure cause as a whole.
    pub fn map_cause<E2, F: FnOnce(Cause<E>) -> Cause<E2>>(self, function: F) -> Exit<E2, A> {
        match self {
            Self::Success(value) => Exit::Success(value),
            Self::Failure(cause) => Exit::Failure(function(cause)),
        }
    }

    /// Combines two exits. Values are merged with `function`; when both
    /// failed, the causes are merged with `combine`.
    pub fn zip_with<B, C, F, G>(self, other: Exit<E, B>, function: F, combine: G) -> Exit<E, C>
    where
        F: FnOnce(A, B) -> C,
        G: FnOnce(Cause<E>, Cause<E>) -> Cause<E>,
    {
        match (self, other) {
            (Self::Success(left), Exit::Success(right)) => Exit::Success(function(left, right)),
            (Self::Failure(cause), Exit::Success(_)) | (Self::Success(_), Exit::Failure(cause)) => {
                Exit::Failure(cause)
            }
            (Self::Failure(left), Exit::Failure(right)) => Exit::Failure(combine(left, right)),
        }
    }

    /// Sequential zip: failures are combined with [`Cause::then`].
    pub fn zip<B>(self, other: Exit<E, B>) -> Exit<E, (A, B)> {
        self.zip_with(other, |left, right| (left, right), Cause::then)
    }

    /// Parallel zip: failures are combined with [`Cause::both`].
    pub fn zip_par<B>(self, other: Exit<E, B>) -> Exit<E, (A, B)> {
        self.zip_with(other, |left, right| (left, right), Cause::both)
    }

    /// Collects exits sequentially. Returns `None` for an empty input.
    pub fn collect_all<I>(exits: I) -> Option<Exit<E, Vec<A>>>
    where
        I: IntoIterator<Item = Self>,
    {
        Self::collect_with(exits, Cause::then)
    }

    /// Collects exits in parallel. Returns `None` for an empty input.
    pub fn collect_all_par<I>(exits: I) -> Option<Exit<E, Vec<A>>>
    where
        I: IntoIterator<Item = Self>,
    {
        Self::collect_with(exits, Cause::both)
    }

    fn collect_with<I>(exits: I, combine: fn(Cause<E>, Cause<E>) -> Cause<E>) -> Option<Exit<E, Vec<A>>>
    where
        I: IntoIterator<Item = Self>,
    {
        let mut exits = exits.into_iter();
        let first = exits.next()?.map(|value| vec![value]);
        Some(exits.fold(first, |collected, exit| {
            collected.zip_with(
                exit,
                |mut values, value| {
                    values.push(value);
                    values
                },
                combine,
            )
        }))
    }

    /// Erases both payloads, keeping only the shape of the outcome.
    pub fn to_any(&self) -> AnyExit {
        match self {
            Self::Success(_) => Exit::Success(()),
            Self::Failure(cause) => Exit::Failure(cause.map_ref(|_| ())),
        }
    }
}

impl<E, A> From<Result<A, E>> for Exit<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::fail(error),
        }
    }
}
