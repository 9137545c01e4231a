//! Recurrence policies for [`Effect::retry`] and [`Effect::repeat`].
//!
//! A [`Schedule`] is a pure decision function: given the number of
//! recurrences so far and the latest input (an error for `retry`, a value
//! for `repeat`), it decides whether to go again and how long to wait
//! first.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use lambars_fiber::prelude::*;
//!
//! let schedule: Schedule<String> =
//!     Schedule::recurs(3).and(Schedule::exponential(Duration::from_millis(10), 2.0));
//! assert_eq!(schedule.decide(0, &"e".to_string()), Decision::Continue(Duration::from_millis(10)));
//! assert_eq!(schedule.decide(2, &"e".to_string()), Decision::Continue(Duration::from_millis(40)));
//! assert_eq!(schedule.decide(3, &"e".to_string()), Decision::Done);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::Effect;

/// The outcome of consulting a [`Schedule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Recur after waiting for the given duration.
    Continue(Duration),
    /// Stop recurring.
    Done,
}

type Step<In> = dyn Fn(u64, &In) -> Decision + Send + Sync;

/// A recurrence policy consuming inputs of type `In`.
pub struct Schedule<In> {
    step: Arc<Step<In>>,
}

impl<In> Clone for Schedule<In> {
    fn clone(&self) -> Self {
        Self {
            step: Arc::clone(&self.step),
        }
    }
}

impl<In> fmt::Debug for Schedule<In> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Schedule(<policy>)")
    }
}

impl<In: 'static> Schedule<In> {
    /// Builds a schedule from a decision function.
    pub fn from_fn<F>(step: F) -> Self
    where
        F: Fn(u64, &In) -> Decision + Send + Sync + 'static,
    {
        Self {
            step: Arc::new(step),
        }
    }

    /// Decides whether recurrence number `attempt` (zero based) happens.
    pub fn decide(&self, attempt: u64, input: &In) -> Decision {
        (self.step)(attempt, input)
    }

    /// Recurs forever without delay.
    pub fn forever() -> Self {
        Self::from_fn(|_, _| Decision::Continue(Duration::ZERO))
    }

    /// Recurs `times` times without delay.
    pub fn recurs(times: u64) -> Self {
        Self::from_fn(move |attempt, _| {
            if attempt < times {
                Decision::Continue(Duration::ZERO)
            } else {
                Decision::Done
            }
        })
    }

    /// Recurs exactly once.
    pub fn once() -> Self {
        Self::recurs(1)
    }

    /// Recurs forever, waiting `interval` each time.
    pub fn spaced(interval: Duration) -> Self {
        Self::from_fn(move |_, _| Decision::Continue(interval))
    }

    /// Recurs forever, waiting `base * factor^attempt`.
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self::from_fn(move |attempt, _| {
            let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
            let delay = base.as_secs_f64() * factor.powi(exponent);
            Decision::Continue(Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX))
        })
    }

    /// Recurs while the latest input satisfies `predicate`.
    pub fn while_input<P>(predicate: P) -> Self
    where
        P: Fn(&In) -> bool + Send + Sync + 'static,
    {
        Self::from_fn(move |_, input| {
            if predicate(input) {
                Decision::Continue(Duration::ZERO)
            } else {
                Decision::Done
            }
        })
    }

    /// Recurs only while both schedules do, waiting the longer delay.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::from_fn(move |attempt, input| {
            match (self.decide(attempt, input), other.decide(attempt, input)) {
                (Decision::Continue(left), Decision::Continue(right)) => {
                    Decision::Continue(left.max(right))
                }
                _ => Decision::Done,
            }
        })
    }

    /// Recurs while either schedule does, waiting the shorter delay.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::from_fn(move |attempt, input| {
            match (self.decide(attempt, input), other.decide(attempt, input)) {
                (Decision::Continue(left), Decision::Continue(right)) => {
                    Decision::Continue(left.min(right))
                }
                (Decision::Continue(delay), Decision::Done)
                | (Decision::Done, Decision::Continue(delay)) => Decision::Continue(delay),
                (Decision::Done, Decision::Done) => Decision::Done,
            }
        })
    }

    /// Limits this schedule to at most `times` recurrences.
    #[must_use]
    pub fn up_to(self, times: u64) -> Self {
        self.and(Self::recurs(times))
    }
}

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Runs the effect built by `make`, rebuilding and rerunning it after
    /// each typed failure while `schedule` says so.
    ///
    /// The last failure is returned once the schedule is done. Defects and
    /// interruption are never retried.
    pub fn retry<F>(make: F, schedule: Schedule<E>) -> Self
    where
        F: FnMut() -> Self + Send + 'static,
    {
        retry_from(make, schedule, 0)
    }

    /// Runs the effect built by `make`, then keeps rerunning it while
    /// `schedule` accepts the latest value. Succeeds with the last value.
    pub fn repeat<F>(make: F, schedule: Schedule<A>) -> Self
    where
        F: FnMut() -> Self + Send + 'static,
    {
        repeat_from(make, schedule, 0)
    }
}

fn retry_from<R, E, A, F>(mut make: F, schedule: Schedule<E>, attempt: u64) -> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
    F: FnMut() -> Effect<R, E, A> + Send + 'static,
{
    Effect::suspend(move || {
        make().catch_all(move |error| match schedule.decide(attempt, &error) {
            Decision::Continue(delay) => after(delay, retry_from(make, schedule, attempt + 1)),
            Decision::Done => Effect::fail(error),
        })
    })
}

fn repeat_from<R, E, A, F>(mut make: F, schedule: Schedule<A>, attempt: u64) -> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
    F: FnMut() -> Effect<R, E, A> + Send + 'static,
{
    Effect::suspend(move || {
        make().flat_map(move |value| match schedule.decide(attempt, &value) {
            Decision::Continue(delay) => after(delay, repeat_from(make, schedule, attempt + 1)),
            Decision::Done => Effect::pure(value),
        })
    })
}

fn after<R, E, A>(delay: Duration, effect: Effect<R, E, A>) -> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    if delay.is_zero() {
        effect
    } else {
        effect.delay(delay)
    }
}
