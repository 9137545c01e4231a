//! Forking and structural parallel composition.
//!
//! Every parallel combinator here is derived from [`Effect::race_with`],
//! which forks both sides into the caller's scope and hands the first exit,
//! together with a handle to the other side, to a continuation.

use std::convert::Infallible;
use std::time::Duration;

use super::Effect;
use super::instruction::{Instruction, erase, unerase, unerase_exit};
use crate::cause::Cause;
use crate::either::Either;
use crate::exit::Exit;
use crate::fiber::{Fiber, Scope};

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    // =========================================================================
    // Forking
    // =========================================================================

    /// Runs this effect in a new fiber supervised by the caller's scope.
    ///
    /// The child inherits the environment, a fork of the fiber-local state,
    /// and the current interrupt status.
    pub fn fork<E2: Send + 'static>(self) -> Effect<R, E2, Fiber<E, A>> {
        self.fork_with_scope(None)
    }

    /// Runs this effect in a new fiber registered in the global scope.
    ///
    /// The child outlives its parent.
    pub fn fork_daemon<E2: Send + 'static>(self) -> Effect<R, E2, Fiber<E, A>> {
        self.fork_with_scope(Some(Scope::global()))
    }

    /// Runs this effect in a new fiber registered in `scope`.
    pub fn fork_in<E2: Send + 'static>(self, scope: &Scope) -> Effect<R, E2, Fiber<E, A>> {
        self.fork_with_scope(Some(scope.clone()))
    }

    fn fork_with_scope<E2: Send + 'static>(self, scope: Option<Scope>) -> Effect<R, E2, Fiber<E, A>> {
        let fork = Instruction::Fork {
            effect: Box::new(self.instruction),
            scope,
        };
        Effect::from_instruction(
            fork.chain(|child| Instruction::Succeed(erase(Fiber::<E, A>::new(unerase(child))))),
        )
    }

    // =========================================================================
    // Racing
    // =========================================================================

    /// Runs both effects concurrently and continues with whichever finishes
    /// first.
    ///
    /// The handler receives the winner's exit and the loser's fiber, which
    /// is still running. Interrupting the racing fiber interrupts both
    /// sides.
    pub fn race_with<E1, B, E2, C, L, Rt>(
        self,
        that: Effect<R, E1, B>,
        on_left: L,
        on_right: Rt,
    ) -> Effect<R, E2, C>
    where
        E1: Send + 'static,
        B: Send + 'static,
        E2: Send + 'static,
        C: Send + 'static,
        L: FnOnce(Exit<E, A>, Fiber<E1, B>) -> Effect<R, E2, C> + Send + 'static,
        Rt: FnOnce(Exit<E1, B>, Fiber<E, A>) -> Effect<R, E2, C> + Send + 'static,
    {
        Effect::from_instruction(Instruction::RaceWith {
            left: Box::new(self.instruction),
            right: Box::new(that.instruction),
            on_left: Box::new(move |exit, loser| {
                on_left(unerase_exit(exit), Fiber::new(loser)).into_instruction()
            }),
            on_right: Box::new(move |exit, loser| {
                on_right(unerase_exit(exit), Fiber::new(loser)).into_instruction()
            }),
        })
    }

    /// Returns the first success, interrupting the other side.
    ///
    /// If the first side to finish fails, the other side is awaited; when
    /// both fail the causes are combined with [`Cause::both`].
    pub fn race(self, that: Self) -> Self {
        self.race_with(that, Self::race_winner, Self::race_winner)
    }

    fn race_winner(exit: Exit<E, A>, loser: Fiber<E, A>) -> Self {
        match exit {
            Exit::Success(value) => loser.interrupt::<R, E>().as_(value),
            Exit::Failure(cause) => loser
                .join()
                .catch_all_cause(move |other| Self::fail_cause(Cause::both(cause, other))),
        }
    }

    /// Like [`Effect::race`] but keeps track of which side won.
    pub fn race_either<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, Either<A, B>> {
        self.fmap(Either::Left).race(that.fmap(Either::Right))
    }

    /// Runs both effects concurrently and pairs their values.
    ///
    /// The first failure interrupts the other side and becomes the result.
    pub fn zip_par<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.race_with(
            that,
            |exit, right| match exit {
                Exit::Success(left) => right.join().fmap(move |right| (left, right)),
                Exit::Failure(cause) => right.interrupt::<R, E>().then(Effect::fail_cause(cause)),
            },
            |exit, left| match exit {
                Exit::Success(right) => left.join().fmap(move |left| (left, right)),
                Exit::Failure(cause) => left.interrupt::<R, E>().then(Effect::fail_cause(cause)),
            },
        )
    }

    /// Alias for [`Effect::zip_par`].
    pub fn par<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_par(that)
    }

    /// Runs both effects concurrently and combines their values.
    pub fn zip_par_with<B, C, F>(self, that: Effect<R, E, B>, function: F) -> Effect<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        self.zip_par(that).fmap(move |(left, right)| function(left, right))
    }

    /// Runs every effect concurrently and collects the values in input
    /// order.
    ///
    /// The first failure interrupts the effects still running.
    pub fn collect_all_par(mut effects: Vec<Self>) -> Effect<R, E, Vec<A>> {
        match effects.len() {
            0 => Effect::pure(Vec::new()),
            1 => match effects.pop() {
                Some(effect) => effect.fmap(|value| vec![value]),
                None => Effect::pure(Vec::new()),
            },
            length => {
                let right = effects.split_off(length / 2);
                Self::collect_all_par(effects).zip_par_with(
                    Self::collect_all_par(right),
                    |mut left, right| {
                        left.extend(right);
                        left
                    },
                )
            }
        }
    }

    /// Applies `function` to every item and runs the effects concurrently.
    pub fn foreach_par<T, I, F>(items: I, function: F) -> Effect<R, E, Vec<A>>
    where
        I: IntoIterator<Item = T> + Send + 'static,
        F: FnMut(T) -> Self + Send + 'static,
    {
        Effect::suspend(move || Self::collect_all_par(items.into_iter().map(function).collect()))
    }

    /// Like [`Effect::foreach_par`], with at most `parallelism` effects
    /// running at a time.
    #[cfg(feature = "sync")]
    pub fn foreach_par_n<T, I, F>(parallelism: usize, items: I, mut function: F) -> Effect<R, E, Vec<A>>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T> + Send + 'static,
        F: FnMut(T) -> Self + Send + 'static,
    {
        crate::sync::Semaphore::make::<R, E>(parallelism.max(1)).flat_map(move |semaphore| {
            Self::foreach_par(items, move |item| semaphore.with_permit(function(item)))
        })
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    /// Succeeds with `None` if this effect does not finish within
    /// `duration`; the effect is then interrupted.
    pub fn timeout(self, duration: Duration) -> Effect<R, E, Option<A>> {
        self.fmap(Some).race_with(
            Effect::<R, Infallible, ()>::sleep(duration),
            |exit, timer| timer.interrupt::<R, E>().then(Effect::done(exit)),
            |_, running| running.interrupt::<R, E>().as_(None),
        )
    }

    /// Fails with `error` if this effect does not finish within `duration`.
    pub fn timeout_fail(self, error: E, duration: Duration) -> Self {
        self.timeout(duration).flat_map(move |outcome| match outcome {
            Some(value) => Self::pure(value),
            None => Self::fail(error),
        })
    }
}
