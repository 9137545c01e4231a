//! Sequencing, error handling, and resource safety.

use std::convert::Infallible;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::Effect;
use super::instruction::{Instruction, unerase, unerase_cause};
use crate::cause::{Cause, Defect};
use crate::exit::Exit;

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    // =========================================================================
    // Sequencing
    // =========================================================================

    /// Chains a computation that depends on this effect's value.
    pub fn flat_map<B, F>(self, function: F) -> Effect<R, E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<R, E, B> + Send + 'static,
    {
        Effect::from_instruction(
            self.instruction
                .chain(move |value| function(unerase(value)).into_instruction()),
        )
    }

    /// Alias for [`Effect::flat_map`].
    pub fn and_then<B, F>(self, function: F) -> Effect<R, E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<R, E, B> + Send + 'static,
    {
        self.flat_map(function)
    }

    /// Transforms the success value.
    ///
    /// Defined as `flat_map(|a| pure(function(a)))`.
    pub fn fmap<B, F>(self, function: F) -> Effect<R, E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |value| Effect::pure(function(value)))
    }

    /// Runs `next` after this effect, discarding this effect's value.
    pub fn then<B>(self, next: Effect<R, E, B>) -> Effect<R, E, B>
    where
        B: Send + 'static,
    {
        self.flat_map(move |_| next)
    }

    /// Runs both effects in sequence and combines their values.
    pub fn map2<B, C, F>(self, other: Effect<R, E, B>, function: F) -> Effect<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        self.flat_map(move |left| other.fmap(move |right| function(left, right)))
    }

    /// Runs both effects in sequence and pairs their values.
    pub fn product<B>(self, other: Effect<R, E, B>) -> Effect<R, E, (A, B)>
    where
        B: Send + 'static,
    {
        self.map2(other, |left, right| (left, right))
    }

    /// Replaces the success value.
    pub fn as_<B: Send + 'static>(self, value: B) -> Effect<R, E, B> {
        self.fmap(move |_| value)
    }

    /// Discards the success value.
    pub fn unit_value(self) -> Effect<R, E, ()> {
        self.fmap(|_| ())
    }

    /// Runs an effect on the success value, keeping the value.
    pub fn tap<X, F>(self, function: F) -> Self
    where
        X: Send + 'static,
        F: FnOnce(&A) -> Effect<R, E, X> + Send + 'static,
    {
        self.flat_map(move |value| {
            let effect = function(&value);
            effect.fmap(move |_| value)
        })
    }

    /// Waits for `duration` before running this effect.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::<R, E, ()>::sleep(duration).then(self)
    }

    /// Runs `effects` in order and collects their values.
    pub fn collect_all(effects: Vec<Self>) -> Effect<R, E, Vec<A>> {
        let capacity = effects.len();
        collect_loop(effects.into_iter(), Vec::with_capacity(capacity))
    }

    /// Applies `function` to every item and runs the effects in order.
    pub fn foreach<T, I, F>(items: I, mut function: F) -> Effect<R, E, Vec<A>>
    where
        I: IntoIterator<Item = T> + Send + 'static,
        F: FnMut(T) -> Self + Send + 'static,
    {
        Effect::suspend(move || {
            let effects: Vec<Self> = items.into_iter().map(&mut function).collect();
            Self::collect_all(effects)
        })
    }

    // =========================================================================
    // Error handling
    // =========================================================================

    /// Handles the full cause of failure and the success value.
    pub fn fold_cause_effect<E2, B, F, S>(self, on_failure: F, on_success: S) -> Effect<R, E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        F: FnOnce(Cause<E>) -> Effect<R, E2, B> + Send + 'static,
        S: FnOnce(A) -> Effect<R, E2, B> + Send + 'static,
    {
        Effect::from_instruction(Instruction::Fold {
            effect: Box::new(self.instruction),
            on_failure: Box::new(move |cause| on_failure(unerase_cause(cause)).into_instruction()),
            on_success: Box::new(move |value| on_success(unerase(value)).into_instruction()),
        })
    }

    /// Handles typed failures and the success value effectfully.
    ///
    /// Defects and interruption are propagated untouched.
    pub fn fold_effect<E2, B, F, S>(self, on_failure: F, on_success: S) -> Effect<R, E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        F: FnOnce(E) -> Effect<R, E2, B> + Send + 'static,
        S: FnOnce(A) -> Effect<R, E2, B> + Send + 'static,
    {
        self.fold_cause_effect(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => on_failure(error),
                Err(cause) => Effect::fail_cause(cause.strip_failures()),
            },
            on_success,
        )
    }

    /// Handles typed failures and the success value purely.
    pub fn fold<E2, B, F, S>(self, on_failure: F, on_success: S) -> Effect<R, E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        F: FnOnce(E) -> B + Send + 'static,
        S: FnOnce(A) -> B + Send + 'static,
    {
        self.fold_effect(
            move |error| Effect::pure(on_failure(error)),
            move |value| Effect::pure(on_success(value)),
        )
    }

    /// Recovers from typed failures. Defects and interruption are not seen.
    pub fn catch_all<E2, F>(self, handler: F) -> Effect<R, E2, A>
    where
        E2: Send + 'static,
        F: FnOnce(E) -> Effect<R, E2, A> + Send + 'static,
    {
        self.fold_effect(handler, Effect::pure)
    }

    /// Recovers from any failure, including defects and interruption.
    pub fn catch_all_cause<E2, F>(self, handler: F) -> Effect<R, E2, A>
    where
        E2: Send + 'static,
        F: FnOnce(Cause<E>) -> Effect<R, E2, A> + Send + 'static,
    {
        self.fold_cause_effect(handler, Effect::pure)
    }

    /// Runs `that` if this effect fails with a typed error.
    pub fn or_else<E2: Send + 'static>(self, that: Effect<R, E2, A>) -> Effect<R, E2, A> {
        self.catch_all(move |_| that)
    }

    /// Transforms every typed failure.
    pub fn map_err<E2, F>(self, function: F) -> Effect<R, E2, A>
    where
        E2: Send + 'static,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        self.map_error_cause(move |cause| cause.map(function))
    }

    /// Transforms the cause of failure as a whole.
    pub fn map_error_cause<E2, F>(self, function: F) -> Effect<R, E2, A>
    where
        E2: Send + 'static,
        F: FnOnce(Cause<E>) -> Cause<E2> + Send + 'static,
    {
        self.fold_cause_effect(
            move |cause| Effect::fail_cause(function(cause)),
            Effect::pure,
        )
    }

    /// Moves typed failures into the success channel.
    pub fn either<E2: Send + 'static>(self) -> Effect<R, E2, Result<A, E>> {
        self.fold(Err, Ok)
    }

    /// Moves the whole outcome into the success channel. Never fails.
    pub fn exit<E2: Send + 'static>(self) -> Effect<R, E2, Exit<E, A>> {
        self.fold_cause_effect(
            |cause| Effect::pure(Exit::Failure(cause)),
            |value| Effect::pure(Exit::Success(value)),
        )
    }

    /// Exposes the full cause as the typed error.
    pub fn sandbox(self) -> Effect<R, Cause<E>, A> {
        self.fold_cause_effect(Effect::fail, Effect::pure)
    }

    /// Turns defects into typed failures.
    pub fn resurrect(self) -> Self
    where
        E: From<Defect>,
    {
        self.map_error_cause(promote_defects)
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Runs `cleanup` with the outcome once this effect completes, however
    /// it completes.
    ///
    /// The cleanup runs uninterruptibly. Its own failure is appended to the
    /// outcome with [`Cause::then`].
    pub fn on_exit<X, F>(self, cleanup: F) -> Self
    where
        X: Send + 'static,
        F: FnOnce(&Exit<E, A>) -> Effect<R, Infallible, X> + Send + 'static,
    {
        Self::uninterruptible_mask(move |restore| {
            restore.apply(self).exit::<E>().flat_map(move |exit| {
                let finalizer = panic::catch_unwind(AssertUnwindSafe(|| cleanup(&exit)))
                    .unwrap_or_else(|payload| Effect::die(Defect::from_panic(payload)));
                finalizer
                    .exit::<E>()
                    .flat_map(move |finalizer_exit| match finalizer_exit {
                        Exit::Success(_) => Self::done(exit),
                        Exit::Failure(cause) => Self::fail_cause(match exit {
                            Exit::Success(_) => cause.widen(),
                            Exit::Failure(original) => Cause::then(original, cause.widen()),
                        }),
                    })
            })
        })
    }

    /// Runs `finalizer` after this effect, however it completes.
    pub fn ensuring<X: Send + 'static>(self, finalizer: Effect<R, Infallible, X>) -> Self {
        self.on_exit(move |_| finalizer)
    }

    /// Runs `cleanup` only if this effect fails.
    pub fn on_error<X, F>(self, cleanup: F) -> Self
    where
        X: Send + 'static,
        F: FnOnce(&Cause<E>) -> Effect<R, Infallible, X> + Send + 'static,
    {
        self.on_exit(move |exit| match exit {
            Exit::Failure(cause) => cleanup(cause).unit_value(),
            Exit::Success(_) => Effect::unit(),
        })
    }

    /// Runs `cleanup` only if this effect is interrupted.
    pub fn on_interrupt<X: Send + 'static>(self, cleanup: Effect<R, Infallible, X>) -> Self {
        self.on_exit(move |exit| {
            if exit.is_interrupted() {
                cleanup.unit_value()
            } else {
                Effect::unit()
            }
        })
    }

    /// Acquires a resource, uses it, and releases it with the outcome of the
    /// use.
    ///
    /// Acquisition and release are uninterruptible; the use is
    /// interruptible. The release runs exactly once if the acquisition
    /// succeeded.
    pub fn bracket_exit<Res, X, U, Rel>(
        acquire: Effect<R, E, Res>,
        use_resource: U,
        release: Rel,
    ) -> Self
    where
        Res: Clone + Send + 'static,
        X: Send + 'static,
        U: FnOnce(Res) -> Self + Send + 'static,
        Rel: FnOnce(Res, &Exit<E, A>) -> Effect<R, Infallible, X> + Send + 'static,
    {
        Self::uninterruptible_mask(move |restore| {
            acquire.flat_map(move |resource| {
                let released = resource.clone();
                restore
                    .apply(Self::suspend(move || use_resource(resource)))
                    .on_exit(move |exit| release(released, exit))
            })
        })
    }

    /// Acquires a resource, uses it, and releases it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lambars_fiber::prelude::*;
    ///
    /// let runtime = Runtime::new().unwrap();
    /// let program: UIO<(i32, i32)> = Ref::make(0).flat_map(|released| {
    ///     let observed = released.clone();
    ///     Effect::bracket(
    ///         Effect::pure(10),
    ///         |resource| Effect::pure(resource * 2),
    ///         move |_| released.set(1),
    ///     )
    ///     .flat_map(move |value| observed.get().fmap(move |flag| (value, flag)))
    /// });
    /// assert_eq!(runtime.run_blocking_exit(program), Exit::succeed((20, 1)));
    /// ```
    pub fn bracket<Res, X, U, Rel>(acquire: Effect<R, E, Res>, use_resource: U, release: Rel) -> Self
    where
        Res: Clone + Send + 'static,
        X: Send + 'static,
        U: FnOnce(Res) -> Self + Send + 'static,
        Rel: FnOnce(Res) -> Effect<R, Infallible, X> + Send + 'static,
    {
        Self::bracket_exit(acquire, use_resource, move |resource, _| release(resource))
    }

    // =========================================================================
    // Interruption and environment
    // =========================================================================

    /// Runs this effect without acting on interruption.
    pub fn uninterruptible(self) -> Self {
        Self::from_instruction(self.instruction.uninterruptible())
    }

    /// Runs this effect acting on interruption, even inside an
    /// uninterruptible region.
    pub fn interruptible(self) -> Self {
        Self::from_instruction(Instruction::InterruptStatus {
            effect: Box::new(self.instruction),
            interruptible: true,
        })
    }

    /// Supplies the environment, removing the requirement.
    pub fn provide<R0>(self, environment: R) -> Effect<R0, E, A>
    where
        R: Send + Sync,
    {
        Effect::from_instruction(Instruction::Provide {
            environment: Arc::new(environment),
            effect: Box::new(self.instruction),
        })
    }
}

impl<R, E, A> Effect<R, Cause<E>, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Reverses [`Effect::sandbox`].
    pub fn unsandbox(self) -> Effect<R, E, A> {
        self.map_error_cause(Cause::flatten)
    }
}

fn collect_loop<R, E, A>(
    mut remaining: std::vec::IntoIter<Effect<R, E, A>>,
    mut collected: Vec<A>,
) -> Effect<R, E, Vec<A>>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    match remaining.next() {
        None => Effect::pure(collected),
        Some(effect) => effect.flat_map(move |value| {
            collected.push(value);
            collect_loop(remaining, collected)
        }),
    }
}

fn promote_defects<E: From<Defect>>(cause: Cause<E>) -> Cause<E> {
    match cause {
        Cause::Die(defect) => Cause::Fail(E::from(defect)),
        Cause::Then(left, right) => Cause::then(promote_defects(*left), promote_defects(*right)),
        Cause::Both(left, right) => Cause::both(promote_defects(*left), promote_defects(*right)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::IO;
    use crate::runtime::Runtime;
    use rstest::rstest;

    fn runtime() -> Runtime {
        Runtime::new().expect("runtime")
    }

    #[rstest]
    fn fail_is_a_value_until_run() {
        let effect: IO<String, i32> = Effect::fail("boom".to_string());
        drop(effect);
    }

    #[rstest]
    fn catch_all_does_not_see_defects() {
        let program: IO<String, i32> = Effect::<(), String, i32>::die_message("bug")
            .catch_all(|_| Effect::pure(0));
        let exit = runtime().run_blocking_exit(program);
        assert!(exit.cause().is_some_and(Cause::is_die));
    }

    #[rstest]
    fn catch_all_cause_sees_defects() {
        let program: IO<String, bool> = Effect::<(), String, bool>::die_message("bug")
            .catch_all_cause(|cause| Effect::pure(cause.is_die()));
        assert_eq!(runtime().run_blocking_exit(program), Exit::succeed(true));
    }

    #[rstest]
    fn panics_in_continuations_become_defects() {
        let program: IO<String, i32> = Effect::pure(1).fmap(|_: i32| -> i32 { panic!("kaboom") });
        let exit = runtime().run_blocking_exit(program);
        let defects = exit.cause().map(Cause::defects).unwrap_or_default();
        assert_eq!(defects, vec![Defect::message("kaboom")]);
    }

    #[rstest]
    fn sandbox_and_unsandbox_round_trip() {
        let program: IO<String, i32> = Effect::<(), String, i32>::fail("e".to_string())
            .sandbox()
            .unsandbox();
        assert_eq!(
            runtime().run_blocking_exit(program),
            Exit::fail("e".to_string())
        );
    }

    #[rstest]
    fn ensuring_failure_is_appended_sequentially() {
        let program: IO<String, i32> = Effect::<(), String, i32>::fail("use".to_string())
            .ensuring(Effect::<(), Infallible, ()>::die_message("release"));
        let exit = runtime().run_blocking_exit(program);
        assert_eq!(
            exit,
            Exit::Failure(Cause::then(
                Cause::fail("use".to_string()),
                Cause::die(Defect::message("release"))
            ))
        );
    }
}
