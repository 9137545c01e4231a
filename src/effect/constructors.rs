//! Primitive effect constructors.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use futures::FutureExt;

use super::instruction::{Instruction, erase, erase_cause, erase_exit};
use super::{Effect, UIO};
use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::fiber::context::Resume;
use crate::fiber::{FiberDescriptor, FiberId};
use crate::runtime::Runtime;

// =============================================================================
// Callback
// =============================================================================

/// The one-shot callback given to [`Effect::async_effect`] and
/// [`Effect::async_interrupt`].
///
/// Completing the callback resumes the suspended fiber. Completion after the
/// fiber was interrupted is ignored.
pub struct Callback<E, A> {
    resume: Resume,
    marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Callback<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    pub(crate) const fn new(resume: Resume) -> Self {
        Self {
            resume,
            marker: PhantomData,
        }
    }

    /// Resumes the fiber with a value.
    pub fn succeed(self, value: A) {
        self.resume.resume(Instruction::Succeed(erase(value)));
    }

    /// Resumes the fiber with a typed failure.
    pub fn fail(self, error: E) {
        self.halt(Cause::fail(error));
    }

    /// Resumes the fiber with a defect.
    pub fn die(self, defect: Defect) {
        self.halt(Cause::die(defect));
    }

    /// Resumes the fiber with an arbitrary cause.
    pub fn halt(self, cause: Cause<E>) {
        self.resume.resume(Instruction::Fail(erase_cause(cause)));
    }

    /// Resumes the fiber with an exit.
    pub fn done(self, exit: Exit<E, A>) {
        self.resume.resume(Instruction::from_exit(erase_exit(exit)));
    }

    /// Resumes the fiber by running `effect` in its place.
    pub fn resume_with(self, effect: super::IO<E, A>) {
        self.resume
            .resume(effect.into_instruction().with_unit_environment());
    }

    /// The id of the suspended fiber.
    pub fn fiber_id(&self) -> FiberId {
        self.resume.fiber_id()
    }

    /// The runtime executing the suspended fiber.
    pub fn runtime(&self) -> Runtime {
        self.resume.runtime().clone()
    }
}

// =============================================================================
// InterruptRestore
// =============================================================================

/// Restores the interrupt status that was in effect outside an
/// [`Effect::uninterruptible_mask`] region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterruptRestore {
    interruptible: bool,
}

impl InterruptRestore {
    /// Runs `effect` with the outer interrupt status.
    pub fn apply<R, E, A>(self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        Effect::from_instruction(Instruction::InterruptStatus {
            effect: Box::new(effect.into_instruction()),
            interruptible: self.interruptible,
        })
    }

    /// Whether the outer region was interruptible.
    pub const fn is_interruptible(self) -> bool {
        self.interruptible
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Succeeds with `value`.
    pub fn pure(value: A) -> Self {
        Self::from_instruction(Instruction::Succeed(erase(value)))
    }

    /// Succeeds with `value`. Alias of [`Effect::pure`].
    pub fn succeed(value: A) -> Self {
        Self::pure(value)
    }

    /// Fails with a typed error.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// Fails with an arbitrary cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_instruction(Instruction::Fail(erase_cause(cause)))
    }

    /// Fails with a defect.
    pub fn die(defect: Defect) -> Self {
        Self::fail_cause(Cause::die(defect))
    }

    /// Fails with a defect carrying `message`.
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::message(message))
    }

    /// Succeeds or fails as `exit` describes.
    pub fn done(exit: Exit<E, A>) -> Self {
        Self::from_instruction(Instruction::from_exit(erase_exit(exit)))
    }

    /// Lifts a `Result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::pure(value),
            Err(error) => Self::fail(error),
        }
    }

    /// Runs a side effect that cannot fail. A panic becomes a defect.
    pub fn total<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_instruction(Instruction::Total(Box::new(move || erase(thunk()))))
    }

    /// Runs a side effect that reports failure through `Result`.
    pub fn partial<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Result<A, E> + Send + 'static,
    {
        Self::from_instruction(Instruction::Partial(Box::new(move || {
            thunk().map(erase).map_err(erase)
        })))
    }

    /// Runs a side effect, turning a panic into a typed failure.
    pub fn try_catch<F, H>(thunk: F, on_panic: H) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
        H: FnOnce(Defect) -> E + Send + 'static,
    {
        Self::from_instruction(Instruction::Partial(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(thunk)) {
                Ok(value) => Ok(erase(value)),
                Err(payload) => Err(erase(on_panic(Defect::from_panic(payload)))),
            }
        })))
    }

    /// Defers the construction of an effect until it is run.
    pub fn suspend<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Self::from_instruction(Instruction::Suspend(Box::new(move || {
            thunk().into_instruction()
        })))
    }

    /// Suspends until `register`'s callback is completed.
    pub fn async_effect<F>(register: F) -> Self
    where
        F: FnOnce(Callback<E, A>) + Send + 'static,
    {
        Self::async_interrupt(move |callback| {
            register(callback);
            None
        })
    }

    /// Suspends until `register`'s callback is completed.
    ///
    /// `register` may return a canceler that runs, uninterruptibly, if the
    /// fiber is interrupted while suspended.
    pub fn async_interrupt<F>(register: F) -> Self
    where
        F: FnOnce(Callback<E, A>) -> Option<UIO<()>> + Send + 'static,
    {
        Self::from_instruction(Instruction::Async(Box::new(move |resume| {
            register(Callback::new(resume))
                .map(|canceler| canceler.into_instruction().with_unit_environment())
        })))
    }

    /// Runs a future on the host runtime and resumes with its result.
    ///
    /// The future is created when the effect runs and is aborted if the
    /// fiber is interrupted. A panic inside the future becomes a defect.
    pub fn from_future<F, Fut>(make: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<A, E>> + Send + 'static,
    {
        Self::async_interrupt(move |callback: Callback<E, A>| {
            let runtime = callback.runtime();
            let task = runtime.spawn_host(async move {
                match AssertUnwindSafe(make()).catch_unwind().await {
                    Ok(Ok(value)) => callback.succeed(value),
                    Ok(Err(error)) => callback.fail(error),
                    Err(payload) => callback.die(Defect::from_panic(payload)),
                }
            });
            Some(Effect::total(move || task.abort()))
        })
    }

    /// Never completes. Only interruption ends it.
    pub fn never() -> Self {
        Self::from_instruction(Instruction::Async(Box::new(|_resume| None)))
    }

    /// Interrupts the running fiber.
    ///
    /// Only uninterruptible finalizers observe the interruption.
    pub fn interrupt() -> Self {
        Self::from_instruction(Instruction::Async(Box::new(|resume| {
            resume.interrupt_self();
            None
        })))
    }

    /// Fails with an interruption attributed to `fiber_id`.
    pub fn interrupt_as(fiber_id: FiberId) -> Self {
        Self::fail_cause(Cause::interrupt(fiber_id))
    }

    /// Makes the region uninterruptible while letting `body` restore the
    /// outer status for selected parts.
    pub fn uninterruptible_mask<F>(body: F) -> Self
    where
        F: FnOnce(InterruptRestore) -> Self + Send + 'static,
    {
        Self::from_instruction(Instruction::CheckInterrupt(Box::new(move |interruptible| {
            body(InterruptRestore { interruptible })
                .into_instruction()
                .uninterruptible()
        })))
    }

    /// Builds an effect from the running fiber's descriptor.
    pub fn descriptor_with<F>(function: F) -> Self
    where
        F: FnOnce(FiberDescriptor) -> Self + Send + 'static,
    {
        Self::from_instruction(Instruction::Descriptor(Box::new(move |descriptor| {
            function(descriptor).into_instruction()
        })))
    }
}

impl<R, E, A> Effect<R, E, A>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Reads a value out of the environment.
    pub fn access<F>(function: F) -> Self
    where
        F: FnOnce(&R) -> A + Send + 'static,
    {
        Self::access_effect(move |environment| Self::pure(function(environment)))
    }

    /// Builds an effect from the environment.
    pub fn access_effect<F>(function: F) -> Self
    where
        F: FnOnce(&R) -> Self + Send + 'static,
    {
        Self::from_instruction(Instruction::Read(Box::new(move |environment| {
            match environment.downcast_ref::<R>() {
                Some(environment) => function(environment).into_instruction(),
                None => Self::die_message(format!(
                    "environment of type `{}` was not provided",
                    std::any::type_name::<R>()
                ))
                .into_instruction(),
            }
        })))
    }
}

impl<R, E> Effect<R, E, R>
where
    R: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    /// Succeeds with the whole environment.
    pub fn environment() -> Self {
        Self::access(R::clone)
    }
}

impl<R, E> Effect<R, E, ()>
where
    R: 'static,
    E: Send + 'static,
{
    /// Succeeds with `()`.
    pub fn unit() -> Self {
        Self::pure(())
    }

    /// Suspends the fiber for `duration` on the host timer.
    ///
    /// Interruption cancels the timer.
    pub fn sleep(duration: Duration) -> Self {
        Self::async_interrupt(move |callback: Callback<E, ()>| {
            let runtime = callback.runtime();
            let timer = runtime.spawn_host(async move {
                tokio::time::sleep(duration).await;
                callback.succeed(());
            });
            Some(Effect::total(move || timer.abort()))
        })
    }

    /// Gives other fibers a chance to run.
    pub fn yield_now() -> Self {
        Self::from_instruction(Instruction::Yield)
    }
}

impl<R, E> Effect<R, E, FiberId>
where
    R: 'static,
    E: Send + 'static,
{
    /// Succeeds with the running fiber's id.
    pub fn fiber_id() -> Self {
        Self::descriptor_with(|descriptor| Self::pure(descriptor.id))
    }
}

impl<R, E> Effect<R, E, FiberDescriptor>
where
    R: 'static,
    E: Send + 'static,
{
    /// Succeeds with the running fiber's descriptor.
    pub fn descriptor() -> Self {
        Self::descriptor_with(Self::pure)
    }
}

impl<R, E> Effect<R, E, bool>
where
    R: 'static,
    E: Send + 'static,
{
    /// Succeeds with whether the current region is interruptible.
    pub fn is_interruptible() -> Self {
        Self::from_instruction(Instruction::CheckInterrupt(Box::new(|interruptible| {
            Instruction::Succeed(erase(interruptible))
        })))
    }
}

