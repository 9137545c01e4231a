//! The erased instruction set interpreted by the fiber executor.
//!
//! [`Effect`](super::Effect) is a typed view over an [`Instruction`] tree.
//! Values travel through the tree as `Box<dyn Any + Send>` so continuations
//! can change the value type; the typed layer erases on the way in and
//! downcasts on the way out.

use std::any::{Any, type_name};
use std::sync::Arc;

use crate::cause::Cause;
use crate::exit::Exit;
use crate::fiber::context::{FiberContext, Resume};
use crate::fiber::{FiberDescriptor, FiberRefs, Scope};

/// An erased success value or typed error.
pub(crate) type Value = Box<dyn Any + Send>;

/// An erased environment.
pub(crate) type Env = Arc<dyn Any + Send + Sync>;

pub(crate) type Continuation = Box<dyn FnOnce(Value) -> Instruction + Send>;
pub(crate) type FailureHandler = Box<dyn FnOnce(Cause<Value>) -> Instruction + Send>;
pub(crate) type Register = Box<dyn FnOnce(Resume) -> Option<Instruction> + Send>;
pub(crate) type RaceHandler =
    Box<dyn FnOnce(Exit<Value, Value>, Arc<FiberContext>) -> Instruction + Send>;

pub(crate) enum Instruction {
    Succeed(Value),
    Fail(Cause<Value>),
    Total(Box<dyn FnOnce() -> Value + Send>),
    Partial(Box<dyn FnOnce() -> Result<Value, Value> + Send>),
    Suspend(Box<dyn FnOnce() -> Instruction + Send>),
    Chain(Box<Instruction>, Continuation),
    Fold {
        effect: Box<Instruction>,
        on_failure: FailureHandler,
        on_success: Continuation,
    },
    Read(Box<dyn FnOnce(&Env) -> Instruction + Send>),
    Provide {
        environment: Env,
        effect: Box<Instruction>,
    },
    Fork {
        effect: Box<Instruction>,
        scope: Option<Scope>,
    },
    Async(Register),
    RaceWith {
        left: Box<Instruction>,
        right: Box<Instruction>,
        on_left: RaceHandler,
        on_right: RaceHandler,
    },
    InterruptStatus {
        effect: Box<Instruction>,
        interruptible: bool,
    },
    CheckInterrupt(Box<dyn FnOnce(bool) -> Instruction + Send>),
    Descriptor(Box<dyn FnOnce(FiberDescriptor) -> Instruction + Send>),
    Yield,
    FiberRefs(Box<dyn FnOnce(&mut FiberRefs) -> Value + Send>),
}

impl Instruction {
    pub(crate) fn unit() -> Self {
        Self::Succeed(erase(()))
    }

    pub(crate) fn from_exit(exit: Exit<Value, Value>) -> Self {
        match exit {
            Exit::Success(value) => Self::Succeed(value),
            Exit::Failure(cause) => Self::Fail(cause),
        }
    }

    pub(crate) fn chain<F>(self, continuation: F) -> Self
    where
        F: FnOnce(Value) -> Self + Send + 'static,
    {
        Self::Chain(Box::new(self), Box::new(continuation))
    }

    pub(crate) fn uninterruptible(self) -> Self {
        Self::InterruptStatus {
            effect: Box::new(self),
            interruptible: false,
        }
    }

    pub(crate) fn with_unit_environment(self) -> Self {
        Self::Provide {
            environment: unit_environment(),
            effect: Box::new(self),
        }
    }

    /// Runs the instruction and discards its outcome, logging failures.
    pub(crate) fn ignore_failure(self, context: &'static str) -> Self {
        Self::Fold {
            effect: Box::new(self),
            on_failure: Box::new(move |cause| {
                tracing::warn!(
                    context,
                    cause = %cause.map_ref(|_| "<typed error>"),
                    "finalizer failed"
                );
                Self::unit()
            }),
            on_success: Box::new(|_| Self::unit()),
        }
    }

    /// Runs each instruction in order, discarding results.
    pub(crate) fn sequence(instructions: Vec<Self>) -> Self {
        instructions
            .into_iter()
            .rev()
            .fold(Self::unit(), |rest, instruction| {
                instruction.chain(move |_| rest)
            })
    }

    /// Suspends until `fiber` is done, without consuming its exit.
    pub(crate) fn await_done(fiber: Arc<FiberContext>) -> Self {
        Self::Async(Box::new(move |resume| {
            fiber.on_done(Box::new(move || resume.resume(Self::unit())));
            None
        }))
    }
}

pub(crate) fn unit_environment() -> Env {
    Arc::new(())
}

pub(crate) fn erase<T: Send + 'static>(value: T) -> Value {
    Box::new(value)
}

/// Recovers a typed value.
///
/// # Panics
///
/// Panics when the erased value has a different type, which indicates a bug
/// in the typed layer rather than in user code.
pub(crate) fn unerase<T: 'static>(value: Value) -> T {
    match value.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => panic!(
            "internal error: erased value is not a `{}`",
            type_name::<T>()
        ),
    }
}

pub(crate) fn erase_cause<E: Send + 'static>(cause: Cause<E>) -> Cause<Value> {
    cause.map(erase)
}

pub(crate) fn unerase_cause<E: 'static>(cause: Cause<Value>) -> Cause<E> {
    cause.map(unerase::<E>)
}

pub(crate) fn erase_exit<E: Send + 'static, A: Send + 'static>(exit: Exit<E, A>) -> Exit<Value, Value> {
    match exit {
        Exit::Success(value) => Exit::Success(erase(value)),
        Exit::Failure(cause) => Exit::Failure(erase_cause(cause)),
    }
}

pub(crate) fn unerase_exit<E: 'static, A: 'static>(exit: Exit<Value, Value>) -> Exit<E, A> {
    match exit {
        Exit::Success(value) => Exit::Success(unerase(value)),
        Exit::Failure(cause) => Exit::Failure(unerase_cause(cause)),
    }
}
