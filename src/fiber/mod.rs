//! Fibers: lightweight, interruptible threads of effect evaluation.
//!
//! Forking an effect returns a [`Fiber`] handle. The handle can await the
//! fiber's [`Exit`], join it (propagating failures and merging fiber-local
//! state), or interrupt it. Every fiber is registered in a [`Scope`]; when a
//! fiber finishes, the children it never joined are interrupted.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: IO<String, i32> = IO::pure(20)
//!     .fork()
//!     .flat_map(|fiber| fiber.join())
//!     .fmap(|value| value * 2 + 2);
//! assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(42));
//! ```

pub(crate) mod context;
mod fiber_ref;
mod id;
mod scope;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub use fiber_ref::FiberRef;
pub(crate) use fiber_ref::FiberRefs;
pub use id::FiberId;
pub use scope::Scope;

use crate::effect::Effect;
use crate::effect::instruction::{Instruction, erase, unerase_exit};
use crate::exit::Exit;
use context::FiberContext;

/// The externally observable state of a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberStatus {
    /// The fiber is evaluating or is scheduled to.
    Running,
    /// The fiber is waiting on an asynchronous boundary.
    Suspended {
        /// Whether an interruption would take effect immediately.
        interruptible: bool,
    },
    /// The fiber has produced its exit.
    Done,
}

/// A snapshot of the running fiber, as seen from inside it.
#[derive(Clone, Debug)]
pub struct FiberDescriptor {
    /// The fiber's id.
    pub id: FiberId,
    /// Whether the fiber is currently in an interruptible region.
    pub interruptible: bool,
    /// The scope in which the fiber's children are registered.
    pub scope: Scope,
    /// The fibers that have requested interruption so far.
    pub interruptors: Vec<FiberId>,
}

/// A handle to a forked fiber that fails with `E` or succeeds with `A`.
///
/// Handles are single-consumer: awaiting, joining, or interrupting consumes
/// the handle and takes the fiber's exit.
pub struct Fiber<E, A> {
    context: Arc<FiberContext>,
    marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Fiber")
            .field("id", &self.context.id())
            .field("status", &self.context.status())
            .finish()
    }
}

impl<E, A> Fiber<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    pub(crate) const fn new(context: Arc<FiberContext>) -> Self {
        Self {
            context,
            marker: PhantomData,
        }
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.context.id()
    }

    /// The fiber's current status.
    pub fn status(&self) -> FiberStatus {
        self.context.status()
    }

    /// Returns `true` once the fiber has produced its exit.
    pub fn is_done(&self) -> bool {
        self.context.is_done()
    }

    /// The scope in which this fiber's own children are registered.
    pub fn children(&self) -> Scope {
        self.context.scope().clone()
    }

    /// Waits for the fiber's exit. Never fails.
    pub fn await_exit<R: 'static, E2: Send + 'static>(self) -> Effect<R, E2, Exit<E, A>> {
        let context = self.context;
        Effect::from_instruction(Instruction::Async(Box::new(move |resume| {
            let finished = Arc::clone(&context);
            context.on_done(Box::new(move || {
                resume.resume(Instruction::Total(Box::new(move || {
                    erase(unerase_exit::<E, A>(finished.take_exit()))
                })));
            }));
            None
        })))
    }

    /// Waits for the fiber, merges its fiber-local state into the caller,
    /// and succeeds or fails exactly as the fiber did.
    pub fn join<R: 'static>(self) -> Effect<R, E, A> {
        let inherit = self.inherit_refs::<R, E>();
        self.await_exit()
            .flat_map(move |exit| inherit.then(Effect::done(exit)))
    }

    /// Merges the finished fiber's fiber-local state into the caller.
    ///
    /// Does nothing while the fiber is still running.
    pub fn inherit_refs<R: 'static, E2: Send + 'static>(&self) -> Effect<R, E2, ()> {
        let context = Arc::clone(&self.context);
        Effect::from_instruction(Instruction::FiberRefs(Box::new(move |refs| {
            if let Some(child) = context.final_refs() {
                refs.join(&child);
            }
            erase(())
        })))
    }

    /// Interrupts the fiber on behalf of the caller and waits for its exit.
    pub fn interrupt<R: 'static, E2: Send + 'static>(self) -> Effect<R, E2, Exit<E, A>> {
        Effect::<R, E2, FiberId>::fiber_id()
            .flat_map(move |caller| self.interrupt_as(caller))
    }

    /// Interrupts the fiber on behalf of `by` and waits for its exit.
    pub fn interrupt_as<R: 'static, E2: Send + 'static>(
        self,
        by: FiberId,
    ) -> Effect<R, E2, Exit<E, A>> {
        let context = Arc::clone(&self.context);
        Effect::<R, E2, ()>::total(move || context.interrupt_as(by)).then(self.await_exit())
    }

    /// Requests interruption without waiting for the fiber to finish.
    pub fn interrupt_fork<R: 'static, E2: Send + 'static>(&self) -> Effect<R, E2, ()> {
        let context = Arc::clone(&self.context);
        Effect::<R, E2, FiberId>::fiber_id()
            .flat_map(move |caller| Effect::total(move || context.interrupt_as(caller)))
    }

    /// Interrupts every fiber, then waits for all of them.
    pub fn interrupt_all<R: 'static, E2: Send + 'static>(fibers: Vec<Self>) -> Effect<R, E2, ()> {
        Effect::<R, E2, FiberId>::fiber_id().flat_map(move |caller| {
            let contexts = fibers.into_iter().map(|fiber| fiber.context).collect();
            Effect::from_instruction(context::interrupt_and_await(contexts, caller))
        })
    }

    /// Joins every fiber in order, collecting their values.
    pub fn join_all<R: 'static>(fibers: Vec<Self>) -> Effect<R, E, Vec<A>> {
        Effect::foreach(fibers, |fiber| fiber.join())
    }
}

static_assertions::assert_impl_all!(Fiber<String, i32>: Send, Sync);
static_assertions::assert_impl_all!(Scope: Send, Sync, Clone);
static_assertions::assert_impl_all!(FiberRef<i32>: Send, Sync, Clone);
