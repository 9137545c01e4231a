//! Fiber-local state.
//!
//! A [`FiberRef`] gives every fiber its own copy of a value. A child fiber
//! starts from its parent's value passed through the ref's `fork` function,
//! and joining a child merges the child's final value back into the parent
//! with the `join` function.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: UIO<i32> = FiberRef::make(1).flat_map(|fiber_ref| {
//!     let child = fiber_ref.set(2);
//!     child
//!         .fork()
//!         .flat_map(|fiber| fiber.join())
//!         .then(fiber_ref.get())
//! });
//! assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(2));
//! ```

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::effect::Effect;
use crate::effect::instruction::{Instruction, erase};

type AnyValue = Arc<dyn Any + Send + Sync>;
type ForkFunction = Arc<dyn Fn(&AnyValue) -> AnyValue + Send + Sync>;
type JoinFunction = Arc<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Slot {
    value: AnyValue,
    initial: AnyValue,
    fork: ForkFunction,
    join: JoinFunction,
}

/// The fiber-local slots of one fiber.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
    slots: FxHashMap<u64, Slot>,
}

impl FiberRefs {
    /// The slots a forked child starts with.
    pub(crate) fn fork(&self) -> Self {
        let slots = self
            .slots
            .iter()
            .map(|(id, slot)| {
                let forked = Slot {
                    value: (slot.fork)(&slot.value),
                    ..slot.clone()
                };
                (*id, forked)
            })
            .collect();
        Self { slots }
    }

    /// Merges a finished child's slots into these.
    pub(crate) fn join(&mut self, child: &Self) {
        for (id, child_slot) in &child.slots {
            match self.slots.get_mut(id) {
                Some(slot) => slot.value = (slot.join)(&slot.value, &child_slot.value),
                None => {
                    let value = (child_slot.join)(&child_slot.initial, &child_slot.value);
                    self.slots.insert(
                        *id,
                        Slot {
                            value,
                            ..child_slot.clone()
                        },
                    );
                }
            }
        }
    }

    fn get<A>(&self, fiber_ref: &FiberRef<A>) -> A
    where
        A: Clone + Send + Sync + 'static,
    {
        self.slots
            .get(&fiber_ref.id)
            .and_then(|slot| slot.value.downcast_ref::<A>())
            .map_or_else(|| (*fiber_ref.initial).clone(), Clone::clone)
    }

    fn set<A>(&mut self, fiber_ref: &FiberRef<A>, value: A)
    where
        A: Clone + Send + Sync + 'static,
    {
        let value: AnyValue = Arc::new(value);
        match self.slots.get_mut(&fiber_ref.id) {
            Some(slot) => slot.value = value,
            None => {
                self.slots.insert(fiber_ref.id, fiber_ref.slot(value));
            }
        }
    }
}

/// A handle to a fiber-local variable.
///
/// Cloning the handle does not create a new variable.
pub struct FiberRef<A> {
    id: u64,
    initial: Arc<A>,
    fork: Arc<dyn Fn(&A) -> A + Send + Sync>,
    join: Arc<dyn Fn(&A, &A) -> A + Send + Sync>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            initial: Arc::clone(&self.initial),
            fork: Arc::clone(&self.fork),
            join: Arc::clone(&self.join),
        }
    }
}

impl<A> std::fmt::Debug for FiberRef<A> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("FiberRef").field("id", &self.id).finish()
    }
}

impl<A> FiberRef<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates a ref whose children copy the parent's value and whose
    /// joins keep the child's value.
    pub fn make<R: 'static, E: Send + 'static>(initial: A) -> Effect<R, E, Self> {
        Self::make_with(initial, A::clone, |_, child| child.clone())
    }

    /// Creates a ref with custom fork and join functions.
    pub fn make_with<R, E, F, J>(initial: A, fork: F, join: J) -> Effect<R, E, Self>
    where
        R: 'static,
        E: Send + 'static,
        F: Fn(&A) -> A + Send + Sync + 'static,
        J: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        Effect::total(move || Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            initial: Arc::new(initial),
            fork: Arc::new(fork),
            join: Arc::new(join),
        })
    }

    fn slot(&self, value: AnyValue) -> Slot {
        let fork = Arc::clone(&self.fork);
        let join = Arc::clone(&self.join);
        Slot {
            value,
            initial: Arc::clone(&self.initial) as AnyValue,
            fork: Arc::new(move |value: &AnyValue| -> AnyValue {
                Arc::new(fork(downcast_slot::<A>(value)))
            }),
            join: Arc::new(move |parent: &AnyValue, child: &AnyValue| -> AnyValue {
                Arc::new(join(downcast_slot::<A>(parent), downcast_slot::<A>(child)))
            }),
        }
    }

    fn access<R, E, B, F>(&self, function: F) -> Effect<R, E, B>
    where
        R: 'static,
        E: Send + 'static,
        B: Send + 'static,
        F: FnOnce(&mut FiberRefs, &Self) -> B + Send + 'static,
    {
        let fiber_ref = self.clone();
        Effect::from_instruction(Instruction::FiberRefs(Box::new(move |refs| {
            erase(function(refs, &fiber_ref))
        })))
    }

    /// Reads the current fiber's value.
    pub fn get<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, A> {
        self.access(|refs, fiber_ref| refs.get(fiber_ref))
    }

    /// Replaces the current fiber's value.
    pub fn set<R: 'static, E: Send + 'static>(&self, value: A) -> Effect<R, E, ()> {
        self.access(move |refs, fiber_ref| refs.set(fiber_ref, value))
    }

    /// Computes a result and a new value from the current value.
    pub fn modify<R, E, B, F>(&self, function: F) -> Effect<R, E, B>
    where
        R: 'static,
        E: Send + 'static,
        B: Send + 'static,
        F: FnOnce(A) -> (B, A) + Send + 'static,
    {
        self.access(move |refs, fiber_ref| {
            let (result, next) = function(refs.get(fiber_ref));
            refs.set(fiber_ref, next);
            result
        })
    }

    /// Transforms the current value.
    pub fn update<R, E, F>(&self, function: F) -> Effect<R, E, ()>
    where
        R: 'static,
        E: Send + 'static,
        F: FnOnce(A) -> A + Send + 'static,
    {
        self.modify(move |current| ((), function(current)))
    }

    /// Replaces the value, returning the previous one.
    pub fn get_and_set<R: 'static, E: Send + 'static>(&self, value: A) -> Effect<R, E, A> {
        self.modify(move |current| (current, value))
    }

    /// Transforms the value, returning the previous one.
    pub fn get_and_update<R, E, F>(&self, function: F) -> Effect<R, E, A>
    where
        R: 'static,
        E: Send + 'static,
        F: FnOnce(A) -> A + Send + 'static,
    {
        self.modify(move |current| {
            let next = function(current.clone());
            (current, next)
        })
    }

    /// Restores the initial value.
    pub fn reset<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, ()> {
        let initial = (*self.initial).clone();
        self.set(initial)
    }

    /// Runs `effect` with the ref temporarily set to `value`.
    ///
    /// The previous value is restored afterwards, whatever the outcome.
    pub fn locally<R, E, B>(&self, value: A, effect: Effect<R, E, B>) -> Effect<R, E, B>
    where
        R: 'static,
        E: Send + 'static,
        B: Send + 'static,
    {
        let restore = self.clone();
        Effect::bracket(
            self.get_and_set(value),
            move |_| effect,
            move |previous| restore.set(previous),
        )
    }
}

fn downcast_slot<A: 'static>(value: &AnyValue) -> &A {
    value
        .downcast_ref::<A>()
        .expect("internal error: fiber ref slot holds a value of another type")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn counter() -> FiberRef<i32> {
        FiberRef {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            initial: Arc::new(0),
            fork: Arc::new(|value| value + 1),
            join: Arc::new(|parent, child| parent + child),
        }
    }

    #[rstest]
    fn missing_slot_reads_initial() {
        let refs = FiberRefs::default();
        assert_eq!(refs.get(&counter()), 0);
    }

    #[rstest]
    fn fork_applies_fork_function() {
        let fiber_ref = counter();
        let mut parent = FiberRefs::default();
        parent.set(&fiber_ref, 10);
        let child = parent.fork();
        assert_eq!(child.get(&fiber_ref), 11);
        assert_eq!(parent.get(&fiber_ref), 10);
    }

    #[rstest]
    fn join_merges_child_into_parent() {
        let fiber_ref = counter();
        let mut parent = FiberRefs::default();
        parent.set(&fiber_ref, 10);
        let mut child = parent.fork();
        child.set(&fiber_ref, 5);
        parent.join(&child);
        assert_eq!(parent.get(&fiber_ref), 15);
    }

    #[rstest]
    fn join_of_unknown_slot_starts_from_initial() {
        let fiber_ref = counter();
        let mut parent = FiberRefs::default();
        let mut child = FiberRefs::default();
        child.set(&fiber_ref, 7);
        parent.join(&child);
        assert_eq!(parent.get(&fiber_ref), 7);
    }
}
