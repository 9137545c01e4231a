//! The registry of finalizers behind a [`Managed`](super::Managed) scope.
//!
//! A [`ReleaseMap`] is either running, collecting finalizers under
//! increasing keys, or exited. [`ReleaseMap::release_all`] moves it to the
//! exited state and runs every finalizer still registered, newest first;
//! a finalizer added after that runs immediately.
//!
//! Finalizer failures never stop the remaining finalizers. They are
//! combined with [`Cause::then`] when finalizers run one after another and
//! with [`Cause::both`] when they run in parallel.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{Effect, UIO};
use crate::exit::{AnyExit, Exit};

// =============================================================================
// Finalizer
// =============================================================================

/// A release action that observes how its scope ended.
pub struct Finalizer(Box<dyn FnOnce(AnyExit) -> UIO<()> + Send>);

impl Finalizer {
    /// Wraps a release action.
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce(AnyExit) -> UIO<()> + Send + 'static,
    {
        Self(Box::new(release))
    }

    /// A finalizer that does nothing.
    pub fn noop() -> Self {
        Self::new(|_| UIO::unit())
    }

    /// The release effect for `exit`.
    ///
    /// A panic while building the effect surfaces as a defect of the
    /// returned effect.
    pub fn apply(self, exit: AnyExit) -> UIO<()> {
        let release = self.0;
        UIO::suspend(move || release(exit))
    }

    /// Runs `self`, then `next`, even if `self` fails. Failures are
    /// combined with [`Cause::then`].
    #[must_use]
    pub fn and_then(self, next: Self) -> Self {
        Self::new(move |exit| {
            let second_exit = exit.clone();
            self.apply(exit).exit::<Infallible>().flat_map(move |first| {
                next.apply(second_exit)
                    .exit::<Infallible>()
                    .flat_map(move |second| fail_with(Cause::then(failure_of(first), failure_of(second))))
            })
        })
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Finalizer(<release>)")
    }
}

fn failure_of(exit: Exit<Infallible, ()>) -> Cause<Infallible> {
    match exit {
        Exit::Success(()) => Cause::Empty,
        Exit::Failure(cause) => cause,
    }
}

pub(super) fn fail_with(cause: Cause<Infallible>) -> UIO<()> {
    if cause.is_empty() {
        UIO::unit()
    } else {
        UIO::fail_cause(cause)
    }
}

// =============================================================================
// ExecutionStrategy
// =============================================================================

/// How [`ReleaseMap::release_all`] runs the finalizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// One after another, newest first.
    #[default]
    Sequential,
    /// All at once.
    Parallel,
    /// At most `n` at a time.
    ParallelN(usize),
}

// =============================================================================
// ReleaseMap
// =============================================================================

/// Identifies a finalizer registered in a [`ReleaseMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseKey(u64);

enum State {
    Running {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Exited {
        exit: AnyExit,
    },
}

enum Registration {
    Added(ReleaseKey),
    Exited(Finalizer, AnyExit),
}

/// A shared registry of finalizers.
#[derive(Clone)]
pub struct ReleaseMap {
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for ReleaseMap {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.lock() {
            State::Running { finalizers, .. } => formatter
                .debug_struct("ReleaseMap")
                .field("finalizers", &finalizers.len())
                .finish(),
            State::Exited { exit } => formatter
                .debug_struct("ReleaseMap")
                .field("exited", exit)
                .finish(),
        }
    }
}

impl Default for ReleaseMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseMap {
    /// Creates a running map outside of any fiber.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Running {
                next_key: 0,
                finalizers: BTreeMap::new(),
            })),
        }
    }

    /// Creates a running map.
    pub fn make<R: 'static, E: Send + 'static>() -> Effect<R, E, Self> {
        Effect::total(Self::new)
    }

    /// Whether the map was released.
    pub fn is_exited(&self) -> bool {
        matches!(&*self.state.lock(), State::Exited { .. })
    }

    /// Number of finalizers waiting to run.
    pub fn len(&self) -> usize {
        match &*self.state.lock() {
            State::Running { finalizers, .. } => finalizers.len(),
            State::Exited { .. } => 0,
        }
    }

    /// Whether no finalizer is waiting to run.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, finalizer: Finalizer) -> Registration {
        match &mut *self.state.lock() {
            State::Running {
                next_key,
                finalizers,
            } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.insert(key, finalizer);
                Registration::Added(ReleaseKey(key))
            }
            State::Exited { exit } => Registration::Exited(finalizer, exit.clone()),
        }
    }

    fn take(&self, key: ReleaseKey) -> Option<Finalizer> {
        match &mut *self.state.lock() {
            State::Running { finalizers, .. } => finalizers.remove(&key.0),
            State::Exited { .. } => None,
        }
    }

    /// Registers `finalizer`, or runs it at once if the map was released.
    ///
    /// Succeeds with a finalizer that releases just this entry.
    pub fn add<R: 'static, E: Send + 'static>(&self, finalizer: Finalizer) -> Effect<R, E, Finalizer> {
        let map = self.clone();
        Effect::suspend(move || match map.register(finalizer) {
            Registration::Added(key) => {
                let owner = map.clone();
                Effect::pure(Finalizer::new(move |exit| owner.release(key, exit)))
            }
            Registration::Exited(finalizer, exit) => {
                finalizer.apply(exit).widen().as_(Finalizer::noop())
            }
        })
    }

    /// Registers `finalizer` and returns its key, or runs it at once and
    /// returns `None` if the map was released.
    pub fn add_if_open<R: 'static, E: Send + 'static>(
        &self,
        finalizer: Finalizer,
    ) -> Effect<R, E, Option<ReleaseKey>> {
        let map = self.clone();
        Effect::suspend(move || match map.register(finalizer) {
            Registration::Added(key) => Effect::pure(Some(key)),
            Registration::Exited(finalizer, exit) => finalizer.apply(exit).widen().as_(None),
        })
    }

    /// Runs and removes the finalizer under `key`, if it is still there.
    pub fn release<R: 'static, E: Send + 'static>(&self, key: ReleaseKey, exit: AnyExit) -> Effect<R, E, ()> {
        let map = self.clone();
        Effect::suspend(move || match map.take(key) {
            Some(finalizer) => finalizer.apply(exit).widen(),
            None => Effect::unit(),
        })
    }

    /// Removes the finalizer under `key` without running it.
    pub fn remove<R: 'static, E: Send + 'static>(&self, key: ReleaseKey) -> Effect<R, E, Option<Finalizer>> {
        let map = self.clone();
        Effect::total(move || map.take(key))
    }

    /// Replaces the finalizer under `key`, returning the previous one.
    ///
    /// If the map was released, `finalizer` runs at once.
    pub fn replace<R: 'static, E: Send + 'static>(
        &self,
        key: ReleaseKey,
        finalizer: Finalizer,
    ) -> Effect<R, E, Option<Finalizer>> {
        let map = self.clone();
        Effect::suspend(move || {
            let exited = match &mut *map.state.lock() {
                State::Running { finalizers, .. } => {
                    return Effect::pure(finalizers.insert(key.0, finalizer));
                }
                State::Exited { exit } => exit.clone(),
            };
            finalizer.apply(exited).widen().as_(None)
        })
    }

    /// Moves the map to the exited state and runs every registered
    /// finalizer with `exit`.
    ///
    /// Runs uninterruptibly. Fails with the combined cause of the failed
    /// finalizers. Releasing an exited map does nothing.
    pub fn release_all<R: 'static, E: Send + 'static>(
        &self,
        exit: AnyExit,
        strategy: ExecutionStrategy,
    ) -> Effect<R, E, ()> {
        let map = self.clone();
        Effect::suspend(move || {
            let finalizers = {
                let mut state = map.state.lock();
                match std::mem::replace(&mut *state, State::Exited { exit: exit.clone() }) {
                    State::Running { finalizers, .. } => finalizers,
                    exited @ State::Exited { .. } => {
                        *state = exited;
                        return Effect::unit();
                    }
                }
            };
            let count = finalizers.len();
            let ordered: Vec<Finalizer> = finalizers.into_values().rev().collect();
            run_all(ordered, exit, strategy)
                .widen()
                .flat_map(move |cause: Cause<Infallible>| {
                    if cause.is_empty() {
                        Effect::unit()
                    } else {
                        tracing::warn!(
                            finalizers = count,
                            strategy = ?strategy,
                            "release map finalizers failed"
                        );
                        Effect::fail_cause(cause.widen())
                    }
                })
        })
        .uninterruptible()
    }
}

fn run_all(
    finalizers: Vec<Finalizer>,
    exit: AnyExit,
    strategy: ExecutionStrategy,
) -> UIO<Cause<Infallible>> {
    let outcomes = |finalizers: Vec<Finalizer>| -> Vec<UIO<Exit<Infallible, ()>>> {
        finalizers
            .into_iter()
            .map(|finalizer| finalizer.apply(exit.clone()).exit())
            .collect()
    };
    match strategy {
        ExecutionStrategy::Sequential => UIO::collect_all(outcomes(finalizers)).fmap(|exits| {
            exits
                .into_iter()
                .fold(Cause::Empty, |cause, exit| Cause::then(cause, failure_of(exit)))
        }),
        ExecutionStrategy::Parallel => UIO::collect_all_par(outcomes(finalizers)).fmap(combine_parallel),
        ExecutionStrategy::ParallelN(parallelism) => {
            let exit = exit.clone();
            UIO::foreach_par_n(parallelism, finalizers, move |finalizer| {
                finalizer.apply(exit.clone()).exit()
            })
            .fmap(combine_parallel)
        }
    }
}

pub(super) fn combine_parallel(exits: Vec<Exit<Infallible, ()>>) -> Cause<Infallible> {
    exits
        .into_iter()
        .fold(Cause::Empty, |cause, exit| Cause::both(cause, failure_of(exit)))
}

static_assertions::assert_impl_all!(ReleaseMap: Send, Sync, Clone);
static_assertions::assert_impl_all!(Finalizer: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn keys_increase_and_removal_shrinks_the_map() {
        let map = ReleaseMap::new();
        let Registration::Added(first) = map.register(Finalizer::noop()) else {
            panic!("map is running");
        };
        let Registration::Added(second) = map.register(Finalizer::noop()) else {
            panic!("map is running");
        };
        assert!(first < second);
        assert_eq!(map.len(), 2);
        assert!(map.take(first).is_some());
        assert!(map.take(first).is_none());
        assert_eq!(map.len(), 1);
    }

    #[rstest]
    fn an_exited_map_hands_finalizers_back() {
        let map = ReleaseMap::new();
        *map.state.lock() = State::Exited {
            exit: Exit::succeed(()),
        };
        assert!(map.is_exited());
        assert!(matches!(
            map.register(Finalizer::noop()),
            Registration::Exited(_, Exit::Success(()))
        ));
    }
}
