//! Resource-scoped computations.
//!
//! A [`Managed`] describes how to acquire a resource and how to release it.
//! Acquiring registers a [`Finalizer`] in the [`ReleaseMap`] handed to it;
//! [`Managed::use_`] creates that map, runs the acquisition and the body,
//! and releases everything registered, newest first, however the body
//! ends.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: UIO<Vec<&'static str>> = Ref::make(Vec::new()).flat_map(|log| {
//!     let acquire = |name: &'static str, log: Ref<Vec<&'static str>>| {
//!         Managed::make(UIO::pure(name), move |name| {
//!             log.update(move |mut entries| {
//!                 entries.push(name);
//!                 entries
//!             })
//!         })
//!     };
//!     let resources = acquire("database", log.clone()).zip(acquire("cache", log.clone()));
//!     resources.use_(|_| UIO::unit()).then(log.get())
//! });
//! assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec!["cache", "database"]));
//! ```

mod layer;
mod release_map;

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

pub use layer::{Layer, MemoMap};
pub use release_map::{ExecutionStrategy, Finalizer, ReleaseKey, ReleaseMap};

use crate::effect::instruction::{Env, Instruction, erase};
use crate::effect::{Effect, UIO};
use crate::exit::{AnyExit, Exit};

type Acquisition<R, E, A> = Box<dyn FnOnce(ReleaseMap) -> Effect<R, E, (Finalizer, A)> + Send>;

/// An acquisition paired with a release that runs exactly once.
#[must_use = "managed resources do nothing unless used"]
pub struct Managed<R, E, A> {
    run: Acquisition<R, E, A>,
}

impl<R, E, A> fmt::Debug for Managed<R, E, A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Managed(<acquisition>)")
    }
}

/// The environment of the running fiber.
fn captured_environment<R: 'static, E: Send + 'static>() -> Effect<R, E, Env> {
    Effect::from_instruction(Instruction::Read(Box::new(|environment| {
        Instruction::Succeed(erase(Arc::clone(environment)))
    })))
}

/// Runs `effect` in a previously captured environment.
fn within<R, X>(effect: Effect<R, Infallible, X>, environment: Env) -> UIO<()>
where
    R: 'static,
    X: Send + 'static,
{
    Effect::from_instruction(Instruction::Provide {
        environment,
        effect: Box::new(effect.unit_value().into_instruction()),
    })
}

impl<R, E, A> Managed<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Builds a managed value from its raw acquisition.
    ///
    /// The acquisition must register everything it acquires in the given
    /// map and return a finalizer releasing exactly that.
    pub fn new<F>(run: F) -> Self
    where
        F: FnOnce(ReleaseMap) -> Effect<R, E, (Finalizer, A)> + Send + 'static,
    {
        Self { run: Box::new(run) }
    }

    /// Runs the acquisition against `release_map`.
    pub fn acquire_in(self, release_map: ReleaseMap) -> Effect<R, E, (Finalizer, A)> {
        (self.run)(release_map)
    }

    /// Acquires with `acquire` and releases with `release`, which sees how
    /// the scope ended.
    ///
    /// `acquire` keeps the caller's interruptibility. Registering the
    /// finalizer is uninterruptible, so a successful acquisition is always
    /// released. `release` runs in the environment `acquire` ran in.
    pub fn make_exit<X, F>(acquire: Effect<R, E, A>, release: F) -> Self
    where
        A: Clone,
        X: Send + 'static,
        F: FnOnce(A, &AnyExit) -> Effect<R, Infallible, X> + Send + 'static,
    {
        Self::new(move |release_map| {
            Effect::uninterruptible_mask(move |restore| {
                restore.apply(acquire).flat_map(move |resource| {
                    captured_environment::<R, E>().flat_map(move |environment| {
                        let released = resource.clone();
                        let finalizer = Finalizer::new(move |exit| {
                            within(release(released, &exit), environment)
                        });
                        release_map
                            .add(finalizer)
                            .fmap(move |finalizer| (finalizer, resource))
                    })
                })
            })
        })
    }

    /// Acquires with `acquire` and releases with `release`.
    pub fn make<X, F>(acquire: Effect<R, E, A>, release: F) -> Self
    where
        A: Clone,
        X: Send + 'static,
        F: FnOnce(A) -> Effect<R, Infallible, X> + Send + 'static,
    {
        Self::make_exit(acquire, move |resource, _| release(resource))
    }

    /// A managed value with nothing to release.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self {
        Self::new(move |_| effect.fmap(|value| (Finalizer::noop(), value)))
    }

    /// Succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_effect(Effect::pure(value))
    }

    /// Fails with `error`.
    pub fn fail(error: E) -> Self {
        Self::from_effect(Effect::fail(error))
    }

    /// Transforms the resource.
    pub fn fmap<B, F>(self, function: F) -> Managed<R, E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Managed::new(move |release_map| {
            self.acquire_in(release_map)
                .fmap(move |(finalizer, value)| (finalizer, function(value)))
        })
    }

    /// Transforms the typed failure of the acquisition.
    pub fn map_err<E2, F>(self, function: F) -> Managed<R, E2, A>
    where
        E2: Send + 'static,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        Managed::new(move |release_map| self.acquire_in(release_map).map_err(function))
    }

    /// Acquires this resource, then the one `function` builds from it.
    ///
    /// Releasing the result releases the second resource before the first.
    /// Both releases always run; their failures are combined in order.
    pub fn flat_map<B, F>(self, function: F) -> Managed<R, E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Managed<R, E, B> + Send + 'static,
    {
        Managed::new(move |release_map| {
            let inner_map = release_map.clone();
            self.acquire_in(release_map)
                .flat_map(move |(first, value)| {
                    function(value)
                        .acquire_in(inner_map)
                        .fmap(move |(second, next)| (second.and_then(first), next))
                })
        })
    }

    /// Acquires both resources in order.
    pub fn zip<B: Send + 'static>(self, that: Managed<R, E, B>) -> Managed<R, E, (A, B)> {
        self.flat_map(move |left| that.fmap(move |right| (left, right)))
    }

    /// Acquires both resources concurrently.
    ///
    /// Each side registers into its own map; the combined finalizer
    /// releases both maps concurrently. If one side fails, the other is
    /// interrupted and whatever it acquired is still released.
    pub fn zip_par<B: Send + 'static>(self, that: Managed<R, E, B>) -> Managed<R, E, (A, B)> {
        Managed::new(move |release_map| {
            let left_map = ReleaseMap::new();
            let right_map = ReleaseMap::new();
            let (left, right) = (left_map.clone(), right_map.clone());
            let release_both = Finalizer::new(move |exit| {
                let releases = vec![
                    left.release_all::<(), Infallible>(exit.clone(), ExecutionStrategy::Sequential)
                        .exit(),
                    right
                        .release_all::<(), Infallible>(exit, ExecutionStrategy::Sequential)
                        .exit(),
                ];
                UIO::collect_all_par(releases)
                    .flat_map(|exits| release_map::fail_with(release_map::combine_parallel(exits)))
            });
            release_map.add::<R, E>(release_both).flat_map(move |finalizer| {
                self.acquire_in(left_map)
                    .zip_par(that.acquire_in(right_map))
                    .fmap(move |((_, left), (_, right))| (finalizer, (left, right)))
            })
        })
    }

    /// Runs `finalizer` after this resource is released.
    pub fn ensuring<X: Send + 'static>(self, finalizer: Effect<R, Infallible, X>) -> Self {
        Managed::<R, E, ()>::finalizer(finalizer).flat_map(move |()| self)
    }

    /// Supplies the environment, including to the release actions.
    pub fn provide<R0: 'static>(self, environment: R) -> Managed<R0, E, A>
    where
        R: Send + Sync,
    {
        Managed::new(move |release_map| self.acquire_in(release_map).provide(environment))
    }

    /// Acquires the resource, runs `body` with it, and releases everything
    /// acquired, whether `body` succeeds, fails or is interrupted.
    ///
    /// A failing release is combined with the outcome of `body` through
    /// [`Cause::then`](crate::cause::Cause::then).
    pub fn use_<B, F>(self, body: F) -> Effect<R, E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<R, E, B> + Send + 'static,
    {
        Effect::bracket_exit(
            ReleaseMap::make(),
            move |release_map| self.acquire_in(release_map).flat_map(move |(_, value)| body(value)),
            |release_map, exit: &Exit<E, B>| {
                release_map.release_all::<R, Infallible>(exit.to_any(), ExecutionStrategy::Sequential)
            },
        )
    }

    /// Acquires the resource, releases it, and returns it.
    pub fn use_now(self) -> Effect<R, E, A> {
        self.use_(Effect::pure)
    }

    /// Acquires every resource built by `function`, in order.
    ///
    /// Releasing the result releases them in reverse order.
    pub fn foreach<T, I, F>(items: I, function: F) -> Managed<R, E, Vec<A>>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Self,
    {
        items
            .into_iter()
            .map(function)
            .fold(Managed::succeed(Vec::new()), |collected, managed| {
                collected.flat_map(move |mut values| {
                    managed.fmap(move |value| {
                        values.push(value);
                        values
                    })
                })
            })
    }

    /// Acquires every resource, in order.
    pub fn collect_all(managed: Vec<Self>) -> Managed<R, E, Vec<A>> {
        Self::foreach(managed, |managed| managed)
    }
}

impl<R, E> Managed<R, E, ()>
where
    R: 'static,
    E: Send + 'static,
{
    /// A resource whose only purpose is to run `finalizer` on release.
    pub fn finalizer<X: Send + 'static>(finalizer: Effect<R, Infallible, X>) -> Self {
        Self::make(Effect::unit(), move |()| finalizer)
    }

    /// Like [`Managed::finalizer`], with access to how the scope ended.
    pub fn finalizer_exit<X, F>(finalizer: F) -> Self
    where
        X: Send + 'static,
        F: FnOnce(&AnyExit) -> Effect<R, Infallible, X> + Send + 'static,
    {
        Self::make_exit(Effect::unit(), move |(), exit| finalizer(exit))
    }
}

static_assertions::assert_impl_all!(Managed<(), String, i32>: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Cause;
    use crate::runtime::Runtime;
    use crate::sync::Ref;
    use rstest::rstest;

    fn recorded(log: &Ref<Vec<i32>>, id: i32) -> Managed<(), String, i32> {
        let log = log.clone();
        Managed::make(Effect::pure(id), move |id| {
            log.update(move |mut entries| {
                entries.push(id);
                entries
            })
        })
    }

    #[rstest]
    fn release_failure_is_sequenced_after_the_body_failure() {
        let runtime = Runtime::new().expect("runtime");
        let managed: Managed<(), String, ()> =
            Managed::finalizer(UIO::<()>::die_message("release failed"));
        let program = managed.use_(|()| Effect::<(), String, ()>::fail("body".to_string()));
        let Exit::Failure(cause) = runtime.run_blocking_exit(program) else {
            panic!("expected failure");
        };
        assert!(matches!(cause, Cause::Then(ref first, ref second)
            if **first == Cause::fail("body".to_string()) && second.is_die()));
    }

    #[rstest]
    fn ensuring_runs_after_the_resource_is_released() {
        let runtime = Runtime::new().expect("runtime");
        let program: UIO<Vec<i32>> = Ref::make(Vec::new()).flat_map(|log| {
            let after = log.clone();
            let managed = recorded(&log, 1).ensuring(after.update(|mut entries| {
                entries.push(99);
                entries
            }));
            managed
                .use_now()
                .catch_all(|_| Effect::pure(0))
                .then(log.get())
        });
        assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec![1, 99]));
    }

    #[rstest]
    fn a_failed_acquisition_releases_what_was_acquired_before() {
        let runtime = Runtime::new().expect("runtime");
        let program: UIO<Vec<i32>> = Ref::make(Vec::new()).flat_map(|log| {
            let managed = recorded(&log, 1).zip(Managed::<(), String, i32>::fail("boom".to_string()));
            managed
                .use_(|_| Effect::unit())
                .catch_all(|_| Effect::unit())
                .then(log.get())
        });
        assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec![1]));
    }

    #[rstest]
    fn release_actions_see_the_acquisition_environment() {
        let runtime = Runtime::new().expect("runtime");
        let program: UIO<Vec<i32>> = Ref::make(Vec::new()).flat_map(|log| {
            let sink = log.clone();
            let managed: Managed<i32, String, i32> = Managed::make(Effect::access(|base: &i32| *base), move |_| {
                Effect::access_effect(move |base: &i32| {
                    let base = *base;
                    sink.update(move |mut entries| {
                        entries.push(base * 2);
                        entries
                    })
                })
            });
            managed
                .provide::<()>(21)
                .use_now()
                .catch_all(|_| Effect::pure(0))
                .then(log.get())
        });
        assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec![42]));
    }

    #[rstest]
    fn zip_par_releases_both_sides() {
        let runtime = Runtime::new().expect("runtime");
        let program: UIO<Vec<i32>> = Ref::make(Vec::new()).flat_map(|log| {
            recorded(&log, 1)
                .zip_par(recorded(&log, 2))
                .use_(|(left, right)| Effect::pure(left + right))
                .catch_all(|_| Effect::pure(0))
                .then(log.get())
        });
        let Exit::Success(mut released) = runtime.run_blocking_exit(program) else {
            panic!("expected success");
        };
        released.sort_unstable();
        assert_eq!(released, vec![1, 2]);
    }
}
