//! Composable, memoized recipes for building environments.
//!
//! A [`Layer<RIn, E, ROut>`] builds an `ROut` out of an `RIn` as a
//! [`Managed`] resource. Layers compose vertically with
//! [`Layer::and_then`] and horizontally with [`Layer::and`]. Building a
//! graph threads one [`MemoMap`] through every layer so that a layer
//! reachable along several paths is built once and released once.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{ExecutionStrategy, Finalizer, Managed, ReleaseMap};
use crate::effect::Effect;
use crate::sync::Promise;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(0);

type Build<RIn, E, ROut> = dyn Fn(MemoMap) -> Managed<RIn, E, ROut> + Send + Sync;

/// A recipe for building an `ROut` from an `RIn`.
pub struct Layer<RIn, E, ROut> {
    id: u64,
    build: Arc<Build<RIn, E, ROut>>,
}

impl<RIn, E, ROut> Clone for Layer<RIn, E, ROut> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            build: Arc::clone(&self.build),
        }
    }
}

impl<RIn, E, ROut> fmt::Debug for Layer<RIn, E, ROut> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("Layer").field("id", &self.id).finish()
    }
}

impl<RIn, E, ROut> Layer<RIn, E, ROut>
where
    RIn: 'static,
    E: Clone + Send + 'static,
    ROut: Clone + Send + Sync + 'static,
{
    fn from_build<F>(build: F) -> Self
    where
        F: Fn(MemoMap) -> Managed<RIn, E, ROut> + Send + Sync + 'static,
    {
        Self {
            id: NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed),
            build: Arc::new(build),
        }
    }

    /// A layer whose output is the resource `factory` manages.
    pub fn from_managed<F>(factory: F) -> Self
    where
        F: Fn() -> Managed<RIn, E, ROut> + Send + Sync + 'static,
    {
        Self::from_build(move |_| factory())
    }

    /// A layer whose output is computed by the effect `factory` builds.
    pub fn from_effect<F>(factory: F) -> Self
    where
        F: Fn() -> Effect<RIn, E, ROut> + Send + Sync + 'static,
    {
        Self::from_managed(move || Managed::from_effect(factory()))
    }

    /// A layer computing its output from its input.
    pub fn from_fn<F>(function: F) -> Self
    where
        RIn: Send + Sync,
        F: Fn(&RIn) -> ROut + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        Self::from_effect(move || {
            let function = Arc::clone(&function);
            Effect::access(move |input| function(input))
        })
    }

    /// A layer that always outputs `value`.
    pub fn succeed(value: ROut) -> Self {
        Self::from_effect(move || Effect::pure(value.clone()))
    }

    /// Transforms the output.
    #[must_use]
    pub fn fmap<ROut2, F>(self, function: F) -> Layer<RIn, E, ROut2>
    where
        ROut2: Clone + Send + Sync + 'static,
        F: Fn(ROut) -> ROut2 + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        Layer::from_build(move |memo_map| {
            let function = Arc::clone(&function);
            self.build(&memo_map).fmap(move |output| function(output))
        })
    }

    /// Feeds the output of this layer into `that`.
    #[must_use]
    pub fn and_then<ROut2>(self, that: Layer<ROut, E, ROut2>) -> Layer<RIn, E, ROut2>
    where
        ROut2: Clone + Send + Sync + 'static,
    {
        Layer::from_build(move |memo_map| {
            let that = that.clone();
            let inner = memo_map.clone();
            self.build(&memo_map)
                .flat_map(move |output| that.build(&inner).provide(output))
        })
    }

    /// Builds both layers concurrently from the same input.
    #[must_use]
    pub fn and<ROut2>(self, that: Layer<RIn, E, ROut2>) -> Layer<RIn, E, (ROut, ROut2)>
    where
        ROut2: Clone + Send + Sync + 'static,
    {
        Layer::from_build(move |memo_map| self.build(&memo_map).zip_par(that.build(&memo_map)))
    }

    /// The resource this layer describes, memoized in `memo_map`.
    pub fn build(&self, memo_map: &MemoMap) -> Managed<RIn, E, ROut> {
        let layer = self.clone();
        let memo_map = memo_map.clone();
        Managed::new(move |release_map| memo_map.get_or_build(layer, release_map))
    }

    /// Builds this layer with a memo map of its own.
    pub fn build_fresh(&self) -> Managed<RIn, E, ROut> {
        self.build(&MemoMap::new())
    }
}

// =============================================================================
// MemoMap
// =============================================================================

enum Claim<E, A> {
    Owner(Promise<E, A>),
    Waiter(Promise<E, A>),
}

/// The layers built so far in one build of a layer graph.
#[derive(Clone, Default)]
pub struct MemoMap {
    entries: Arc<Mutex<FxHashMap<u64, Box<dyn Any + Send + Sync>>>>,
}

impl fmt::Debug for MemoMap {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MemoMap")
            .field("layers", &self.entries.lock().len())
            .finish()
    }
}

impl MemoMap {
    /// Creates an empty memo map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of layers built or being built.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no layer was built yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn claim<E, A>(&self, id: u64) -> Claim<E, A>
    where
        E: Clone + Send + 'static,
        A: Clone + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if let Some(promise) = entries
            .get(&id)
            .and_then(|entry| entry.downcast_ref::<Promise<E, A>>())
        {
            return Claim::Waiter(promise.clone());
        }
        let promise = Promise::new();
        entries.insert(id, Box::new(promise.clone()));
        Claim::Owner(promise)
    }

    /// The first caller for a layer builds it into a release map of its
    /// own, registered once in the caller's `release_map`; later callers
    /// wait for that build.
    fn get_or_build<RIn, E, ROut>(
        &self,
        layer: Layer<RIn, E, ROut>,
        release_map: ReleaseMap,
    ) -> Effect<RIn, E, (Finalizer, ROut)>
    where
        RIn: 'static,
        E: Clone + Send + 'static,
        ROut: Clone + Send + Sync + 'static,
    {
        let memo_map = self.clone();
        Effect::suspend(move || match memo_map.claim::<E, ROut>(layer.id) {
            Claim::Waiter(promise) => promise
                .await_::<RIn>()
                .fmap(|output| (Finalizer::noop(), output)),
            Claim::Owner(promise) => {
                tracing::trace!(layer = layer.id, "building layer");
                let scoped = ReleaseMap::new();
                let owned = scoped.clone();
                let release_once =
                    Finalizer::new(move |exit| owned.release_all(exit, ExecutionStrategy::Sequential));
                release_map
                    .add::<RIn, E>(release_once)
                    .flat_map(move |finalizer| {
                        (layer.build)(memo_map)
                            .acquire_in(scoped)
                            .fmap(|(_, output)| output)
                            .to::<E>(&promise)
                            .then(promise.await_::<RIn>())
                            .fmap(move |output| (finalizer, output))
                    })
            }
        })
    }
}

impl<R, E, A> Effect<R, E, A>
where
    R: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
    A: Send + 'static,
{
    /// Builds `layer`, runs this effect with its output, and releases the
    /// layer afterwards.
    pub fn provide_layer<RIn: 'static>(self, layer: Layer<RIn, E, R>) -> Effect<RIn, E, A> {
        layer.build_fresh().use_(move |environment| self.provide(environment))
    }
}

static_assertions::assert_impl_all!(Layer<(), String, i32>: Send, Sync, Clone);
static_assertions::assert_impl_all!(MemoMap: Send, Sync, Clone);
