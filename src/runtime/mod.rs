//! The host event loop and the runners that turn effects into fibers.
//!
//! A [`Runtime`] owns (or attaches to) a tokio runtime. Each slice of fiber
//! evaluation runs as one tokio task; a fiber that yields or resumes from an
//! asynchronous boundary is simply spawned again. With the default
//! configuration the host has a single worker thread, so fibers are
//! scheduled cooperatively.
//!
//! # Runners
//!
//! | Runner | Returns |
//! |--------|---------|
//! | [`Runtime::run`] | a [`CancelHandle`]; the callback receives the exit |
//! | [`Runtime::run_future_exit`] | a future of the [`Exit`]; never rejects |
//! | [`Runtime::run_future`] | a future of `Result<A, FiberFailure<E>>` |
//! | [`Runtime::run_blocking_exit`] | the [`Exit`], blocking the caller |
//! | [`Runtime::try_run_blocking_exit`] | the [`Exit`], or a [`BlockingError`] |
//!
//! # Runtime Flavor Considerations
//!
//! Blocking runners use `block_in_place` inside a multi-thread tokio
//! runtime and refuse to block inside a current-thread runtime, where the
//! caller would starve the very loop the fiber needs. Use
//! [`Runtime::run_future_exit`] there instead.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: IO<String, i32> = IO::pure(41).fmap(|value| value + 1);
//! assert_eq!(runtime.run_blocking(program).unwrap(), 42);
//! ```

mod config;
mod error;

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use pin_project_lite::pin_project;
use tokio::runtime::{Builder, Handle, RuntimeFlavor};
use tokio::task::JoinHandle;

pub use config::{REPORT_FAILURES_ENV, RuntimeConfig, WORKERS_ENV, YIELD_OPS_ENV};
pub use error::{BlockingError, FiberFailure, RuntimeError};

use crate::cause::Defect;
use crate::effect::IO;
use crate::effect::instruction::{Instruction, unerase_exit, unit_environment};
use crate::exit::Exit;
use crate::fiber::context::FiberContext;
use crate::fiber::{Fiber, FiberId, FiberRefs, Scope};

// =============================================================================
// Runtime
// =============================================================================

/// Executes effects as fibers on a tokio host.
///
/// Cloning is cheap; clones share the host. An owned host is shut down in
/// the background once the last clone, including those held by running
/// fibers, is dropped.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    handle: Handle,
    owned: Option<tokio::runtime::Runtime>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Some(host) = self.owned.take() {
            host.shutdown_background();
        }
    }
}

/// Lazily built runtime shared by the whole process.
static DEFAULT_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Runtime::with_config(RuntimeConfig::from_env()).expect("Failed to create default fiber runtime")
});

/// Returns the process-wide runtime, configured from the environment.
///
/// # Panics
///
/// Panics if the host runtime cannot be created on first use.
#[must_use]
pub fn default_runtime() -> &'static Runtime {
    &DEFAULT_RUNTIME
}

impl Runtime {
    /// Creates a runtime with the default configuration and its own host.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Build`] if the host cannot be started.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates a runtime with its own host, configured by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for an unusable configuration
    /// and [`RuntimeError::Build`] if the host cannot be started.
    pub fn with_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let host = Builder::new_multi_thread()
            .worker_threads(config.worker_threads())
            .thread_name(config.thread_name())
            .enable_all()
            .build()?;
        tracing::debug!(
            workers = config.worker_threads(),
            yield_ops = config.yield_op_count(),
            "fiber runtime started"
        );
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                handle: host.handle().clone(),
                owned: Some(host),
                config,
            }),
        })
    }

    /// Attaches to an existing tokio runtime.
    ///
    /// The runtime is not shut down when the returned value is dropped.
    #[must_use]
    pub fn from_handle(handle: Handle) -> Self {
        Self::from_handle_with_config(handle, RuntimeConfig::default())
    }

    /// Attaches to an existing tokio runtime with a custom configuration.
    ///
    /// Only the fiber-level settings of `config` apply; the host threads
    /// are whatever the existing runtime has.
    #[must_use]
    pub fn from_handle_with_config(handle: Handle, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                handle,
                owned: None,
            }),
        }
    }

    /// Attaches to the tokio runtime running on this thread.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoCurrentRuntime`] outside a tokio runtime.
    pub fn current() -> Result<Self, RuntimeError> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|_| RuntimeError::NoCurrentRuntime)
    }

    /// The runtime's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The host handle.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub(crate) fn schedule(&self, fiber: Arc<FiberContext>, instruction: Instruction) {
        self.inner
            .handle
            .spawn(async move { fiber.evaluate_now(instruction) });
    }

    pub(crate) fn spawn_host<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    fn root_fiber<E, A>(&self, effect: IO<E, A>) -> (Arc<FiberContext>, Instruction)
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let fiber = FiberContext::new(
            self.clone(),
            unit_environment(),
            FiberRefs::default(),
            true,
        );
        tracing::trace!(fiber = %fiber.id(), "root fiber created");
        (fiber, effect.into_instruction())
    }

    // =========================================================================
    // Runners
    // =========================================================================

    /// Runs `effect` in a new root fiber and hands its exit to `callback`.
    ///
    /// A panic inside the callback is logged and otherwise ignored.
    pub fn run<E, A, F>(&self, effect: IO<E, A>, callback: F) -> CancelHandle
    where
        E: Send + 'static,
        A: Send + 'static,
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        let (fiber, instruction) = self.root_fiber(effect);
        let finished = Arc::clone(&fiber);
        let report_failures = self.config().report_failures();
        fiber.on_done(Box::new(move || {
            let exit = unerase_exit::<E, A>(finished.take_exit());
            if report_failures && let Exit::Failure(cause) = &exit {
                tracing::warn!(
                    fiber = %finished.id(),
                    interrupted = cause.is_interrupted(),
                    defects = cause.defects().len(),
                    "root fiber failed"
                );
            }
            if panic::catch_unwind(AssertUnwindSafe(|| callback(exit))).is_err() {
                tracing::error!(fiber = %finished.id(), "exit callback panicked");
            }
        }));
        fiber.start(instruction);
        CancelHandle { fiber }
    }

    /// Runs `effect` in a new root fiber and returns a future of its exit.
    ///
    /// The future never rejects. If the host shuts down before the fiber
    /// finishes, it resolves to a defect.
    pub fn run_future_exit<E, A>(&self, effect: IO<E, A>) -> ExitFuture<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let handle = self.run(effect, move |exit| {
            let _ = sender.send(exit);
        });
        ExitFuture { receiver, handle }
    }

    /// Runs `effect` and returns a future of its value, rejecting with a
    /// [`FiberFailure`] that carries the rendered cause.
    pub fn run_future<E, A>(
        &self,
        effect: IO<E, A>,
    ) -> impl Future<Output = Result<A, FiberFailure<E>>> + Send + 'static
    where
        E: fmt::Debug + Send + 'static,
        A: Send + 'static,
    {
        let exit = self.run_future_exit(effect);
        async move { exit.await.into_result().map_err(FiberFailure::new) }
    }

    /// Runs `effect` and blocks the caller until its exit is available.
    ///
    /// # Errors
    ///
    /// Returns [`BlockingError::CurrentThreadRuntime`] when called inside a
    /// current-thread tokio runtime.
    pub fn try_run_blocking_exit<E, A>(&self, effect: IO<E, A>) -> Result<Exit<E, A>, BlockingError>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => {
                let exit = self.run_future_exit(effect);
                Ok(tokio::task::block_in_place(|| futures::executor::block_on(exit)))
            }
            Ok(RuntimeFlavor::CurrentThread) => Err(BlockingError::CurrentThreadRuntime),
            Ok(_) => Err(BlockingError::UnsupportedRuntimeFlavor),
            Err(_) => Ok(futures::executor::block_on(self.run_future_exit(effect))),
        }
    }

    /// Runs `effect` and blocks the caller until its exit is available.
    ///
    /// Where blocking is impossible the exit is a defect describing the
    /// [`BlockingError`].
    pub fn run_blocking_exit<E, A>(&self, effect: IO<E, A>) -> Exit<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        self.try_run_blocking_exit(effect)
            .unwrap_or_else(|error| Exit::die(Defect::new(error)))
    }

    /// Runs `effect`, blocks until it finishes, and returns its value.
    ///
    /// # Errors
    ///
    /// Returns a [`FiberFailure`] if the fiber did not succeed.
    pub fn run_blocking<E, A>(&self, effect: IO<E, A>) -> Result<A, FiberFailure<E>>
    where
        E: fmt::Debug + Send + 'static,
        A: Send + 'static,
    {
        self.run_blocking_exit(effect)
            .into_result()
            .map_err(FiberFailure::new)
    }

    /// Starts `effect` in a root fiber registered in the global scope and
    /// returns its handle.
    pub fn fork_daemon<E, A>(&self, effect: IO<E, A>) -> Fiber<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let (fiber, instruction) = self.root_fiber(effect);
        Scope::global().attach(&fiber);
        fiber.start(instruction);
        Fiber::new(fiber)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("owned", &self.inner.owned.is_some())
            .finish()
    }
}

// =============================================================================
// CancelHandle
// =============================================================================

/// Interrupts a root fiber started with [`Runtime::run`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    fiber: Arc<FiberContext>,
}

impl CancelHandle {
    /// Requests interruption of the root fiber. Does not wait.
    pub fn cancel(&self) {
        self.fiber.interrupt_as(FiberId::NONE);
    }

    /// The root fiber's id.
    pub fn fiber_id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Returns `true` once the root fiber is done.
    pub fn is_done(&self) -> bool {
        self.fiber.is_done()
    }
}

// =============================================================================
// ExitFuture
// =============================================================================

pin_project! {
    /// The future returned by [`Runtime::run_future_exit`].
    ///
    /// Dropping the future does not stop the fiber; use
    /// [`ExitFuture::cancel_handle`] for that.
    pub struct ExitFuture<E, A> {
        #[pin]
        receiver: oneshot::Receiver<Exit<E, A>>,
        handle: CancelHandle,
    }
}

impl<E, A> ExitFuture<E, A> {
    /// A handle that interrupts the running fiber.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }
}

impl<E, A> Future for ExitFuture<E, A> {
    type Output = Exit<E, A>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().receiver.poll(context).map(|received| {
            received.unwrap_or_else(|_| {
                Exit::die(Defect::message(
                    "the runtime shut down before the fiber completed",
                ))
            })
        })
    }
}

impl<E, A> fmt::Debug for ExitFuture<E, A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ExitFuture")
            .field("fiber", &self.handle.fiber_id())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Runtime: Send, Sync, Clone);
static_assertions::assert_impl_all!(CancelHandle: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Cause;
    use rstest::rstest;

    #[rstest]
    fn run_delivers_the_exit_to_the_callback() {
        let runtime = Runtime::new().expect("runtime");
        let (sender, receiver) = std::sync::mpsc::channel();
        let program: IO<String, i32> = IO::pure(7);
        runtime.run(program, move |exit| {
            sender.send(exit).expect("send");
        });
        assert_eq!(receiver.recv().expect("exit"), Exit::succeed(7));
    }

    #[rstest]
    fn cancel_interrupts_the_root_fiber() {
        let runtime = Runtime::new().expect("runtime");
        let future = runtime.run_future_exit(IO::<String, i32>::never());
        future.cancel_handle().cancel();
        let exit = futures::executor::block_on(future);
        assert_eq!(exit, Exit::Failure(Cause::interrupt(FiberId::NONE)));
    }

    #[rstest]
    fn run_blocking_rejects_with_a_rendered_failure() {
        let runtime = Runtime::new().expect("runtime");
        let failure = runtime
            .run_blocking(IO::<String, i32>::fail("nope".to_string()))
            .expect_err("failure");
        assert!(failure.rendered().contains("nope"));
    }

    #[rstest]
    fn current_fails_outside_tokio() {
        assert!(matches!(
            Runtime::current(),
            Err(RuntimeError::NoCurrentRuntime)
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_inside_a_current_thread_runtime_is_refused() {
        let runtime = Runtime::current().expect("runtime");
        let result = runtime.try_run_blocking_exit(IO::<String, i32>::pure(1));
        assert_eq!(result, Err(BlockingError::CurrentThreadRuntime));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_future_exit_works_on_an_attached_runtime() {
        let runtime = Runtime::current().expect("runtime");
        let exit = runtime.run_future_exit(IO::<String, i32>::pure(3)).await;
        assert_eq!(exit, Exit::succeed(3));
    }
}
