//! Integration tests for the runtime runners and configuration.
//!
//! These tests verify that:
//! 1. The default runtime is a lazily built singleton
//! 2. Every runner reports the fiber's exit faithfully
//! 3. Blocking runners refuse to block a current-thread runtime
//! 4. A single worker stays fair thanks to the yield budget

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use lambars_fiber::prelude::*;
use lambars_fiber::runtime::{BlockingError, RuntimeError};
use rstest::rstest;

// =============================================================================
// Construction
// =============================================================================

#[rstest]
fn default_runtime_is_a_singleton() {
    assert!(ptr::eq(default_runtime(), default_runtime()));
}

#[rstest]
fn invalid_configurations_are_rejected() {
    let config = RuntimeConfig::default().with_worker_threads(0);
    assert!(matches!(
        Runtime::with_config(config),
        Err(RuntimeError::InvalidConfig(_))
    ));
}

#[rstest]
fn configured_runtimes_keep_their_config() {
    let config = RuntimeConfig::default()
        .with_worker_threads(2)
        .with_yield_op_count(64)
        .with_thread_name("test-fibers");
    let runtime = Runtime::with_config(config).expect("runtime");
    assert_eq!(runtime.config().worker_threads(), 2);
    assert_eq!(runtime.config().yield_op_count(), 64);
    assert_eq!(runtime.config().thread_name(), "test-fibers");
}

// =============================================================================
// Runners
// =============================================================================

#[rstest]
fn run_blocking_returns_the_value() {
    let runtime = Runtime::new().expect("runtime");
    let program: IO<String, i32> = IO::pure(6).fmap(|n| n * 7);
    assert_eq!(runtime.run_blocking(program).expect("success"), 42);
}

#[rstest]
fn run_blocking_reports_defects_in_the_failure() {
    let runtime = Runtime::new().expect("runtime");
    let program: IO<String, i32> = IO::total(|| panic!("exploded"));
    let failure = runtime.run_blocking(program).expect_err("failure");
    assert!(failure.cause().is_die());
    assert!(failure.rendered().contains("exploded"));
}

#[rstest]
fn cancel_handles_interrupt_running_programs() {
    let runtime = Runtime::new().expect("runtime");
    let (sender, receiver) = std::sync::mpsc::channel();
    let handle = runtime.run(IO::<String, ()>::never(), move |exit| {
        let _ = sender.send(exit.is_interrupted());
    });
    assert!(!handle.is_done());
    handle.cancel();
    assert!(receiver.recv_timeout(Duration::from_secs(5)).expect("exit"));
}

#[rstest]
fn a_panicking_callback_does_not_poison_the_runtime() {
    let runtime = Runtime::new().expect("runtime");
    runtime.run(IO::<String, i32>::pure(1), |_| panic!("callback"));
    assert_eq!(
        runtime.run_blocking_exit(IO::<String, i32>::pure(2)),
        Exit::succeed(2)
    );
}

#[rstest]
fn daemons_forked_from_the_runtime_can_be_joined() {
    let runtime = Runtime::new().expect("runtime");
    let fiber = runtime.fork_daemon(IO::<String, i32>::pure(5).delay(Duration::from_millis(2)));
    let program: IO<String, i32> = fiber.join();
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_future_rejects_with_a_fiber_failure() {
    let runtime = Runtime::current().expect("runtime");
    let failure = runtime
        .run_future(IO::<String, i32>::fail("remote".to_string()))
        .await
        .expect_err("failure");
    assert_eq!(failure.into_cause(), Cause::fail("remote".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_inside_a_multi_thread_runtime_is_allowed() {
    let runtime = Runtime::current().expect("runtime");
    let exit = runtime.try_run_blocking_exit(IO::<String, i32>::pure(1));
    assert_eq!(exit, Ok(Exit::succeed(1)));
}

#[tokio::test(flavor = "current_thread")]
async fn run_blocking_exit_turns_refusal_into_a_defect() {
    let runtime = Runtime::current().expect("runtime");
    assert_eq!(
        runtime.try_run_blocking_exit(IO::<String, i32>::pure(1)),
        Err(BlockingError::CurrentThreadRuntime)
    );
    assert!(runtime
        .run_blocking_exit(IO::<String, i32>::pure(1))
        .cause()
        .is_some_and(Cause::is_die));
}

// =============================================================================
// Fairness
// =============================================================================

#[rstest]
fn a_busy_fiber_does_not_starve_others_on_one_worker() {
    let config = RuntimeConfig::default()
        .with_worker_threads(1)
        .with_yield_op_count(32);
    let runtime = Runtime::with_config(config).expect("runtime");
    let stop = Arc::new(AtomicBool::new(false));
    let spins = Arc::new(AtomicUsize::new(0));

    fn spin(stop: Arc<AtomicBool>, spins: Arc<AtomicUsize>) -> UIO<()> {
        UIO::suspend(move || {
            if stop.load(Ordering::SeqCst) {
                UIO::unit()
            } else {
                spins.fetch_add(1, Ordering::Relaxed);
                spin(stop, spins)
            }
        })
    }

    let stopper = Arc::clone(&stop);
    let program: UIO<()> = spin(Arc::clone(&stop), Arc::clone(&spins))
        .fork()
        .flat_map(move |busy| {
            UIO::total(move || stopper.store(true, Ordering::SeqCst)).then(busy.join())
        });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(()));
    assert!(stop.load(Ordering::SeqCst));
}
