//! Integration tests for effect evaluation: sequencing, failures, defects,
//! resource brackets, environments and scheduling.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lambars_fiber::prelude::*;
use rstest::{fixture, rstest};

#[fixture]
fn runtime() -> Runtime {
    Runtime::new().expect("runtime")
}

// =============================================================================
// Sequencing
// =============================================================================

#[rstest]
fn chained_success(runtime: Runtime) {
    let program: IO<String, i32> = IO::succeed(1).flat_map(|x| IO::succeed(x + 1));
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(2));
}

#[rstest]
fn plain_failure(runtime: Runtime) {
    let program: IO<String, i32> = IO::fail("e".to_string());
    assert_eq!(
        runtime.run_blocking_exit(program),
        Exit::Failure(Cause::fail("e".to_string()))
    );
}

#[rstest]
fn deep_flat_map_chains_are_stack_safe(runtime: Runtime) {
    fn count_down(remaining: u64, total: u64) -> UIO<u64> {
        if remaining == 0 {
            UIO::pure(total)
        } else {
            UIO::suspend(move || count_down(remaining - 1, total + 1))
        }
    }
    let left_nested = (0..100_000).fold(UIO::pure(0u64), |effect, _| effect.fmap(|n| n + 1));
    assert_eq!(runtime.run_blocking_exit(left_nested), Exit::succeed(100_000));
    assert_eq!(
        runtime.run_blocking_exit(count_down(100_000, 0)),
        Exit::succeed(100_000)
    );
}

#[rstest]
fn foreach_keeps_order(runtime: Runtime) {
    let program: IO<String, Vec<i32>> = IO::foreach(1..=4, |n| IO::pure(n * 10));
    assert_eq!(
        runtime.run_blocking_exit(program),
        Exit::succeed(vec![10, 20, 30, 40])
    );
}

#[rstest]
fn collect_all_stops_at_the_first_failure(runtime: Runtime) {
    let visited = Arc::new(AtomicUsize::new(0));
    let effects: Vec<IO<String, i32>> = (0..5)
        .map(|n| {
            let visited = Arc::clone(&visited);
            IO::suspend(move || {
                visited.fetch_add(1, Ordering::SeqCst);
                if n == 2 { IO::fail(format!("at {n}")) } else { IO::pure(n) }
            })
        })
        .collect();
    assert_eq!(
        runtime.run_blocking_exit(IO::collect_all(effects)),
        Exit::fail("at 2".to_string())
    );
    assert_eq!(visited.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Failures and defects
// =============================================================================

#[rstest]
fn panics_become_defects(runtime: Runtime) {
    let program: IO<String, i32> = IO::pure(1).fmap(|_| panic!("kaboom"));
    let exit = runtime.run_blocking_exit(program);
    let defects = exit.cause().expect("failure").defects();
    assert_eq!(defects.len(), 1);
    assert!(defects[0].to_string().contains("kaboom"));
}

#[rstest]
fn catch_all_does_not_see_defects(runtime: Runtime) {
    let program: IO<String, i32> = IO::<String, i32>::die_message("broken").catch_all(|_| IO::pure(0));
    assert!(runtime.run_blocking_exit(program).cause().is_some_and(Cause::is_die));
}

#[rstest]
fn catch_all_cause_sees_everything(runtime: Runtime) {
    let program: IO<String, bool> = IO::<String, bool>::die_message("broken")
        .catch_all_cause(|cause| IO::pure(cause.is_die()));
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(true));
}

#[rstest]
fn partial_reports_typed_failures(runtime: Runtime) {
    let program: IO<std::num::ParseIntError, i32> = IO::partial(|| "12x".parse::<i32>());
    assert!(runtime.run_blocking_exit(program).cause().is_some_and(Cause::is_failure));
}

#[rstest]
fn sandbox_and_unsandbox_round_trip_the_cause(runtime: Runtime) {
    let program: IO<String, i32> = IO::<String, i32>::fail("e".to_string()).sandbox().unsandbox();
    assert_eq!(runtime.run_blocking_exit(program), Exit::fail("e".to_string()));
}

#[rstest]
fn either_moves_failures_into_the_value(runtime: Runtime) {
    let program: UIO<Result<i32, String>> = IO::<String, i32>::fail("e".to_string()).either();
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(Err("e".to_string())));
}

#[rstest]
fn fold_handles_both_outcomes(runtime: Runtime) {
    let failed: UIO<String> = IO::<String, i32>::fail("e".to_string())
        .fold(|error| format!("failed: {error}"), |value| format!("ok: {value}"));
    assert_eq!(runtime.run_blocking_exit(failed), Exit::succeed("failed: e".to_string()));
}

// =============================================================================
// Brackets
// =============================================================================

#[rstest]
fn bracket_releases_once_when_use_panics(runtime: Runtime) {
    let releases = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&releases);
    let program: IO<String, i32> = Effect::bracket(
        IO::pure(7),
        |_| IO::total(|| panic!("use failed")),
        move |_| {
            UIO::total(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        },
    );
    let exit = runtime.run_blocking_exit(program);
    assert!(exit.cause().is_some_and(Cause::is_die));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[rstest]
#[cfg(feature = "sync")]
fn bracket_exit_observes_the_outcome(runtime: Runtime) {
    let program: IO<String, bool> = Ref::make(false).flat_map(|saw_failure| {
        let observed = saw_failure.clone();
        Effect::bracket_exit(
            IO::pure(()),
            |()| IO::<String, i32>::fail("use".to_string()),
            move |(), exit: &Exit<String, i32>| observed.set(exit.is_failure()),
        )
        .catch_all(|_| IO::pure(0))
        .then(saw_failure.get())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(true));
}

#[rstest]
fn failing_finalizer_is_sequenced_after_the_failure(runtime: Runtime) {
    let program: IO<String, i32> = IO::<String, i32>::fail("first".to_string())
        .ensuring(UIO::<()>::die_message("finalizer"));
    let Exit::Failure(cause) = runtime.run_blocking_exit(program) else {
        panic!("expected failure");
    };
    assert_eq!(cause.failures(), vec!["first".to_string()]);
    assert_eq!(cause.defects().len(), 1);
}

// =============================================================================
// Environment
// =============================================================================

#[derive(Clone)]
struct Config {
    base: i32,
}

#[rstest]
fn access_reads_the_provided_environment(runtime: Runtime) {
    let program: IO<String, i32> = Effect::<Config, String, i32>::access(|config| config.base * 2)
        .flat_map(|doubled| Effect::access(move |config: &Config| doubled + config.base))
        .provide(Config { base: 7 });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(21));
}

#[rstest]
fn provide_is_scoped_to_its_effect(runtime: Runtime) {
    let inner: Effect<Config, String, i32> =
        Effect::<i32, String, i32>::access(|value| *value).provide(40);
    let program: IO<String, i32> = inner
        .flat_map(|value| Effect::access(move |config: &Config| value + config.base))
        .provide(Config { base: 2 });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(42));
}

// =============================================================================
// Scheduling
// =============================================================================

#[rstest]
fn retry_reruns_until_success(runtime: Runtime) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let program: IO<String, usize> = IO::retry(
        move || {
            let counter = Arc::clone(&counter);
            IO::suspend(move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 { IO::fail(format!("attempt {attempt}")) } else { IO::pure(attempt) }
            })
        },
        Schedule::recurs(5),
    );
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(2));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[rstest]
fn retry_gives_up_with_the_last_failure(runtime: Runtime) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let program: IO<usize, ()> = IO::retry(
        move || {
            let counter = Arc::clone(&counter);
            IO::suspend(move || IO::fail(counter.fetch_add(1, Ordering::SeqCst)))
        },
        Schedule::spaced(Duration::from_millis(1)).up_to(2),
    );
    assert_eq!(runtime.run_blocking_exit(program), Exit::fail(2));
}

#[rstest]
#[cfg(feature = "sync")]
fn repeat_follows_the_value(runtime: Runtime) {
    let program: UIO<i32> = Ref::make(0).flat_map(|counter| {
        UIO::repeat(
            move || counter.update_and_get(|n| n + 1),
            Schedule::while_input(|value: &i32| *value < 5),
        )
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(5));
}

#[rstest]
fn sleep_waits(runtime: Runtime) {
    let started = std::time::Instant::now();
    let program: UIO<()> = UIO::sleep(Duration::from_millis(20));
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(()));
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[rstest]
fn from_future_resumes_with_the_output(runtime: Runtime) {
    let program: IO<String, i32> = IO::from_future(|| async {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok::<_, String>(5)
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(5));
}

#[rstest]
#[cfg(feature = "sync")]
fn yield_now_lets_other_fibers_run(runtime: Runtime) {
    let program: UIO<Vec<i32>> = Ref::make(Vec::new()).flat_map(|log| {
        let writer = log.clone();
        let push = move |n: i32| {
            writer.update(move |mut entries: Vec<i32>| {
                entries.push(n);
                entries
            })
        };
        let first = push(1);
        first
            .fork::<Infallible>()
            .flat_map(move |fiber| UIO::yield_now().then(fiber.join()))
            .then(push(2))
            .then(log.get())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec![1, 2]));
}
