#![cfg(feature = "sync")]
//! Integration tests for the synchronization primitives: `Promise`, `Ref`,
//! `RefM`, `Semaphore` and `Queue`.

use std::convert::Infallible;
use std::time::Duration;

use lambars_fiber::prelude::*;
use rstest::{fixture, rstest};

#[fixture]
fn runtime() -> Runtime {
    Runtime::new().expect("runtime")
}

// =============================================================================
// Promise
// =============================================================================

#[rstest]
fn a_promise_is_completed_at_most_once(runtime: Runtime) {
    let program: UIO<(usize, i32)> = Promise::<Infallible, i32>::make().flat_map(|promise| {
        let racing = promise.clone();
        UIO::foreach_par(0..50, move |n| racing.succeed(n))
            .flat_map(move |won| {
                let winners = won.into_iter().filter(|won| *won).count();
                promise.await_().fmap(move |value| (winners, value))
            })
    });
    let Exit::Success((winners, value)) = runtime.run_blocking_exit(program) else {
        panic!("expected success");
    };
    assert_eq!(winners, 1);
    assert!((0..50).contains(&value));
}

#[rstest]
fn waiters_are_resumed_with_the_failure(runtime: Runtime) {
    let program: IO<String, Vec<i32>> = Promise::<String, i32>::make().flat_map(|promise| {
        let waiting = promise.clone();
        IO::foreach(0..3, move |_| waiting.await_::<()>().fork()).flat_map(move |fibers| {
            promise
                .fail("broken".to_string())
                .then(Fiber::join_all(fibers))
        })
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::fail("broken".to_string()));
}

#[rstest]
fn poll_does_not_suspend(runtime: Runtime) {
    let program: UIO<(bool, bool)> = Promise::<Infallible, i32>::make().flat_map(|promise| {
        let completed = promise.clone();
        promise.poll().flat_map(move |before| {
            completed
                .succeed(1)
                .then(completed.poll())
                .fmap(move |after| (before.is_none(), after.is_some()))
        })
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed((true, true)));
}

#[rstest]
fn interrupting_a_waiter_leaves_the_promise_usable(runtime: Runtime) {
    let program: UIO<i32> = Promise::<Infallible, i32>::make().flat_map(|promise| {
        let waiting = promise.await_::<()>();
        let later = promise.clone();
        waiting
            .fork()
            .flat_map(|fiber| UIO::sleep(Duration::from_millis(2)).then(fiber.interrupt()))
            .then(later.succeed(9))
            .then(later.await_())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(9));
}

// =============================================================================
// Ref / RefM
// =============================================================================

#[rstest]
fn concurrent_updates_are_not_lost(runtime: Runtime) {
    let program: UIO<u64> = Ref::make(0u64).flat_map(|counter| {
        let workers = counter.clone();
        UIO::foreach_par(0..200, move |_| workers.update(|n| n + 1)).then(counter.get())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(200));
}

#[rstest]
fn modify_returns_the_result_and_stores_the_state(runtime: Runtime) {
    let program: UIO<(String, i32)> = Ref::make(10).flat_map(|cell| {
        let reader = cell.clone();
        cell.modify(|n| (format!("was {n}"), n * 2))
            .flat_map(move |result| reader.get().fmap(move |n| (result, n)))
    });
    assert_eq!(
        runtime.run_blocking_exit(program),
        Exit::succeed(("was 10".to_string(), 20))
    );
}

#[rstest]
fn ref_m_runs_one_effectful_update_at_a_time(runtime: Runtime) {
    let program: UIO<(i32, i32)> = Ref::make((0, 0)).flat_map(|tracker| {
        RefM::make(0).flat_map(move |cell| {
            let updater = cell.clone();
            let tracked = tracker.clone();
            UIO::foreach_par(0..20, move |_| {
                let tracked = tracked.clone();
                updater.update(move |n| {
                    let leave = tracked.clone();
                    tracked
                        .update(|(active, peak): (i32, i32)| (active + 1, peak.max(active + 1)))
                        .then(UIO::yield_now())
                        .then(leave.update(|(active, peak)| (active - 1, peak)))
                        .as_(n + 1)
                })
            })
            .then(cell.get())
            .flat_map(move |total| tracker.get().fmap(move |(_, peak)| (total, peak)))
        })
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed((20, 1)));
}

#[rstest]
fn ref_m_failure_keeps_the_old_value(runtime: Runtime) {
    let program: IO<String, i32> = RefM::make(5).flat_map(|cell| {
        let reader = cell.clone();
        cell.update(|_| IO::<String, i32>::fail("nope".to_string()))
            .catch_all(|_| IO::unit())
            .then(reader.get())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(5));
}

// =============================================================================
// Semaphore
// =============================================================================

#[rstest]
fn with_permits_bounds_concurrency(runtime: Runtime) {
    let program: UIO<i32> = Ref::make((0, 0)).flat_map(|tracker| {
        Semaphore::make(3).flat_map(move |semaphore| {
            let tracked = tracker.clone();
            UIO::foreach_par(0..12, move |_| {
                let leave = tracked.clone();
                semaphore.with_permit(
                    tracked
                        .update(|(active, peak): (i32, i32)| (active + 1, peak.max(active + 1)))
                        .then(UIO::sleep(Duration::from_millis(2)))
                        .then(leave.update(|(active, peak)| (active - 1, peak))),
                )
            })
            .then(tracker.get().fmap(|(_, peak)| peak))
        })
    });
    let Exit::Success(peak) = runtime.run_blocking_exit(program) else {
        panic!("expected success");
    };
    assert!((1..=3).contains(&peak));
}

#[rstest]
fn permits_are_returned_when_the_holder_is_interrupted(runtime: Runtime) {
    let program: UIO<usize> = Semaphore::make(1).flat_map(|semaphore| {
        let holder = semaphore.with_permit(UIO::<()>::never());
        let inspector = semaphore.clone();
        holder
            .fork()
            .flat_map(|fiber| UIO::sleep(Duration::from_millis(2)).then(fiber.interrupt()))
            .then(inspector.available())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(1));
}

#[rstest]
fn foreach_par_n_keeps_order(runtime: Runtime) {
    let program: UIO<Vec<i32>> = UIO::foreach_par_n(2, 0..6, |n| {
        UIO::pure(n * n).delay(Duration::from_millis(u64::try_from(6 - n).unwrap_or(0)))
    });
    assert_eq!(
        runtime.run_blocking_exit(program),
        Exit::succeed(vec![0, 1, 4, 9, 16, 25])
    );
}

// =============================================================================
// Queue
// =============================================================================

#[rstest]
#[case(Strategy::BackPressure)]
#[case(Strategy::Dropping)]
#[case(Strategy::Sliding)]
fn items_come_out_in_offer_order(runtime: Runtime, #[case] strategy: Strategy) {
    let program: UIO<Vec<i32>> = match strategy {
        Strategy::BackPressure => Queue::bounded(8),
        Strategy::Dropping => Queue::dropping(8),
        Strategy::Sliding => Queue::sliding(8),
    }
    .flat_map(|queue| {
        let consumer = queue.clone();
        queue.offer_all(vec![1, 2, 3, 4]).then(consumer.take_all())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec![1, 2, 3, 4]));
}

#[rstest]
fn back_pressure_suspends_offers_until_there_is_room(runtime: Runtime) {
    let program: UIO<(i64, Vec<i32>)> = Queue::bounded(2).flat_map(|queue| {
        let producer: UIO<bool> = queue.offer_all(vec![1, 2, 3, 4]);
        let observer = queue.clone();
        let consumer = queue.clone();
        producer.fork().flat_map(move |fiber| {
            UIO::sleep(Duration::from_millis(5))
                .then(observer.size())
                .flat_map(move |size| {
                    UIO::foreach(0..4, move |_| consumer.take())
                        .flat_map(move |items| fiber.join().as_((size, items)))
                })
        })
    });
    // Two buffered items plus one suspended offer.
    assert_eq!(
        runtime.run_blocking_exit(program),
        Exit::succeed((3, vec![1, 2, 3, 4]))
    );
}

#[rstest]
fn dropping_discards_new_items(runtime: Runtime) {
    let program: UIO<(bool, Vec<i32>)> = Queue::dropping(2).flat_map(|queue| {
        let consumer = queue.clone();
        queue
            .offer_all(vec![1, 2, 3])
            .flat_map(move |accepted| consumer.take_all().fmap(move |items| (accepted, items)))
    });
    assert_eq!(
        runtime.run_blocking_exit(program),
        Exit::succeed((false, vec![1, 2]))
    );
}

#[rstest]
fn sliding_discards_old_items(runtime: Runtime) {
    let program: UIO<Vec<i32>> = Queue::sliding(2).flat_map(|queue| {
        let consumer = queue.clone();
        queue.offer_all(vec![1, 2, 3]).then(consumer.take_all())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec![2, 3]));
}

#[rstest]
fn takers_are_served_in_arrival_order(runtime: Runtime) {
    let program: UIO<Vec<i32>> = Queue::unbounded().flat_map(|queue| {
        let takers = queue.clone();
        let producer = queue.clone();
        UIO::foreach(0..3, move |_| {
            takers
                .take()
                .fork()
                .flat_map(|fiber| UIO::sleep(Duration::from_millis(1)).as_(fiber))
        })
        .flat_map(move |fibers| {
            producer
                .offer_all(vec![10, 20, 30])
                .then(Fiber::join_all(fibers))
        })
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(vec![10, 20, 30]));
}

#[rstest]
fn size_counts_suspended_takers_negatively(runtime: Runtime) {
    let program: UIO<i64> = Queue::<i32>::bounded(4).flat_map(|queue| {
        let taker = queue.clone();
        let observer = queue.clone();
        taker
            .take::<(), Infallible>()
            .fork()
            .then(UIO::sleep(Duration::from_millis(5)))
            .then(observer.size())
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(-1));
}

#[rstest]
fn shutdown_interrupts_takers_and_later_calls(runtime: Runtime) {
    let program: UIO<(bool, bool, bool)> = Queue::<i32>::bounded(4).flat_map(|queue| {
        let taker = queue.clone();
        let closer = queue.clone();
        taker.take::<(), Infallible>().fork().flat_map(move |fiber| {
            UIO::sleep(Duration::from_millis(2))
                .then(closer.shutdown())
                .then(fiber.await_exit())
                .flat_map(move |taken| {
                    let after = closer.clone();
                    closer
                        .offer::<(), Infallible>(1)
                        .exit::<Infallible>()
                        .flat_map(move |offered| {
                            after.is_shutdown().fmap(move |shut| {
                                (taken.is_interrupted(), offered.is_interrupted(), shut)
                            })
                        })
                        .uninterruptible()
                })
        })
    });
    assert_eq!(
        runtime.run_blocking_exit(program),
        Exit::succeed((true, true, true))
    );
}

#[rstest]
fn shutdown_interrupts_a_parked_offer(runtime: Runtime) {
    let program: UIO<bool> = Queue::<i32>::bounded(1).flat_map(|queue| {
        let putter = queue.clone();
        let closer = queue.clone();
        queue.offer::<(), Infallible>(1).then(
            putter
                .offer::<(), Infallible>(2)
                .fork()
                .flat_map(move |fiber| {
                    UIO::sleep(Duration::from_millis(2))
                        .then(closer.shutdown())
                        .then(fiber.await_exit())
                        .fmap(|exit| exit.is_interrupted())
                }),
        )
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(true));
}

#[rstest]
fn size_and_take_fail_after_shutdown(runtime: Runtime) {
    let program: UIO<(bool, bool)> = Queue::<i32>::bounded(2).flat_map(|queue| {
        let sizer = queue.clone();
        let taker = queue.clone();
        queue
            .offer::<(), Infallible>(1)
            .then(queue.shutdown())
            .then(sizer.size::<(), Infallible>().exit::<Infallible>())
            .flat_map(move |size| {
                taker
                    .take::<(), Infallible>()
                    .exit::<Infallible>()
                    .fmap(move |taken| (size.is_interrupted(), taken.is_interrupted()))
            })
            .uninterruptible()
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed((true, true)));
}

#[rstest]
fn await_shutdown_resumes_after_shutdown(runtime: Runtime) {
    let program: UIO<bool> = Queue::<i32>::unbounded().flat_map(|queue| {
        let watcher = queue.clone();
        let closer = queue.clone();
        watcher
            .await_shutdown()
            .fork()
            .flat_map(move |fiber| closer.shutdown().then(fiber.join()).as_(true))
    });
    assert_eq!(runtime.run_blocking_exit(program), Exit::succeed(true));
}
