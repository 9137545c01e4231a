//! # lambars-fiber
//!
//! A fiber-based effect runtime: effects are values describing programs,
//! and a [`Runtime`](runtime::Runtime) runs them as lightweight fibers with
//! structured concurrency, interruption and resource safety.
//!
//! ## Overview
//!
//! - **Effects**: [`Effect<R, E, A>`](effect::Effect) needs an environment
//!   `R`, may fail with `E` and succeeds with `A`.
//! - **Failures**: [`Cause`](cause::Cause) keeps typed failures, defects and
//!   interruption apart; [`Exit`](exit::Exit) is the outcome of a fiber.
//! - **Fibers**: `fork`, `join`, `interrupt`, supervision through
//!   [`Scope`](fiber::Scope) and fiber-local state through
//!   [`FiberRef`](fiber::FiberRef).
//! - **Synchronization**: [`Promise`](sync::Promise), [`Ref`](sync::Ref),
//!   [`RefM`](sync::RefM), [`Semaphore`](sync::Semaphore) and
//!   [`Queue`](sync::Queue).
//! - **Resources**: [`Managed`](managed::Managed) values released in reverse
//!   acquisition order, and memoized [`Layer`](managed::Layer)s.
//!
//! ## Feature Flags
//!
//! - `sync`: synchronization primitives
//! - `managed`: `Managed`, `ReleaseMap` and `Layer` (implies `sync`)
//! - `full`: Enable all features
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use lambars_fiber::prelude::*;
//!
//! let runtime = Runtime::new().unwrap();
//! let program: IO<String, i32> = IO::pure(20)
//!     .delay(Duration::from_millis(5))
//!     .fork()
//!     .flat_map(|fiber| fiber.join())
//!     .fmap(|value| value + 1)
//!     .zip_par_with(IO::pure(21), |left, right| left + right);
//! assert_eq!(runtime.run_blocking(program).unwrap(), 42);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_closure_for_method_calls)]

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```rust
/// use lambars_fiber::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cause::{Cause, Defect};
    pub use crate::either::Either;
    pub use crate::effect::{Callback, Decision, Effect, IO, InterruptRestore, Schedule, UIO};
    pub use crate::exit::{AnyExit, Exit};
    pub use crate::fiber::{Fiber, FiberDescriptor, FiberId, FiberRef, FiberStatus, Scope};
    pub use crate::runtime::{CancelHandle, FiberFailure, Runtime, RuntimeConfig, default_runtime};

    #[cfg(feature = "sync")]
    pub use crate::sync::{Promise, Queue, Ref, RefM, Semaphore, Strategy};

    #[cfg(feature = "managed")]
    pub use crate::managed::{ExecutionStrategy, Finalizer, Layer, Managed, MemoMap, ReleaseMap};
}

pub mod cause;
pub mod effect;
pub mod either;
pub mod exit;
pub mod fiber;
pub mod runtime;

#[cfg(feature = "sync")]
pub mod sync;

#[cfg(feature = "managed")]
pub mod managed;
