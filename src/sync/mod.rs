//! Synchronization primitives for fibers.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Promise`] | single-assignment rendezvous |
//! | [`Ref`] | atomically updated cell |
//! | [`RefM`] | cell updated by effects, one at a time |
//! | [`Semaphore`] | FIFO counting semaphore |
//! | [`Queue`] | asynchronous FIFO queue with surplus strategies |
//!
//! Every primitive is a cheap, cloneable handle; clones share state.
//! Suspending operations (`Promise::await_`, `Queue::take`, a bounded
//! `Queue::offer`, `Semaphore::acquire_n`) deregister the waiter when the
//! waiting fiber is interrupted.

mod promise;
mod queue;
mod ref_m;
mod reference;
mod semaphore;

pub use promise::Promise;
pub use queue::{Queue, Strategy};
pub use ref_m::RefM;
pub use reference::Ref;
pub use semaphore::Semaphore;

use crate::effect::Effect;
use crate::fiber::FiberId;

/// Fails with an interruption attributed to the calling fiber, whatever the
/// interrupt status.
pub(crate) fn interrupted<R, E, A>() -> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    Effect::<R, E, FiberId>::fiber_id().flat_map(Effect::interrupt_as)
}
