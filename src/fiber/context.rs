//! The trampolining fiber executor.
//!
//! A [`FiberContext`] interprets an [`Instruction`] tree with an explicit
//! continuation stack, so deeply nested programs never grow the native
//! stack. Each slice of evaluation runs inside one host task; a fiber gives
//! the host back control when it suspends on an asynchronous boundary or
//! after the configured number of steps.
//!
//! # Lifecycle
//!
//! ```text
//! Running ──async──▶ Suspended ──resume / interrupt──▶ Running ──▶ Done
//! ```
//!
//! Interruption is an overlay flag. It is acted upon at the next step of an
//! interruptible region, or immediately when the fiber is suspended in an
//! interruptible region, in which case the registered canceler runs first.
//!
//! # Asynchronous arbitration
//!
//! Every suspension gets a fresh epoch. A resume callback and an
//! interruption race for the epoch under the shared lock; whichever moves
//! the status from `Suspended` back to `Running` first wins, the other is
//! ignored.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cause::{Cause, Defect};
use crate::effect::instruction::{
    Continuation, Env, FailureHandler, Instruction, RaceHandler, Register, Value, erase,
};
use crate::exit::Exit;
use crate::fiber::{FiberDescriptor, FiberId, FiberRefs, FiberStatus, Scope};
use crate::runtime::Runtime;

type Observer = Box<dyn FnOnce() + Send>;

// =============================================================================
// Resume
// =============================================================================

/// The one-shot callback handed to an asynchronous registration.
pub(crate) struct Resume {
    fiber: Arc<FiberContext>,
    epoch: u64,
}

impl Resume {
    /// Continues the suspended fiber with `instruction`, unless the fiber was
    /// interrupted or resumed in the meantime.
    pub(crate) fn resume(self, instruction: Instruction) {
        self.fiber.resume_async(self.epoch, instruction);
    }

    /// Interrupts the suspended fiber on its own behalf.
    pub(crate) fn interrupt_self(self) {
        let fiber_id = self.fiber.id;
        self.fiber.interrupt_as(fiber_id);
        self.resume(Instruction::Fail(Cause::interrupt(fiber_id)));
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.fiber.id
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.fiber.runtime
    }
}

// =============================================================================
// State
// =============================================================================

enum Frame {
    Apply(Continuation),
    Fold {
        on_failure: FailureHandler,
        on_success: Continuation,
    },
    InterruptExit,
    EnvExit,
}

/// State owned by whichever host task is currently evaluating the fiber.
struct RunState {
    stack: Vec<Frame>,
    environments: SmallVec<[Env; 4]>,
    interrupt_status: SmallVec<[bool; 8]>,
    fiber_refs: FiberRefs,
    interrupting: bool,
    scope_closed: bool,
}

impl RunState {
    fn is_interruptible(&self) -> bool {
        self.interrupt_status.last().copied().unwrap_or(true)
    }

    fn environment(&self) -> Env {
        self.environments
            .last()
            .cloned()
            .unwrap_or_else(crate::effect::instruction::unit_environment)
    }
}

enum Status {
    Running,
    Suspended {
        epoch: u64,
        interruptible: bool,
        canceler: Option<Instruction>,
    },
    Done,
}

/// State observed by other fibers.
struct Shared {
    status: Status,
    async_epoch: u64,
    interruptors: Vec<FiberId>,
    exit: Option<Exit<Value, Value>>,
    exit_taken: bool,
    final_refs: Option<FiberRefs>,
    observers: Vec<Observer>,
}

// =============================================================================
// FiberContext
// =============================================================================

pub(crate) struct FiberContext {
    id: FiberId,
    runtime: Runtime,
    scope: Scope,
    interrupt_requested: AtomicBool,
    shared: Mutex<Shared>,
    run_state: Mutex<Option<RunState>>,
}

impl FiberContext {
    pub(crate) fn new(
        runtime: Runtime,
        environment: Env,
        fiber_refs: FiberRefs,
        interruptible: bool,
    ) -> Arc<Self> {
        let mut environments = SmallVec::new();
        environments.push(environment);
        let mut interrupt_status = SmallVec::new();
        interrupt_status.push(interruptible);
        Arc::new(Self {
            id: FiberId::next(),
            runtime,
            scope: Scope::detached(),
            interrupt_requested: AtomicBool::new(false),
            shared: Mutex::new(Shared {
                status: Status::Running,
                async_epoch: 0,
                interruptors: Vec::new(),
                exit: None,
                exit_taken: false,
                final_refs: None,
                observers: Vec::new(),
            }),
            run_state: Mutex::new(Some(RunState {
                stack: Vec::new(),
                environments,
                interrupt_status,
                fiber_refs,
                interrupting: false,
                scope_closed: false,
            })),
        })
    }

    pub(crate) const fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) const fn scope(&self) -> &Scope {
        &self.scope
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match &self.shared.lock().status {
            Status::Running => FiberStatus::Running,
            Status::Suspended { interruptible, .. } => FiberStatus::Suspended {
                interruptible: *interruptible,
            },
            Status::Done => FiberStatus::Done,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.shared.lock().status, Status::Done)
    }

    fn is_interrupt_requested(&self) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
    }

    /// Schedules the first slice of evaluation.
    pub(crate) fn start(self: &Arc<Self>, instruction: Instruction) {
        self.runtime.schedule(Arc::clone(self), instruction);
    }

    /// Runs `observer` once the fiber is done, or immediately if it already
    /// is.
    pub(crate) fn on_done(&self, observer: Observer) {
        let mut shared = self.shared.lock();
        if matches!(shared.status, Status::Done) {
            drop(shared);
            observer();
        } else {
            shared.observers.push(observer);
        }
    }

    /// Takes the exit of a finished fiber. The exit can be taken only once.
    pub(crate) fn take_exit(&self) -> Exit<Value, Value> {
        let mut shared = self.shared.lock();
        if let Some(exit) = shared.exit.take() {
            shared.exit_taken = true;
            exit
        } else if shared.exit_taken {
            Exit::die(Defect::message("fiber exit was already consumed"))
        } else {
            Exit::die(Defect::message("fiber has not completed"))
        }
    }

    /// The fiber-local values of a finished fiber.
    pub(crate) fn final_refs(&self) -> Option<FiberRefs> {
        self.shared.lock().final_refs.clone()
    }

    /// Requests interruption on behalf of `by`.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        {
            let mut shared = self.shared.lock();
            if matches!(shared.status, Status::Done) {
                return;
            }
            if !shared.interruptors.contains(&by) {
                shared.interruptors.push(by);
            }
        }
        self.interrupt_requested.store(true, Ordering::Release);
        tracing::debug!(fiber = %self.id, by = %by, "interruption requested");
        self.interrupt_suspended();
    }

    fn interruption_cause(&self) -> Cause<Value> {
        let shared = self.shared.lock();
        let cause = shared
            .interruptors
            .iter()
            .fold(Cause::Empty, |cause, fiber_id| {
                Cause::both(cause, Cause::interrupt(*fiber_id))
            });
        if cause.is_empty() {
            Cause::interrupt(self.id)
        } else {
            cause
        }
    }

    fn descriptor(&self, run: &RunState) -> FiberDescriptor {
        FiberDescriptor {
            id: self.id,
            interruptible: run.is_interruptible(),
            scope: self.scope.clone(),
            interruptors: self.shared.lock().interruptors.clone(),
        }
    }

    fn park(&self, run: RunState) {
        *self.run_state.lock() = Some(run);
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluates `instruction` until the fiber suspends, yields, or is done.
    pub(crate) fn evaluate_now(self: &Arc<Self>, instruction: Instruction) {
        let Some(mut run) = self.run_state.lock().take() else {
            tracing::warn!(fiber = %self.id, "fiber scheduled without a parked continuation");
            return;
        };
        let budget = self.runtime.config().yield_op_count();
        let mut current = instruction;
        let mut steps = 0usize;

        loop {
            if !run.interrupting && run.is_interruptible() && self.is_interrupt_requested() {
                run.interrupting = true;
                current = self.interrupt_current(current);
            }

            if steps >= budget {
                tracing::trace!(fiber = %self.id, steps, "fiber yielding");
                self.park(run);
                self.runtime.schedule(Arc::clone(self), current);
                return;
            }
            steps += 1;

            let next = match current {
                Instruction::Succeed(value) => self.on_success(&mut run, value),

                Instruction::Fail(cause) => self.on_failure(&mut run, cause),

                Instruction::Total(thunk) => match guarded(thunk) {
                    Ok(value) => self.on_success(&mut run, value),
                    Err(cause) => Some(Instruction::Fail(cause)),
                },

                Instruction::Partial(thunk) => match guarded(thunk) {
                    Ok(Ok(value)) => self.on_success(&mut run, value),
                    Ok(Err(error)) => Some(Instruction::Fail(Cause::fail(error))),
                    Err(cause) => Some(Instruction::Fail(cause)),
                },

                Instruction::Suspend(thunk) => Some(guarded_instruction(thunk)),

                Instruction::Chain(effect, continuation) => Some(match *effect {
                    Instruction::Succeed(value) => guarded_instruction(move || continuation(value)),
                    Instruction::Total(thunk) => match guarded(thunk) {
                        Ok(value) => guarded_instruction(move || continuation(value)),
                        Err(cause) => Instruction::Fail(cause),
                    },
                    effect => {
                        run.stack.push(Frame::Apply(continuation));
                        effect
                    }
                }),

                Instruction::Fold {
                    effect,
                    on_failure,
                    on_success,
                } => {
                    run.stack.push(Frame::Fold {
                        on_failure,
                        on_success,
                    });
                    Some(*effect)
                }

                Instruction::Read(function) => {
                    let environment = run.environment();
                    Some(guarded_instruction(move || function(&environment)))
                }

                Instruction::Provide {
                    environment,
                    effect,
                } => {
                    run.environments.push(environment);
                    run.stack.push(Frame::EnvExit);
                    Some(*effect)
                }

                Instruction::Fork { effect, scope } => {
                    let child = self.fork_child(&run, *effect, scope);
                    self.on_success(&mut run, erase(child))
                }

                Instruction::Async(register) => {
                    self.suspend(run, register);
                    return;
                }

                Instruction::RaceWith {
                    left,
                    right,
                    on_left,
                    on_right,
                } => {
                    let left = self.fork_child(&run, *left, None);
                    let right = self.fork_child(&run, *right, None);
                    Some(Instruction::Async(race_register(left, right, on_left, on_right)))
                }

                Instruction::InterruptStatus {
                    effect,
                    interruptible,
                } => {
                    run.interrupt_status.push(interruptible);
                    run.stack.push(Frame::InterruptExit);
                    Some(*effect)
                }

                Instruction::CheckInterrupt(continuation) => {
                    let interruptible = run.is_interruptible();
                    Some(guarded_instruction(move || continuation(interruptible)))
                }

                Instruction::Descriptor(continuation) => {
                    let descriptor = self.descriptor(&run);
                    Some(guarded_instruction(move || continuation(descriptor)))
                }

                Instruction::Yield => {
                    self.park(run);
                    self.runtime.schedule(Arc::clone(self), Instruction::unit());
                    return;
                }

                Instruction::FiberRefs(function) => {
                    let refs = &mut run.fiber_refs;
                    match guarded(move || function(refs)) {
                        Ok(value) => self.on_success(&mut run, value),
                        Err(cause) => Some(Instruction::Fail(cause)),
                    }
                }
            };

            match next {
                Some(instruction) => current = instruction,
                None => return,
            }
        }
    }

    fn interrupt_current(&self, current: Instruction) -> Instruction {
        tracing::debug!(fiber = %self.id, "fiber interrupted");
        match current {
            Instruction::Fail(cause) if cause.is_interrupted() => Instruction::Fail(cause),
            Instruction::Fail(cause) => {
                Instruction::Fail(Cause::then(cause, self.interruption_cause()))
            }
            _ => Instruction::Fail(self.interruption_cause()),
        }
    }

    fn on_success(self: &Arc<Self>, run: &mut RunState, value: Value) -> Option<Instruction> {
        match Self::next_instruction(run, value) {
            Ok(next) => Some(next),
            Err(value) => self.finish(run, Exit::Success(value)),
        }
    }

    fn on_failure(self: &Arc<Self>, run: &mut RunState, cause: Cause<Value>) -> Option<Instruction> {
        match self.unwind(run, cause) {
            Ok(handler) => Some(handler),
            Err(cause) => self.finish(run, Exit::Failure(cause)),
        }
    }

    /// Pops frames until one accepts `value`. Returns the value back when the
    /// stack is exhausted.
    fn next_instruction(run: &mut RunState, value: Value) -> Result<Instruction, Value> {
        while let Some(frame) = run.stack.pop() {
            match frame {
                Frame::Apply(continuation) => {
                    return Ok(guarded_instruction(move || continuation(value)));
                }
                Frame::Fold { on_success, .. } => {
                    return Ok(guarded_instruction(move || on_success(value)));
                }
                Frame::InterruptExit => {
                    run.interrupt_status.pop();
                }
                Frame::EnvExit => {
                    run.environments.pop();
                }
            }
        }
        Err(value)
    }

    /// Pops frames until a failure handler accepts `cause`.
    ///
    /// Handlers in interruptible regions are skipped while an interruption
    /// is pending, so only uninterruptible finalizers observe it.
    fn unwind(&self, run: &mut RunState, cause: Cause<Value>) -> Result<Instruction, Cause<Value>> {
        while let Some(frame) = run.stack.pop() {
            match frame {
                Frame::Apply(_) => {}
                Frame::Fold { on_failure, .. } => {
                    if run.is_interruptible() && self.is_interrupt_requested() {
                        continue;
                    }
                    run.interrupting = false;
                    return Ok(guarded_instruction(move || on_failure(cause)));
                }
                Frame::InterruptExit => {
                    run.interrupt_status.pop();
                }
                Frame::EnvExit => {
                    run.environments.pop();
                }
            }
        }
        Err(cause)
    }

    fn fork_child(
        self: &Arc<Self>,
        run: &RunState,
        effect: Instruction,
        scope: Option<Scope>,
    ) -> Arc<Self> {
        let child = Self::new(
            self.runtime.clone(),
            run.environment(),
            run.fiber_refs.fork(),
            run.is_interruptible(),
        );
        let scope = scope.unwrap_or_else(|| self.scope.clone());
        tracing::trace!(parent = %self.id, child = %child.id, scope = scope.id(), "fiber forked");
        if !scope.attach(&child) {
            child.interrupt_as(self.id);
        }
        child.start(effect);
        child
    }

    // =========================================================================
    // Suspension
    // =========================================================================

    fn suspend(self: &Arc<Self>, run: RunState, register: Register) {
        let interruptible = run.is_interruptible();
        self.park(run);
        let epoch = {
            let mut shared = self.shared.lock();
            shared.async_epoch += 1;
            let epoch = shared.async_epoch;
            shared.status = Status::Suspended {
                epoch,
                interruptible,
                canceler: None,
            };
            epoch
        };
        tracing::trace!(fiber = %self.id, epoch, "fiber suspended");

        let resume = Resume {
            fiber: Arc::clone(self),
            epoch,
        };
        match guarded(move || register(resume)) {
            Ok(Some(canceler)) => self.install_canceler(epoch, canceler),
            Ok(None) => {}
            Err(cause) => self.resume_async(epoch, Instruction::Fail(cause)),
        }

        if interruptible && self.is_interrupt_requested() {
            self.interrupt_suspended();
        }
    }

    fn install_canceler(&self, epoch: u64, canceler: Instruction) {
        let mut shared = self.shared.lock();
        if let Status::Suspended {
            epoch: current,
            canceler: slot,
            ..
        } = &mut shared.status
            && *current == epoch
        {
            *slot = Some(canceler);
        }
    }

    fn resume_async(self: &Arc<Self>, epoch: u64, instruction: Instruction) {
        {
            let mut shared = self.shared.lock();
            match &shared.status {
                Status::Suspended { epoch: current, .. } if *current == epoch => {}
                _ => return,
            }
            shared.status = Status::Running;
        }
        tracing::trace!(fiber = %self.id, epoch, "fiber resumed");
        self.runtime.schedule(Arc::clone(self), instruction);
    }

    /// Wins the current epoch on behalf of a pending interruption, runs the
    /// canceler, and fails the fiber with the interruption cause.
    fn interrupt_suspended(self: &Arc<Self>) {
        let canceler = {
            let mut shared = self.shared.lock();
            match std::mem::replace(&mut shared.status, Status::Running) {
                Status::Suspended {
                    interruptible: true,
                    canceler,
                    ..
                } => canceler,
                other => {
                    shared.status = other;
                    return;
                }
            }
        };
        if let Some(run) = self.run_state.lock().as_mut() {
            run.interrupting = true;
        }
        tracing::debug!(fiber = %self.id, "interrupting suspended fiber");
        let cause = self.interruption_cause();
        let next = match canceler {
            Some(canceler) => canceler
                .ignore_failure("async canceler")
                .uninterruptible()
                .chain(move |_| Instruction::Fail(cause)),
            None => Instruction::Fail(cause),
        };
        self.runtime.schedule(Arc::clone(self), next);
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Closes the fiber's scope, then publishes `exit`.
    fn finish(self: &Arc<Self>, run: &mut RunState, exit: Exit<Value, Value>) -> Option<Instruction> {
        if !run.scope_closed {
            run.scope_closed = true;
            if let Some(close) = self.scope.close_instruction(self.id) {
                run.interrupt_status.push(false);
                return Some(close.chain(move |_| Instruction::from_exit(exit)));
            }
        }
        self.done(run, exit);
        None
    }

    fn done(&self, run: &mut RunState, exit: Exit<Value, Value>) {
        tracing::trace!(fiber = %self.id, success = exit.is_success(), "fiber done");
        let refs = std::mem::take(&mut run.fiber_refs);
        let observers = {
            let mut shared = self.shared.lock();
            shared.status = Status::Done;
            shared.exit = Some(exit);
            shared.final_refs = Some(refs);
            std::mem::take(&mut shared.observers)
        };
        for observer in observers {
            observer();
        }
    }
}

impl std::fmt::Debug for FiberContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("FiberContext")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Interrupts every fiber on behalf of `by` and waits until all are done.
pub(crate) fn interrupt_and_await(fibers: Vec<Arc<FiberContext>>, by: FiberId) -> Instruction {
    let targets = fibers.clone();
    let mut steps = Vec::with_capacity(fibers.len() + 1);
    steps.push(Instruction::Total(Box::new(move || {
        for fiber in &targets {
            fiber.interrupt_as(by);
        }
        erase(())
    })));
    steps.extend(fibers.into_iter().map(Instruction::await_done));
    Instruction::sequence(steps)
}

fn race_register(
    left: Arc<FiberContext>,
    right: Arc<FiberContext>,
    on_left: RaceHandler,
    on_right: RaceHandler,
) -> Register {
    Box::new(move |resume: Resume| {
        let racer = resume.fiber_id();
        let resume = Arc::new(Mutex::new(Some(resume)));
        observe_racer(&left, &right, on_left, &resume);
        observe_racer(&right, &left, on_right, &resume);
        Some(interrupt_and_await(vec![left, right], racer))
    })
}

fn observe_racer(
    winner: &Arc<FiberContext>,
    loser: &Arc<FiberContext>,
    handler: RaceHandler,
    resume: &Arc<Mutex<Option<Resume>>>,
) {
    let resume = Arc::clone(resume);
    let finished = Arc::clone(winner);
    let loser = Arc::clone(loser);
    winner.on_done(Box::new(move || {
        let taken = resume.lock().take();
        if let Some(resume) = taken {
            resume.resume(Instruction::Suspend(Box::new(move || {
                handler(finished.take_exit(), loser)
            })));
        }
    }));
}

fn guarded<T>(function: impl FnOnce() -> T) -> Result<T, Cause<Value>> {
    panic::catch_unwind(AssertUnwindSafe(function))
        .map_err(|payload| Cause::die(Defect::from_panic(payload)))
}

fn guarded_instruction(function: impl FnOnce() -> Instruction) -> Instruction {
    guarded(function).unwrap_or_else(Instruction::Fail)
}
